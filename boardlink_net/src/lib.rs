// boardlink_net: server and client roles for lock-step multiplayer sessions.
//
// One server process and several client processes talk over TCP using the
// line-oriented messages of `boardlink_protocol`. The game engine drives the
// session through blocking "wait until everyone acknowledged" and "wait for
// the next state/move" calls; all network I/O happens on background threads.
//
// Module overview:
// - `config.rs`:   `NetConfig`, loaded from TOML.
// - `error.rs`:    `NetError`, returned by blocking calls.
// - `record.rs`:   `LineLink` (line read/write pair over a socket) and
//                  `ConnectionRecord` (identity + lifecycle of one peer).
// - `mailbox.rs`:  Arrival-ordered buffer of received envelopes.
// - `engine.rs`:   `ConnectionEngine` (mailbox, stop flag, reader thread),
//                  the `Endpoint` role seam and `PlayerActivity`.
// - `client.rs`:   `ClientConnection`: background handshake, blocking
//                  waits for server state/moves, non-blocking queries.
// - `server.rs`:   `ServerConnection`: client registry, one accept thread
//                  per slot, broadcast, barrier waits, eviction policy.
//
// Threads: one reader per role instance (the server's reader round-robins
// over all clients), one handshake thread per client connect, one accept
// thread per pending server slot. Shared state is the mailbox and the
// registry, each behind a `Mutex`.
//
// Connections are explicit objects; there are no process-wide singletons.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod mailbox;
pub mod record;
pub mod server;

pub use client::ClientConnection;
pub use config::NetConfig;
pub use engine::{ConnectionEngine, Endpoint, PlayerActivity};
pub use error::NetError;
pub use server::{ClientMove, ClientSummary, ServerConnection};

/// Lock a mutex, recovering the data if another thread panicked while
/// holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
