// Shared base behavior of both connection roles.
//
// Each role owns one `ConnectionEngine`: a mailbox, a stopped flag, and one
// background reader thread. The reader loop is cooperative polling:
//
//   while not stopped:
//       for each envelope the role reads (at most one line per peer):
//           role.handle_message(envelope); queue it unless swallowed
//       sleep(poll_interval)
//
// Role-specific reading lives behind the `Endpoint` trait: the client reads
// its single socket, the server round-robins over every live record. Reads
// are bounded by a socket read timeout, so the loop never wedges on a quiet
// peer. I/O failures are handled inside `poll_inbound` by marking the peer
// disconnected; nothing propagates out of the thread.
//
// Consumers match messages by category, optional subtype and (server only)
// sender. The first match in arrival order is removed and returned.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use boardlink_protocol::{Category, ClientId, Envelope, Message, Subtype};
use tracing::{debug, trace};

use crate::lock;
use crate::mailbox::Mailbox;

/// The role-specific half of a connection, driven by the reader thread.
pub trait Endpoint: Send + Sync + 'static {
    fn engine(&self) -> &ConnectionEngine;

    /// Read at most one line from each live peer. Must not block longer than
    /// the socket read timeout per peer.
    fn poll_inbound(&self) -> Vec<Envelope>;

    /// Inspect an inbound envelope before it is queued. Returning `false`
    /// swallows it.
    fn handle_message(&self, envelope: &Envelope) -> bool;
}

/// Lets a blocking wait give up once the player it waits on is gone.
pub trait PlayerActivity {
    fn is_active(&self) -> bool;
}

impl<F: Fn() -> bool> PlayerActivity for F {
    fn is_active(&self) -> bool {
        self()
    }
}

pub struct ConnectionEngine {
    mailbox: Mailbox,
    stopped: AtomicBool,
    poll_interval: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionEngine {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            mailbox: Mailbox::new(),
            stopped: AtomicBool::new(false),
            poll_interval,
            reader: Mutex::new(None),
        }
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep one poll interval.
    pub fn pause(&self) {
        thread::sleep(self.poll_interval);
    }

    /// Stop the reader loop and wait for it to exit. Idempotent. Sockets are
    /// left to the role.
    pub fn close(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let handle = lock(&self.reader).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Remove and return the oldest message of `category` (and `subtype`,
    /// if given).
    pub fn next_message(&self, category: Category, subtype: Option<Subtype>) -> Option<Message> {
        self.next_envelope(category, subtype).map(|e| e.message)
    }

    /// Like `next_message`, but only from `sender`.
    pub fn next_message_from(
        &self,
        category: Category,
        subtype: Option<Subtype>,
        sender: ClientId,
    ) -> Option<Message> {
        self.mailbox
            .take_first(|e| e.sender == Some(sender) && e.message.matches(category, subtype))
            .map(|e| e.message)
    }

    /// Like `next_message`, keeping the sender.
    pub fn next_envelope(&self, category: Category, subtype: Option<Subtype>) -> Option<Envelope> {
        self.mailbox
            .take_first(|e| e.message.matches(category, subtype))
    }

    /// Whether a matching message is queued; nothing is removed.
    pub fn has_message(&self, category: Category, subtype: Option<Subtype>) -> bool {
        self.mailbox.contains(|e| e.message.matches(category, subtype))
    }

    /// Field `index` of `message`, header included.
    pub fn message_part(index: usize, message: Option<&Message>) -> Option<String> {
        message.and_then(|m| m.part(index)).map(str::to_string)
    }

    pub fn part_count(message: Option<&Message>) -> usize {
        message.map_or(0, Message::part_count)
    }
}

/// Start the reader thread for `endpoint`. A second call while a reader is
/// running does nothing.
pub fn spawn_reader<E: Endpoint>(endpoint: &Arc<E>, name: &str) -> io::Result<()> {
    let mut slot = lock(&endpoint.engine().reader);
    if slot.is_some() {
        return Ok(());
    }
    let endpoint = Arc::clone(endpoint);
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || reader_loop(&*endpoint))?;
    *slot = Some(handle);
    Ok(())
}

fn reader_loop<E: Endpoint>(endpoint: &E) {
    let engine = endpoint.engine();
    debug!("reader started");
    while !engine.is_stopped() {
        for envelope in endpoint.poll_inbound() {
            if endpoint.handle_message(&envelope) {
                trace!(sender = ?envelope.sender, line = %envelope.message.to_line(), "queued");
                engine.mailbox.push(envelope);
            }
        }
        engine.pause();
    }
    debug!("reader stopped");
}
