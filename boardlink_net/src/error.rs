// Error type for the connection roles.
//
// Background threads never return these; they log and update connection
// state instead. Errors surface only from the blocking calls a caller made
// (handshake, waits, sends), as the negative result of that call.

use std::io;

use boardlink_protocol::{Category, ClientId, PayloadError, Subtype};

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    /// The peer answered the handshake with an error message
    /// (`name-exists`, `wrong-application`).
    #[error("rejected by peer: {}", .0.as_str())]
    Rejected(Subtype),

    #[error("peer sent abort")]
    Aborted,

    #[error("handshake got no {} reply in time", .0.as_str())]
    HandshakeTimeout(Subtype),

    #[error("handshake protocol violation: {0}")]
    Protocol(String),

    /// The set of connected peers changed while waiting.
    #[error("a peer dropped out while waiting for {}", .0.as_str())]
    PeerDropped(Category),

    #[error("player is no longer active")]
    PlayerInactive,

    #[error("send failed for {failed} of {attempted} peers")]
    BroadcastIncomplete { failed: usize, attempted: usize },

    #[error("no client at index {0}")]
    UnknownClient(usize),

    #[error("no slot for client {0}")]
    UnknownIdentity(ClientId),

    #[error("server is not started")]
    NotStarted,

    #[error("config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}
