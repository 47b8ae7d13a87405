// Core identity and lifecycle types shared by both connection roles.
//
// `ClientId` is the compact server-assigned identity of one client slot; it is
// what the server tags every inbound message with (see `Envelope` in
// `message.rs`). `ConnectionState` is the per-peer lifecycle used by the
// connection records in `boardlink_net`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Server-assigned client identity. Unique while the client is connected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ClientId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(ClientId)
    }
}

/// Lifecycle of one peer connection.
///
/// `NotUsed` marks a server slot that was reserved but never attempted.
/// Otherwise a connection moves `Disconnected → Connecting → Connected` and
/// drops back to `Disconnected` on any failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    NotUsed,
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// True while a socket is associated with the peer.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::NotUsed => "not-used",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}
