// Network configuration shared by the server and client roles.
//
// Loaded from TOML (every key optional, missing keys fall back to
// `NetConfig::default()`), or built in code. The same struct drives both
// roles: the server binds `bind_addr:port`, the client connects to
// `<host>:port`.
//
// Example:
//
//   port = 7878
//   application_id = "boardlink"
//   poll_interval_ms = 10
//   handshake_poll_limit = 500

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NetError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Interface the server listens on.
    pub bind_addr: String,
    /// TCP port for both roles. Port 0 lets the OS pick (server only).
    pub port: u16,
    /// Identifies the game; a client announcing a different one is rejected
    /// with `wrong-application`.
    pub application_id: String,
    /// Sleep between iterations of the reader loop and every wait loop.
    pub poll_interval_ms: u64,
    /// Socket read timeout used to make "read one line" non-wedging.
    pub read_timeout_ms: u64,
    /// Polling iterations a handshake step waits for its reply before the
    /// attempt is given up.
    pub handshake_poll_limit: u32,
    /// Sleep between accept attempts on the non-blocking listener.
    pub accept_poll_ms: u64,
    /// Client identities are the smallest unused multiple of this step.
    pub identity_step: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: 7878,
            application_id: "boardlink".into(),
            poll_interval_ms: 10,
            read_timeout_ms: 2,
            handshake_poll_limit: 500,
            accept_poll_ms: 20,
            identity_step: 10,
        }
    }
}

impl NetConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, NetError> {
        let config: NetConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, NetError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<(), NetError> {
        if self.identity_step == 0 {
            return Err(NetError::InvalidConfig("identity_step must be positive".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(NetError::InvalidConfig("read_timeout_ms must be positive".into()));
        }
        if self.application_id.is_empty() {
            return Err(NetError::InvalidConfig("application_id must not be empty".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}
