use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Admin transport parameters, shared by the client and server shims.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NetworkConfig {
    /// Listen address of the producer-side admin server.
    #[serde(default = "default_admin_listen_addr")]
    pub admin_listen_addr: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_in_ms: u64,

    /// Deadline for one admin request/response round trip.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_in_ms: u64,

    /// Upper bound on a single admin frame.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.admin_listen_addr.is_empty() {
            return Err(Error::InvalidConfig(
                "network.admin_listen_addr must not be empty".into(),
            ));
        }
        if self.request_timeout_in_ms == 0 {
            return Err(Error::InvalidConfig(
                "network.request_timeout_in_ms must be at least 1ms".into(),
            ));
        }
        if self.max_frame_len < 1024 {
            return Err(Error::InvalidConfig(
                "network.max_frame_len must be at least 1KiB".into(),
            ));
        }
        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            admin_listen_addr: default_admin_listen_addr(),
            connect_timeout_in_ms: default_connect_timeout(),
            request_timeout_in_ms: default_request_timeout(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

fn default_admin_listen_addr() -> String {
    "127.0.0.1:9999".to_string()
}

fn default_connect_timeout() -> u64 {
    3_000
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_max_frame_len() -> usize {
    16 * 1024 * 1024
}
