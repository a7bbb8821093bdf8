use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Consumer-side stream manager parameters.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ManagerConfig {
    /// Base of the fixed stream-id to listening-port mapping.
    #[serde(default = "default_stream_port_base")]
    pub stream_port_base: u16,

    /// Host published to producers as the receive address for streams.
    #[serde(default = "default_local_host")]
    pub local_host: String,

    /// A vbucket whose heartbeats stall longer than this is considered a
    /// candidate for `RestartStreamIfNecessary`.
    #[serde(default = "default_heartbeat_stall")]
    pub heartbeat_stall_in_ms: u64,

    /// Probe interval of the stream monitor.
    #[serde(default = "default_monitor_tick")]
    pub monitor_tick_in_ms: u64,
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stream_port_base == 0 {
            return Err(Error::InvalidConfig(
                "manager.stream_port_base must be non-zero".into(),
            ));
        }
        if self.monitor_tick_in_ms == 0 {
            return Err(Error::InvalidConfig(
                "manager.monitor_tick_in_ms must be at least 1ms".into(),
            ));
        }
        if self.heartbeat_stall_in_ms < self.monitor_tick_in_ms {
            return Err(Error::InvalidConfig(
                "manager.heartbeat_stall_in_ms must not be shorter than the monitor tick".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            stream_port_base: default_stream_port_base(),
            local_host: default_local_host(),
            heartbeat_stall_in_ms: default_heartbeat_stall(),
            monitor_tick_in_ms: default_monitor_tick(),
        }
    }
}

fn default_stream_port_base() -> u16 {
    9100
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_heartbeat_stall() -> u64 {
    30_000
}

fn default_monitor_tick() -> u64 {
    5_000
}
