use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Producer-side topic feed parameters.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FeedConfig {
    /// Deadline for per-vbucket `StreamRequest` feedback after
    /// `StartVbStreams`.
    #[serde(default = "default_stream_request_timeout")]
    pub stream_request_timeout_in_ms: u64,

    /// Deadline for per-vbucket `StreamEnd` feedback after `EndVbStreams`.
    #[serde(default = "default_stream_end_timeout")]
    pub stream_end_timeout_in_ms: u64,

    /// Idle tick of the feed control loop, used to log back-channel depth.
    #[serde(default = "default_control_tick")]
    pub control_tick_in_ms: u64,
}

impl FeedConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stream_request_timeout_in_ms == 0 {
            return Err(Error::InvalidConfig(
                "feed.stream_request_timeout_in_ms must be at least 1ms".into(),
            ));
        }
        if self.stream_end_timeout_in_ms == 0 {
            return Err(Error::InvalidConfig(
                "feed.stream_end_timeout_in_ms must be at least 1ms".into(),
            ));
        }
        if self.control_tick_in_ms == 0 {
            return Err(Error::InvalidConfig(
                "feed.control_tick_in_ms must be at least 1ms".into(),
            ));
        }
        Ok(())
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            stream_request_timeout_in_ms: default_stream_request_timeout(),
            stream_end_timeout_in_ms: default_stream_end_timeout(),
            control_tick_in_ms: default_control_tick(),
        }
    }
}

fn default_stream_request_timeout() -> u64 {
    10_000
}

fn default_stream_end_timeout() -> u64 {
    10_000
}

fn default_control_tick() -> u64 {
    1_000
}
