use serde::Deserialize;
use serde::Serialize;

/// Metrics and monitoring settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MonitoringConfig {
    /// Namespace prepended to every exported metric.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Whether the stream monitor probes vbucket heartbeats.
    #[serde(default = "default_enable_stream_monitor")]
    pub enable_stream_monitor: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            namespace: default_namespace(),
            enable_stream_monitor: default_enable_stream_monitor(),
        }
    }
}

fn default_namespace() -> String {
    "vbflow".to_string()
}

fn default_enable_stream_monitor() -> bool {
    true
}
