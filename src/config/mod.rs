//! Configuration for the mutation-stream control plane.
//!
//! Hierarchical loading with the usual precedence:
//! 1. Type defaults as the code base line
//! 2. Configuration file named by the `CONFIG_PATH` environment variable
//! 3. Environment variables with the `VBFLOW__` prefix (highest priority)
mod feed;
mod manager;
mod monitoring;
mod network;

pub use feed::*;
pub use manager::*;
pub use monitoring::*;
pub use network::*;


use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Main configuration container for the control-plane components.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct VbflowConfig {
    /// Producer-side topic feed parameters
    pub feed: FeedConfig,
    /// Consumer-side stream manager parameters
    pub manager: ManagerConfig,
    /// Admin transport parameters
    pub network: NetworkConfig,
    /// Metrics and monitoring settings
    pub monitoring: MonitoringConfig,
}

impl VbflowConfig {
    /// Load and validate the merged configuration.
    ///
    /// ```ignore
    /// std::env::set_var("CONFIG_PATH", "config/vbflow.toml");
    /// std::env::set_var("VBFLOW__FEED__STREAM_REQUEST_TIMEOUT_IN_MS", "5000");
    /// let cfg = VbflowConfig::new()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path));
        }

        builder = builder.add_source(Environment::with_prefix("VBFLOW").separator("__"));

        let config: VbflowConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.feed.validate()?;
        self.manager.validate()?;
        self.network.validate()?;
        Ok(())
    }
}
