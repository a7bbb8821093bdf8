//! Consumer-side stream management: reconciles the authoritative index
//! topology against live producer topics.
mod monitor;
mod stream;
mod stream_manager;
mod topology;

pub use monitor::*;
pub use stream::*;
pub use stream_manager::*;
pub use topology::*;

#[cfg(test)]
mod topology_test;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

use crate::Result;

/// Authoritative index-topology store (external collaborator).
///
/// Control-plane state is not persisted; it is recovered from this store
/// on boot and kept aligned through its update notifications.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TopologyStore: Send + Sync {
    /// The global topology, or `None` when no index exists yet.
    async fn global_topology(&self) -> Result<Option<GlobalTopology>>;

    async fn topology_by_bucket(
        &self,
        bucket: &str,
    ) -> Result<IndexTopology>;

    /// Subscribe to raw topology-change payloads. Each payload decodes to
    /// one [`IndexTopology`].
    async fn listen_topology_updates(
        &self,
        listener: &str,
    ) -> Result<mpsc::Receiver<Bytes>>;
}
