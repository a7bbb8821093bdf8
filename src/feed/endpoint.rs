//! Downstream endpoint handles and their factory.

use std::sync::Arc;

use async_trait::async_trait;

use super::engine::ProjectedRecord;
use crate::Result;

/// Opaque downstream connection that receives projected records.
///
/// Handles are cached per topic and shared by every kv-data path routing to
/// the same address; liveness is probed with [`RouterEndpoint::ping`] and a
/// dead handle is lazily re-created through the [`EndpointFactory`].
#[async_trait]
pub trait RouterEndpoint: Send + Sync {
    /// Liveness probe; `false` marks the handle for repair.
    fn ping(&self) -> bool;

    async fn send(
        &self,
        record: ProjectedRecord,
    ) -> Result<()>;

    fn get_statistics(&self) -> serde_json::Value;

    /// Tear the connection down; subsequent sends fail.
    async fn close(&self) -> Result<()>;
}

/// Creates an endpoint handle for `(topic, raddr)`.
pub type EndpointFactory =
    Arc<dyn Fn(&str, &str) -> Result<Arc<dyn RouterEndpoint>> + Send + Sync>;
