//! Admin transport shim: request/response framing for the topic-level
//! control messages, a client for the consumer side and a server hosting
//! the producer-side topic feeds.
mod client;
mod frame;
mod server;

pub use client::*;
pub use server::*;

pub(crate) use frame::*;


use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::manager::StreamId;
use crate::proto::common::TsVbuuid;
use crate::proto::instance::Instance;
use crate::Result;

/// Stream administration against the remote mutation producers.
///
/// The consumer-side reconciler speaks this surface; the wire
/// implementation lives in [`AdminClient`]. There can be multiple
/// producers behind one stream; implementations encapsulate that
/// topology.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamAdmin: Send + Sync {
    /// Subscribe instances to the stream for the given buckets. With
    /// `request_ts` the producer (re)starts the carried vbuckets; without
    /// it, only the instance set changes.
    async fn add_index_to_stream(
        &self,
        stream_id: StreamId,
        buckets: Vec<String>,
        instances: Vec<Instance>,
        request_ts: Option<Vec<TsVbuuid>>,
    ) -> Result<()>;

    async fn delete_index_from_stream(
        &self,
        stream_id: StreamId,
        buckets: Vec<String>,
        instance_ids: Vec<u64>,
    ) -> Result<()>;

    async fn repair_endpoint_for_stream(
        &self,
        stream_id: StreamId,
        endpoint: String,
    ) -> Result<()>;

    async fn restart_stream_if_necessary(
        &self,
        stream_id: StreamId,
        timestamps: Vec<TsVbuuid>,
    ) -> Result<()>;
}
