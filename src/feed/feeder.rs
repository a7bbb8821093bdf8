//! Upstream contracts: the per-bucket feeder and the producer-cluster
//! metadata client it is opened from.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::mutation::Mutation;
use crate::proto::common::FailoverLog;
use crate::proto::common::TsVbuuid;
use crate::Result;

/// One producer connection for one bucket on one topic.
///
/// Stream controls are tagged with the caller's opaque; the producer echoes
/// it on the per-vbucket `StreamBegin`/`StreamEnd` events that arrive on
/// the mutation channel. The feeder never retries; errors go back to the
/// controller, which owns policy. Events arriving after [`close_feed`]
/// must be dropped silently.
///
/// [`close_feed`]: BucketFeeder::close_feed
#[async_trait]
pub trait BucketFeeder: Send + Sync {
    /// Request streams for the vbuckets listed in `ts`, starting at its
    /// seqnos/vbuuids. One feedback event per vbucket follows.
    async fn start_vb_streams(
        &self,
        opaque: u32,
        ts: &TsVbuuid,
    ) -> Result<()>;

    /// Request shutdown of the vbuckets listed in `ts`. One `StreamEnd`
    /// per vbucket follows.
    async fn end_vb_streams(
        &self,
        opaque: u32,
        ts: &TsVbuuid,
    ) -> Result<()>;

    /// The single inbound channel carrying mutation events for every
    /// vbucket of this bucket. Yields the receiver exactly once.
    fn take_channel(&self) -> Option<mpsc::Receiver<Mutation>>;

    /// Tear down the producer connection.
    async fn close_feed(&self) -> Result<()>;
}

/// Metadata and feed factory for one bucket of the producer cluster.
#[async_trait]
pub trait BucketClient: Send + Sync {
    /// Refresh the cached vbucket map before reading it.
    async fn refresh(&self) -> Result<()>;

    /// Vbuckets hosted by each of `kvaddrs`.
    async fn vbmap(
        &self,
        kvaddrs: &[String],
    ) -> Result<HashMap<String, Vec<u16>>>;

    /// Failover logs for `vbnos`, newest branch first in each log.
    async fn failover_logs(
        &self,
        vbnos: &[u16],
    ) -> Result<Vec<FailoverLog>>;

    /// Open the mutation feed for this bucket.
    async fn open_feed(&self) -> Result<Arc<dyn BucketFeeder>>;
}

/// Connection surface of the producer cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn open_bucket(
        &self,
        pool: &str,
        bucket: &str,
    ) -> Result<Arc<dyn BucketClient>>;
}
