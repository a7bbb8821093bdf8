//! Error hierarchy for the mutation-stream control plane.
//!
//! Errors are categorized by subsystem: topic feed control, consumer-side
//! stream management, scan-facing surfaces and transport plumbing.

use std::time::Duration;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Producer-side topic feed failures
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// Consumer-side stream management failures
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Failures surfaced to the scan/query path
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// Transport and channel plumbing failures
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Invalid configuration value detected by component validation
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Unrecoverable failures requiring a controlled shutdown
    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Errors returned by control operations on a topic feed.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Operation references a bucket that is not currently streaming.
    #[error("feed.invalidBucket: {0}")]
    InvalidBucket(String),

    /// Request timestamp's vbuuid disagrees with the producer failover log.
    #[error("feed.invalidVbucketBranch: bucket {0}")]
    InvalidVbucketBranch(String),

    /// Evaluator and router sets disagree in size or key set.
    #[error("feed.inconsistentFeed")]
    InconsistentFeed,

    /// Per-vbucket feedback for a control operation did not arrive in time.
    #[error("feed.responseTimeout")]
    ResponseTimeout,

    /// The feed has been shut down; its request channel is closed.
    #[error("feed.closed: {0}")]
    Closed(String),

    /// Operation references a topic this node does not host.
    #[error("feed.topicMissing: {0}")]
    TopicMissing(String),
}

/// Errors returned by the consumer-side stream manager.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Operation targets a stream that has not been started.
    #[error("stream not open: {0}")]
    StreamNotOpen(String),

    /// The indexer is still bootstrapping; stream operations are refused.
    #[error("indexer in bootstrap")]
    IndexerInBootstrap,

    /// A topology-change payload did not decode to an index topology.
    #[error("malformed topology payload: {0}")]
    MalformedTopology(String),
}

/// Errors surfaced to the (out-of-scope) scan/query path.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("index not ready")]
    IndexNotReady,

    #[error("index not found")]
    IndexNotFound,

    /// Session vbuuids disagree with the snapshot's vbuuids.
    #[error("mismatch in session vbuuids")]
    VbuuidMismatch,

    /// The client cancelled the request.
    #[error("client cancelled")]
    ClientCancel,

    #[error("scan timed out")]
    ScanTimedOut,

    #[error("no snapshot available for scan")]
    SnapshotNotAvailable,
}

/// Transport-layer and channel plumbing failures.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o failure on admin connection: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame decode failed: {0}")]
    FrameDecode(#[from] prost::DecodeError),

    /// An unknown tag byte arrived on the admin transport.
    #[error("unknown admin frame tag: {0:#x}")]
    UnknownFrame(u8),

    /// A channel peer went away while a send or receive was in flight.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The producer answered a control request with an application error.
    #[error("remote error: {0}")]
    Remote(String),
}

impl Error {
    /// True when the error is the per-operation feedback timeout, which the
    /// caller is expected to retry after reconciliation.
    pub fn is_response_timeout(&self) -> bool {
        matches!(self, Error::Feed(FeedError::ResponseTimeout))
    }

    /// True when the target feed has already been shut down.
    pub fn is_feed_closed(&self) -> bool {
        matches!(self, Error::Feed(FeedError::Closed(_)))
    }
}

#[cfg(test)]
mod errors_test {
    use super::*;

    #[test]
    fn feed_error_surfaces_legacy_labels() {
        let err: Error = FeedError::InvalidBucket("beer-sample".into()).into();
        assert!(err.to_string().contains("feed.invalidBucket"));

        let err: Error = FeedError::ResponseTimeout.into();
        assert!(err.is_response_timeout());
        assert!(!err.is_feed_closed());
    }

    #[test]
    fn network_error_wraps_io() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err: Error = NetworkError::from(io).into();
        assert!(err.to_string().contains("peer reset"));
    }

    #[test]
    fn stream_not_open_names_the_stream() {
        let err: Error = StreamError::StreamNotOpen("MAINT_STREAM".into()).into();
        assert_eq!(err.to_string(), "stream not open: MAINT_STREAM");
    }
}
