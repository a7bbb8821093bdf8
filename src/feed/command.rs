//! Typed commands and feedback messages of the topic feed actor.

use tokio::sync::oneshot;

use crate::mutation::StreamStatus;
use crate::proto::topic::AddBucketsRequest;
use crate::proto::topic::AddInstancesRequest;
use crate::proto::topic::DelBucketsRequest;
use crate::proto::topic::DelInstancesRequest;
use crate::proto::topic::MutationTopicRequest;
use crate::proto::topic::RepairEndpointsRequest;
use crate::proto::topic::RestartVbucketsRequest;
use crate::proto::topic::ShutdownVbucketsRequest;
use crate::proto::topic::TimestampResponse;
use crate::proto::topic::TopicResponse;
use crate::Result;

/// One control operation, with the reply channel its caller blocks on.
pub(crate) enum FeedCommand {
    Start {
        req: MutationTopicRequest,
        resp_tx: oneshot::Sender<Result<TopicResponse>>,
    },
    RestartVbuckets {
        req: RestartVbucketsRequest,
        resp_tx: oneshot::Sender<Result<TopicResponse>>,
    },
    ShutdownVbuckets {
        req: ShutdownVbucketsRequest,
        resp_tx: oneshot::Sender<Result<()>>,
    },
    AddBuckets {
        req: AddBucketsRequest,
        resp_tx: oneshot::Sender<Result<TopicResponse>>,
    },
    DelBuckets {
        req: DelBucketsRequest,
        resp_tx: oneshot::Sender<Result<()>>,
    },
    AddInstances {
        req: AddInstancesRequest,
        resp_tx: oneshot::Sender<Result<TimestampResponse>>,
    },
    DelInstances {
        req: DelInstancesRequest,
        resp_tx: oneshot::Sender<Result<TopicResponse>>,
    },
    RepairEndpoints {
        req: RepairEndpointsRequest,
        resp_tx: oneshot::Sender<Result<()>>,
    },
    GetStatistics {
        resp_tx: oneshot::Sender<serde_json::Value>,
    },
    Shutdown {
        resp_tx: oneshot::Sender<Result<()>>,
    },
}

/// Asynchronous per-vbucket feedback posted by the data path on the topic
/// back-channel, correlated to its control op by `(bucket, opaque)`.
#[derive(Clone, Debug)]
pub(crate) enum Feedback {
    StreamRequest {
        bucket: String,
        kvaddr: String,
        opaque: u32,
        status: StreamStatus,
        vbno: u16,
        vbuuid: u64,
        seqno: u64,
    },
    StreamEnd {
        bucket: String,
        kvaddr: String,
        opaque: u32,
        status: StreamStatus,
        vbno: u16,
    },
}

impl Feedback {
    pub(crate) fn bucket(&self) -> &str {
        match self {
            Feedback::StreamRequest { bucket, .. } => bucket,
            Feedback::StreamEnd { bucket, .. } => bucket,
        }
    }

    pub(crate) fn opaque(&self) -> u32 {
        match self {
            Feedback::StreamRequest { opaque, .. } => *opaque,
            Feedback::StreamEnd { opaque, .. } => *opaque,
        }
    }
}
