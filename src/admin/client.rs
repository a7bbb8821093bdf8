//! Consumer-side admin client: typed topic-control requests over a framed
//! TCP connection, plus the [`StreamAdmin`] mapping used by the stream
//! manager.

use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use futures::SinkExt;
use futures::StreamExt;
use prost::Message;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::frame::*;
use super::StreamAdmin;
use crate::config::NetworkConfig;
use crate::manager::StreamId;
use crate::metrics::ADMIN_REQUEST_DURATION_METRIC;
use crate::metrics::ADMIN_REQUEST_METRIC;
use crate::proto::common::TsVbuuid;
use crate::proto::instance::Instance;
use crate::proto::topic::*;
use crate::Error;
use crate::NetworkError;
use crate::Result;

type AdminConn = Framed<TcpStream, LengthDelimitedCodec>;

/// Client half of the admin transport. One lazily-established connection,
/// re-dialed after any transport failure; requests are serialized.
pub struct AdminClient {
    addr: String,
    config: NetworkConfig,
    conn: Mutex<Option<AdminConn>>,
}

impl AdminClient {
    pub fn new(
        addr: &str,
        config: NetworkConfig,
    ) -> Self {
        AdminClient {
            addr: addr.to_string(),
            config,
            conn: Mutex::new(None),
        }
    }

    pub async fn mutation_topic(
        &self,
        req: MutationTopicRequest,
    ) -> Result<TopicResponse> {
        let resp: TopicResponse = self.round_trip(TAG_MUTATION_TOPIC, &req, "mutation_topic").await?;
        if resp.is_ok() {
            Ok(resp)
        } else {
            Err(NetworkError::Remote(resp.error).into())
        }
    }

    pub async fn restart_vbuckets(
        &self,
        req: RestartVbucketsRequest,
    ) -> Result<TopicResponse> {
        let resp: TopicResponse =
            self.round_trip(TAG_RESTART_VBUCKETS, &req, "restart_vbuckets").await?;
        if resp.is_ok() {
            Ok(resp)
        } else {
            Err(NetworkError::Remote(resp.error).into())
        }
    }

    pub async fn shutdown_vbuckets(
        &self,
        req: ShutdownVbucketsRequest,
    ) -> Result<()> {
        let resp: ErrorResponse =
            self.round_trip(TAG_SHUTDOWN_VBUCKETS, &req, "shutdown_vbuckets").await?;
        resp.into_result().map_err(|e| NetworkError::Remote(e).into())
    }

    pub async fn add_buckets(
        &self,
        req: AddBucketsRequest,
    ) -> Result<TopicResponse> {
        let resp: TopicResponse = self.round_trip(TAG_ADD_BUCKETS, &req, "add_buckets").await?;
        if resp.is_ok() {
            Ok(resp)
        } else {
            Err(NetworkError::Remote(resp.error).into())
        }
    }

    pub async fn del_buckets(
        &self,
        req: DelBucketsRequest,
    ) -> Result<()> {
        let resp: ErrorResponse = self.round_trip(TAG_DEL_BUCKETS, &req, "del_buckets").await?;
        resp.into_result().map_err(|e| NetworkError::Remote(e).into())
    }

    pub async fn add_instances(
        &self,
        req: AddInstancesRequest,
    ) -> Result<TimestampResponse> {
        let resp: TimestampResponse =
            self.round_trip(TAG_ADD_INSTANCES, &req, "add_instances").await?;
        if resp.is_ok() {
            Ok(resp)
        } else {
            Err(NetworkError::Remote(resp.error).into())
        }
    }

    pub async fn del_instances(
        &self,
        req: DelInstancesRequest,
    ) -> Result<TopicResponse> {
        let resp: TopicResponse = self.round_trip(TAG_DEL_INSTANCES, &req, "del_instances").await?;
        if resp.is_ok() {
            Ok(resp)
        } else {
            Err(NetworkError::Remote(resp.error).into())
        }
    }

    pub async fn repair_endpoints(
        &self,
        req: RepairEndpointsRequest,
    ) -> Result<()> {
        let resp: ErrorResponse =
            self.round_trip(TAG_REPAIR_ENDPOINTS, &req, "repair_endpoints").await?;
        resp.into_result().map_err(|e| NetworkError::Remote(e).into())
    }

    pub async fn shutdown_topic(
        &self,
        req: ShutdownTopicRequest,
    ) -> Result<()> {
        let resp: ErrorResponse =
            self.round_trip(TAG_SHUTDOWN_TOPIC, &req, "shutdown_topic").await?;
        resp.into_result().map_err(|e| NetworkError::Remote(e).into())
    }

    pub async fn vbmap(
        &self,
        req: VbmapRequest,
    ) -> Result<VbmapResponse> {
        let resp: VbmapResponse = self.round_trip(TAG_VBMAP, &req, "vbmap").await?;
        if resp.error.is_empty() {
            Ok(resp)
        } else {
            Err(NetworkError::Remote(resp.error).into())
        }
    }

    pub async fn failover_log(
        &self,
        req: FailoverLogRequest,
    ) -> Result<FailoverLogResponse> {
        let resp: FailoverLogResponse =
            self.round_trip(TAG_FAILOVER_LOG, &req, "failover_log").await?;
        if resp.error.is_empty() {
            Ok(resp)
        } else {
            Err(NetworkError::Remote(resp.error).into())
        }
    }

    // ---- transport

    async fn connect(&self) -> Result<AdminConn> {
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_in_ms);
        let stream = timeout(connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| NetworkError::RequestTimeout(connect_timeout))?
            .map_err(|err| NetworkError::ConnectionError(format!("{}: {err}", self.addr)))?;
        debug!("admin client connected to {}", self.addr);
        Ok(Framed::new(stream, admin_codec(self.config.max_frame_len)))
    }

    async fn round_trip<Req, Resp>(
        &self,
        tag: u8,
        req: &Req,
        kind: &str,
    ) -> Result<Resp>
    where
        Req: Message,
        Resp: Message + Default,
    {
        ADMIN_REQUEST_METRIC.with_label_values(&[kind]).inc();
        let started = Instant::now();

        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let conn = guard.as_mut().expect("connection established above");

        let request_timeout = Duration::from_millis(self.config.request_timeout_in_ms);
        let exchange = async {
            conn.send(encode_frame(tag, req)).await.map_err(NetworkError::Io)?;
            match conn.next().await {
                Some(Ok(frame)) => Ok(frame),
                Some(Err(err)) => Err(NetworkError::Io(err)),
                None => Err(NetworkError::ConnectionError(format!(
                    "{} closed the admin connection",
                    self.addr
                ))),
            }
        };

        let frame = match timeout(request_timeout, exchange).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                // force a re-dial on the next request
                *guard = None;
                return Err(err.into());
            }
            Err(_) => {
                *guard = None;
                return Err(NetworkError::RequestTimeout(request_timeout).into());
            }
        };

        ADMIN_REQUEST_DURATION_METRIC
            .with_label_values(&[kind])
            .observe(started.elapsed().as_millis() as f64);

        let (resp_tag, payload) = split_frame(frame)?;
        if resp_tag != tag {
            *guard = None;
            return Err(NetworkError::UnknownFrame(resp_tag).into());
        }
        decode_payload(payload)
    }
}

/// True when the remote reported that the topic has not been created yet.
fn topic_missing(err: &Error) -> bool {
    matches!(err, Error::Network(NetworkError::Remote(msg)) if msg.contains("feed.topicMissing"))
}

#[async_trait]
impl StreamAdmin for AdminClient {
    /// Adding instances to a topic that does not exist yet falls back to
    /// creating the topic with the supplied request timestamps.
    async fn add_index_to_stream(
        &self,
        stream_id: StreamId,
        buckets: Vec<String>,
        instances: Vec<Instance>,
        request_ts: Option<Vec<TsVbuuid>>,
    ) -> Result<()> {
        debug!("add_index_to_stream {} buckets {:?}", stream_id, buckets);
        let topic = stream_id.topic_name().to_string();
        let req = AddInstancesRequest {
            topic: topic.clone(),
            instances: instances.clone(),
        };
        match self.add_instances(req).await {
            Ok(_) => Ok(()),
            Err(err) if topic_missing(&err) => {
                info!("topic {} missing, creating it", topic);
                let req = MutationTopicRequest {
                    topic,
                    endpoint_type: "dataport".to_string(),
                    req_timestamps: request_ts.unwrap_or_default(),
                    instances,
                    version: 0,
                };
                let resp = self.mutation_topic(req).await?;
                if !resp.rollback_timestamps.is_empty() {
                    warn!(
                        "topic {} created with {} rollback timestamps",
                        resp.topic,
                        resp.rollback_timestamps.len()
                    );
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn delete_index_from_stream(
        &self,
        stream_id: StreamId,
        buckets: Vec<String>,
        instance_ids: Vec<u64>,
    ) -> Result<()> {
        debug!("delete_index_from_stream {} buckets {:?}", stream_id, buckets);
        let req = DelInstancesRequest {
            topic: stream_id.topic_name().to_string(),
            instance_ids,
        };
        self.del_instances(req).await.map(|_| ())
    }

    async fn repair_endpoint_for_stream(
        &self,
        stream_id: StreamId,
        endpoint: String,
    ) -> Result<()> {
        let req = RepairEndpointsRequest {
            topic: stream_id.topic_name().to_string(),
            endpoints: vec![endpoint],
        };
        self.repair_endpoints(req).await
    }

    async fn restart_stream_if_necessary(
        &self,
        stream_id: StreamId,
        timestamps: Vec<TsVbuuid>,
    ) -> Result<()> {
        let req = RestartVbucketsRequest {
            topic: stream_id.topic_name().to_string(),
            restart_timestamps: timestamps,
        };
        let resp = self.restart_vbuckets(req).await?;
        if !resp.rollback_timestamps.is_empty() {
            warn!(
                "restart of {} answered with {} rollback timestamps",
                resp.topic,
                resp.rollback_timestamps.len()
            );
        }
        Ok(())
    }
}
