//! Producer-side admin server: hosts the topic feeds of one node and
//! dispatches framed control requests to them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Once;

use bytes::Bytes;
use bytes::BytesMut;
use futures::SinkExt;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::frame::*;
use crate::config::VbflowConfig;
use crate::feed::ClusterClient;
use crate::feed::EndpointFactory;
use crate::feed::Feed;
use crate::feed::FeedSettings;
use crate::metrics::register_custom_metrics;
use crate::metrics::ACTIVE_TOPIC_METRIC;
use crate::metrics::ADMIN_REQUEST_METRIC;
use crate::metrics::CUSTOM_REGISTRY;
use crate::proto::topic::*;
use crate::Error;
use crate::FeedError;
use crate::NetworkError;
use crate::Result;

static REGISTER_METRICS: Once = Once::new();

/// Construction context shared by every feed this node hosts.
pub struct ProjectorContext {
    /// Producer-cluster address.
    pub cluster: String,
    /// Advertised address of this node, for feed log prefixes.
    pub local_addr: String,
    /// Producer nodes to stream from.
    pub kvaddrs: Vec<String>,
    pub cluster_client: Arc<dyn ClusterClient>,
    pub endpoint_factory: EndpointFactory,
}

struct Shared {
    ctx: ProjectorContext,
    config: VbflowConfig,
    topics: Mutex<HashMap<String, Feed>>,
}

/// Handle to the running admin server.
pub struct AdminServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
}

impl AdminServer {
    /// Bind the configured listen address and start serving admin
    /// connections.
    pub async fn serve(
        ctx: ProjectorContext,
        config: VbflowConfig,
    ) -> Result<AdminServer> {
        REGISTER_METRICS.call_once(|| register_custom_metrics(&CUSTOM_REGISTRY));

        let listener = TcpListener::bind(&config.network.admin_listen_addr)
            .await
            .map_err(|err| NetworkError::Bind {
                addr: config.network.admin_listen_addr.clone(),
                source: err,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(NetworkError::Io)?;
        info!("admin server listening on {}", local_addr);

        let shared = Arc::new(Shared {
            ctx,
            config,
            topics: Mutex::new(HashMap::new()),
        });
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        info!("admin server on {} shutting down", local_addr);
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("admin connection from {}", peer);
                            tokio::spawn(handle_conn(stream, accept_shared.clone()));
                        }
                        Err(err) => {
                            error!("admin accept failed: {}", err);
                            break;
                        }
                    }
                }
            }
        });

        Ok(AdminServer {
            local_addr,
            shared,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Feed hosted for `topic`, if any.
    pub async fn topic_feed(
        &self,
        topic: &str,
    ) -> Option<Feed> {
        self.shared.topics.lock().await.get(topic).cloned()
    }

    /// Stop accepting connections and shut down every hosted feed.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let mut topics = self.shared.topics.lock().await;
        for (name, feed) in topics.drain() {
            if let Err(err) = feed.shutdown().await {
                warn!("shutdown of topic {} failed: {}", name, err);
            }
        }
        ACTIVE_TOPIC_METRIC
            .with_label_values(&[&self.shared.ctx.local_addr])
            .set(0);
    }
}

async fn handle_conn(
    stream: TcpStream,
    shared: Arc<Shared>,
) {
    let max_frame_len = shared.config.network.max_frame_len;
    let mut framed = Framed::new(stream, admin_codec(max_frame_len));

    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!("admin connection error: {}", err);
                break;
            }
        };
        let response = dispatch(&shared, frame).await;
        if let Err(err) = framed.send(response).await {
            warn!("admin response write failed: {}", err);
            break;
        }
    }
}

async fn dispatch(
    shared: &Shared,
    frame: BytesMut,
) -> Bytes {
    let (tag, payload) = match split_frame(frame) {
        Ok(parts) => parts,
        Err(err) => {
            return encode_frame(0, &ErrorResponse::failure(&err));
        }
    };
    ADMIN_REQUEST_METRIC.with_label_values(&[kind_label(tag)]).inc();

    match tag {
        TAG_MUTATION_TOPIC => match decode_payload::<MutationTopicRequest>(payload) {
            Ok(req) => {
                let topic = req.topic.clone();
                let feed = get_or_create_feed(shared, &topic).await;
                topic_frame(tag, &topic, feed.mutation_topic(req).await)
            }
            Err(err) => topic_frame(tag, "", Err(err)),
        },
        TAG_RESTART_VBUCKETS => match decode_payload::<RestartVbucketsRequest>(payload) {
            Ok(req) => {
                let topic = req.topic.clone();
                match lookup_feed(shared, &topic).await {
                    Ok(feed) => topic_frame(tag, &topic, feed.restart_vbuckets(req).await),
                    Err(err) => topic_frame(tag, &topic, Err(err)),
                }
            }
            Err(err) => topic_frame(tag, "", Err(err)),
        },
        TAG_SHUTDOWN_VBUCKETS => match decode_payload::<ShutdownVbucketsRequest>(payload) {
            Ok(req) => match lookup_feed(shared, &req.topic).await {
                Ok(feed) => error_frame(tag, feed.shutdown_vbuckets(req).await),
                Err(err) => error_frame(tag, Err(err)),
            },
            Err(err) => error_frame(tag, Err(err)),
        },
        TAG_ADD_BUCKETS => match decode_payload::<AddBucketsRequest>(payload) {
            Ok(req) => {
                let topic = req.topic.clone();
                match lookup_feed(shared, &topic).await {
                    Ok(feed) => topic_frame(tag, &topic, feed.add_buckets(req).await),
                    Err(err) => topic_frame(tag, &topic, Err(err)),
                }
            }
            Err(err) => topic_frame(tag, "", Err(err)),
        },
        TAG_DEL_BUCKETS => match decode_payload::<DelBucketsRequest>(payload) {
            Ok(req) => match lookup_feed(shared, &req.topic).await {
                Ok(feed) => error_frame(tag, feed.del_buckets(req).await),
                Err(err) => error_frame(tag, Err(err)),
            },
            Err(err) => error_frame(tag, Err(err)),
        },
        TAG_ADD_INSTANCES => match decode_payload::<AddInstancesRequest>(payload) {
            Ok(req) => {
                let topic = req.topic.clone();
                match lookup_feed(shared, &topic).await {
                    Ok(feed) => timestamp_frame(tag, &topic, feed.add_instances(req).await),
                    Err(err) => timestamp_frame(tag, &topic, Err(err)),
                }
            }
            Err(err) => timestamp_frame(tag, "", Err(err)),
        },
        TAG_DEL_INSTANCES => match decode_payload::<DelInstancesRequest>(payload) {
            Ok(req) => {
                let topic = req.topic.clone();
                match lookup_feed(shared, &topic).await {
                    Ok(feed) => topic_frame(tag, &topic, feed.del_instances(req).await),
                    Err(err) => topic_frame(tag, &topic, Err(err)),
                }
            }
            Err(err) => topic_frame(tag, "", Err(err)),
        },
        TAG_REPAIR_ENDPOINTS => match decode_payload::<RepairEndpointsRequest>(payload) {
            Ok(req) => match lookup_feed(shared, &req.topic).await {
                Ok(feed) => error_frame(tag, feed.repair_endpoints(req).await),
                Err(err) => error_frame(tag, Err(err)),
            },
            Err(err) => error_frame(tag, Err(err)),
        },
        TAG_SHUTDOWN_TOPIC => match decode_payload::<ShutdownTopicRequest>(payload) {
            Ok(req) => {
                let feed = shared.topics.lock().await.remove(&req.topic);
                match feed {
                    Some(feed) => {
                        ACTIVE_TOPIC_METRIC
                            .with_label_values(&[&shared.ctx.local_addr])
                            .dec();
                        error_frame(tag, feed.shutdown().await)
                    }
                    None => error_frame(tag, Err(FeedError::TopicMissing(req.topic).into())),
                }
            }
            Err(err) => error_frame(tag, Err(err)),
        },
        TAG_VBMAP => match decode_payload::<VbmapRequest>(payload) {
            Ok(req) => encode_frame(tag, &vbmap_response(shared, req).await),
            Err(err) => encode_frame(
                tag,
                &VbmapResponse {
                    error: err.to_string(),
                    ..Default::default()
                },
            ),
        },
        TAG_FAILOVER_LOG => match decode_payload::<FailoverLogRequest>(payload) {
            Ok(req) => encode_frame(tag, &failover_log_response(shared, req).await),
            Err(err) => encode_frame(
                tag,
                &FailoverLogResponse {
                    error: err.to_string(),
                    ..Default::default()
                },
            ),
        },
        unknown => {
            let err: Error = NetworkError::UnknownFrame(unknown).into();
            encode_frame(unknown, &ErrorResponse::failure(&err))
        }
    }
}

async fn get_or_create_feed(
    shared: &Shared,
    topic: &str,
) -> Feed {
    let mut topics = shared.topics.lock().await;
    if let Some(feed) = topics.get(topic) {
        return feed.clone();
    }
    let settings = FeedSettings {
        cluster: shared.ctx.cluster.clone(),
        local_addr: shared.ctx.local_addr.clone(),
        kvaddrs: shared.ctx.kvaddrs.clone(),
    };
    let feed = Feed::new(
        topic,
        settings,
        shared.ctx.cluster_client.clone(),
        shared.ctx.endpoint_factory.clone(),
        shared.config.feed.clone(),
    );
    topics.insert(topic.to_string(), feed.clone());
    ACTIVE_TOPIC_METRIC
        .with_label_values(&[&shared.ctx.local_addr])
        .inc();
    feed
}

async fn lookup_feed(
    shared: &Shared,
    topic: &str,
) -> Result<Feed> {
    shared
        .topics
        .lock()
        .await
        .get(topic)
        .cloned()
        .ok_or_else(|| FeedError::TopicMissing(topic.to_string()).into())
}

async fn vbmap_response(
    shared: &Shared,
    req: VbmapRequest,
) -> VbmapResponse {
    let kvaddrs = if req.kvaddrs.is_empty() {
        shared.ctx.kvaddrs.clone()
    } else {
        req.kvaddrs.clone()
    };
    let bucket = match shared.ctx.cluster_client.open_bucket(&req.pool, &req.bucket).await {
        Ok(bucket) => bucket,
        Err(err) => {
            return VbmapResponse {
                error: err.to_string(),
                ..Default::default()
            }
        }
    };
    match bucket.vbmap(&kvaddrs).await {
        Ok(vbmap) => {
            let mut resp = VbmapResponse::default();
            for kvaddr in kvaddrs {
                let vbnos = vbmap.get(&kvaddr).cloned().unwrap_or_default();
                resp.kvaddrs.push(kvaddr);
                resp.kvvbnos.push(Vbuckets {
                    vbnos: vbnos.into_iter().map(|v| v as u32).collect(),
                });
            }
            resp
        }
        Err(err) => VbmapResponse {
            error: err.to_string(),
            ..Default::default()
        },
    }
}

async fn failover_log_response(
    shared: &Shared,
    req: FailoverLogRequest,
) -> FailoverLogResponse {
    let bucket = match shared.ctx.cluster_client.open_bucket(&req.pool, &req.bucket).await {
        Ok(bucket) => bucket,
        Err(err) => {
            return FailoverLogResponse {
                error: err.to_string(),
                ..Default::default()
            }
        }
    };
    let vbnos: Vec<u16> = req.vbnos.iter().map(|&v| v as u16).collect();
    match bucket.failover_logs(&vbnos).await {
        Ok(logs) => FailoverLogResponse {
            logs,
            error: String::new(),
        },
        Err(err) => FailoverLogResponse {
            error: err.to_string(),
            ..Default::default()
        },
    }
}

fn topic_frame(
    tag: u8,
    topic: &str,
    res: Result<TopicResponse>,
) -> Bytes {
    match res {
        Ok(resp) => encode_frame(tag, &resp),
        Err(err) => encode_frame(
            tag,
            &TopicResponse {
                topic: topic.to_string(),
                error: err.to_string(),
                ..Default::default()
            },
        ),
    }
}

fn timestamp_frame(
    tag: u8,
    topic: &str,
    res: Result<TimestampResponse>,
) -> Bytes {
    match res {
        Ok(resp) => encode_frame(tag, &resp),
        Err(err) => encode_frame(
            tag,
            &TimestampResponse {
                topic: topic.to_string(),
                error: err.to_string(),
                ..Default::default()
            },
        ),
    }
}

fn error_frame(
    tag: u8,
    res: Result<()>,
) -> Bytes {
    match res {
        Ok(()) => encode_frame(tag, &ErrorResponse::ok()),
        Err(err) => encode_frame(tag, &ErrorResponse::failure(&err)),
    }
}

fn kind_label(tag: u8) -> &'static str {
    match tag {
        TAG_MUTATION_TOPIC => "mutation_topic",
        TAG_RESTART_VBUCKETS => "restart_vbuckets",
        TAG_SHUTDOWN_VBUCKETS => "shutdown_vbuckets",
        TAG_ADD_BUCKETS => "add_buckets",
        TAG_DEL_BUCKETS => "del_buckets",
        TAG_ADD_INSTANCES => "add_instances",
        TAG_DEL_INSTANCES => "del_instances",
        TAG_REPAIR_ENDPOINTS => "repair_endpoints",
        TAG_SHUTDOWN_TOPIC => "shutdown_topic",
        TAG_VBMAP => "vbmap",
        TAG_FAILOVER_LOG => "failover_log",
        _ => "unknown",
    }
}
