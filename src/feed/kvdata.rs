//! KV-data path: per `(topic, bucket, kv-node)` routine that evaluates
//! mutation events against the bucket's engines and routes projections to
//! downstream endpoints. Stream begin/end events are turned into feedback
//! for the topic actor's control-op waits.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::command::Feedback;
use super::endpoint::RouterEndpoint;
use super::engine::Engine;
use crate::constants::KVDATA_CHAN_SIZE;
use crate::metrics::MUTATIONS_ROUTED_METRIC;
use crate::mutation::Mutation;
use crate::mutation::MutationKind;
use crate::proto::common::TsVbuuid;
use crate::NetworkError;
use crate::Result;

enum KvCommand {
    UpdateTs(TsVbuuid),
    AddEngines {
        engines: HashMap<u64, Engine>,
        endpoints: HashMap<String, Arc<dyn RouterEndpoint>>,
    },
    DeleteEngines(Vec<u64>),
    GetStatistics(oneshot::Sender<serde_json::Value>),
    Close(oneshot::Sender<()>),
}

/// Handle to one kv-data routine. All mutating calls are serialized through
/// the routine's command channel; in-flight events complete against the
/// engine view they captured.
pub(crate) struct KVData {
    cmd_tx: mpsc::Sender<KvCommand>,
    event_tx: mpsc::Sender<Mutation>,
}

impl KVData {
    pub(crate) fn new(
        topic: &str,
        bucket: &str,
        kvaddr: &str,
        ts: TsVbuuid,
        engines: HashMap<u64, Engine>,
        endpoints: HashMap<String, Arc<dyn RouterEndpoint>>,
        back_tx: mpsc::Sender<Feedback>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(KVDATA_CHAN_SIZE);
        let (event_tx, event_rx) = mpsc::channel(KVDATA_CHAN_SIZE);

        let worker = KvDataWorker {
            log_prefix: format!("[{}<-{}:{}]", topic, bucket, kvaddr),
            bucket: bucket.to_string(),
            kvaddr: kvaddr.to_string(),
            ts,
            engines,
            endpoints,
            cmd_rx,
            event_rx,
            back_tx,
            event_counts: HashMap::new(),
            routed: 0,
        };
        tokio::spawn(worker.run());

        KVData { cmd_tx, event_tx }
    }

    /// Sender the bucket dispatcher feeds this routine's events through.
    pub(crate) fn event_sender(&self) -> mpsc::Sender<Mutation> {
        self.event_tx.clone()
    }

    /// Replace the start-sequence view ahead of a stream restart.
    pub(crate) async fn update_ts(
        &self,
        ts: TsVbuuid,
    ) -> Result<()> {
        self.send(KvCommand::UpdateTs(ts)).await
    }

    /// Swap in a new engine/endpoint view.
    pub(crate) async fn add_engines(
        &self,
        engines: HashMap<u64, Engine>,
        endpoints: HashMap<String, Arc<dyn RouterEndpoint>>,
    ) -> Result<()> {
        self.send(KvCommand::AddEngines { engines, endpoints }).await
    }

    /// Remove the listed engines from subsequent processing.
    pub(crate) async fn delete_engines(
        &self,
        uuids: Vec<u64>,
    ) -> Result<()> {
        self.send(KvCommand::DeleteEngines(uuids)).await
    }

    pub(crate) async fn get_statistics(&self) -> serde_json::Value {
        let (tx, rx) = oneshot::channel();
        if self.send(KvCommand::GetStatistics(tx)).await.is_err() {
            return serde_json::Value::Null;
        }
        rx.await.unwrap_or(serde_json::Value::Null)
    }

    /// Drain and exit. Idempotent; a second close is a no-op.
    pub(crate) async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(KvCommand::Close(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(
        &self,
        cmd: KvCommand,
    ) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| NetworkError::ChannelClosed("kvdata command channel".into()).into())
    }
}

struct KvDataWorker {
    log_prefix: String,
    bucket: String,
    kvaddr: String,
    ts: TsVbuuid,
    engines: HashMap<u64, Engine>,
    endpoints: HashMap<String, Arc<dyn RouterEndpoint>>,
    cmd_rx: mpsc::Receiver<KvCommand>,
    event_rx: mpsc::Receiver<Mutation>,
    back_tx: mpsc::Sender<Feedback>,
    event_counts: HashMap<&'static str, u64>,
    routed: u64,
}

impl KvDataWorker {
    async fn run(mut self) {
        debug!("{} started", self.log_prefix);
        let mut events_open = true;
        loop {
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(KvCommand::UpdateTs(ts)) => {
                        self.ts = ts;
                    }
                    Some(KvCommand::AddEngines { engines, endpoints }) => {
                        debug!("{} engines updated: {}", self.log_prefix, engines.len());
                        self.engines = engines;
                        self.endpoints = endpoints;
                    }
                    Some(KvCommand::DeleteEngines(uuids)) => {
                        for uuid in uuids {
                            self.engines.remove(&uuid);
                        }
                    }
                    Some(KvCommand::GetStatistics(resp_tx)) => {
                        let _ = resp_tx.send(self.statistics());
                    }
                    Some(KvCommand::Close(resp_tx)) => {
                        let _ = resp_tx.send(());
                        break;
                    }
                    // every handle dropped; nothing can reach us anymore
                    None => break,
                },

                event = self.event_rx.recv(), if events_open => match event {
                    Some(mutation) => self.handle_event(mutation).await,
                    None => events_open = false,
                },
            }
        }
        debug!("{} ... stopped", self.log_prefix);
    }

    async fn handle_event(
        &mut self,
        mutation: Mutation,
    ) {
        *self.event_counts.entry(kind_label(&mutation.kind)).or_insert(0) += 1;

        match mutation.kind {
            MutationKind::StreamBegin => {
                self.post(Feedback::StreamRequest {
                    bucket: mutation.bucket.clone(),
                    kvaddr: self.kvaddr.clone(),
                    opaque: mutation.opaque,
                    status: mutation.status,
                    vbno: mutation.vbno,
                    vbuuid: mutation.vbuuid,
                    seqno: mutation.seqno,
                })
                .await;
            }
            MutationKind::StreamEnd => {
                self.post(Feedback::StreamEnd {
                    bucket: mutation.bucket.clone(),
                    kvaddr: self.kvaddr.clone(),
                    opaque: mutation.opaque,
                    status: mutation.status,
                    vbno: mutation.vbno,
                })
                .await;
            }
            MutationKind::Snapshot { start, end } => {
                self.ts.append(mutation.vbno, mutation.seqno, mutation.vbuuid, start, end);
            }
            MutationKind::Sync | MutationKind::DropData => {
                trace!("{} {:?} vb {}", self.log_prefix, mutation.kind, mutation.vbno);
            }
            MutationKind::Upsert | MutationKind::Deletion | MutationKind::UpsertDeletion => {
                self.route_data(&mutation).await;
            }
        }
    }

    async fn route_data(
        &mut self,
        mutation: &Mutation,
    ) {
        for engine in self.engines.values() {
            match engine.transform_route(mutation, &self.endpoints).await {
                Ok(0) => {}
                Ok(n) => {
                    self.routed += n as u64;
                    MUTATIONS_ROUTED_METRIC
                        .with_label_values(&[&self.bucket, &self.kvaddr])
                        .inc_by(n as u64);
                }
                Err(err) => {
                    warn!(
                        "{} engine {} failed to route vb {}: {}",
                        self.log_prefix,
                        engine.uuid(),
                        mutation.vbno,
                        err
                    );
                }
            }
        }
    }

    async fn post(
        &self,
        feedback: Feedback,
    ) {
        // the topic actor may already be gone during shutdown
        if self.back_tx.send(feedback).await.is_err() {
            trace!("{} dropping feedback, back channel closed", self.log_prefix);
        }
    }

    fn statistics(&self) -> serde_json::Value {
        let counts: serde_json::Map<String, serde_json::Value> = self
            .event_counts
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect();
        json!({
            "bucket": self.bucket,
            "kvaddr": self.kvaddr,
            "engines": self.engines.len(),
            "vbuckets": self.ts.len(),
            "events": counts,
            "routed": self.routed,
        })
    }
}

fn kind_label(kind: &MutationKind) -> &'static str {
    match kind {
        MutationKind::Upsert => "upsert",
        MutationKind::Deletion => "deletion",
        MutationKind::UpsertDeletion => "upsert_deletion",
        MutationKind::Sync => "sync",
        MutationKind::DropData => "drop_data",
        MutationKind::StreamBegin => "stream_begin",
        MutationKind::StreamEnd => "stream_end",
        MutationKind::Snapshot { .. } => "snapshot",
    }
}
