//! Stream monitor: probes per-vbucket heartbeats and asks the producer to
//! restart streams whose heartbeats stalled.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::stream::StreamId;
use crate::admin::StreamAdmin;
use crate::config::ManagerConfig;
use crate::constants::MAX_VBUCKETS;
use crate::metrics::STREAM_RESTART_METRIC;
use crate::mutation::Mutation;
use crate::proto::common::TsVbuuid;
use crate::utils::epoch_millis;

#[derive(Clone, Debug)]
struct Heartbeat {
    last_millis: u64,
    seqno: u64,
    vbuuid: u64,
    snap_start: u64,
    snap_end: u64,
}

/// Health prober for per-vbucket streams.
///
/// Heartbeats (`Sync` and `Snapshot` control events) are recorded by the
/// stream dispatchers; a tick loop looks for vbuckets whose heartbeats
/// stalled past the configured threshold and issues one
/// `RestartStreamIfNecessary` per `(stream, bucket)` with the last known
/// snapshot boundaries.
pub struct StreamMonitor {
    admin: Arc<dyn StreamAdmin>,
    config: ManagerConfig,
    heartbeats: DashMap<(StreamId, String, u16), Heartbeat>,
    stop_tx: watch::Sender<bool>,
}

impl StreamMonitor {
    pub fn new(
        admin: Arc<dyn StreamAdmin>,
        config: ManagerConfig,
    ) -> Arc<StreamMonitor> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(StreamMonitor {
            admin,
            config,
            heartbeats: DashMap::new(),
            stop_tx,
        })
    }

    /// Start the probe loop.
    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(monitor.config.monitor_tick_in_ms));
            info!("stream monitor started");
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = tick.tick() => monitor.probe().await,
                }
            }
            info!("stream monitor stopped");
        });
    }

    pub fn close(&self) {
        let _ = self.stop_tx.send(true);
        self.heartbeats.clear();
    }

    /// Record one heartbeat event for its vbucket.
    pub fn record_heartbeat(
        &self,
        stream: StreamId,
        mutation: &Mutation,
    ) {
        let (snap_start, snap_end) = match mutation.kind {
            crate::mutation::MutationKind::Snapshot { start, end } => (start, end),
            _ => (mutation.seqno, mutation.seqno),
        };
        self.heartbeats.insert(
            (stream, mutation.bucket.clone(), mutation.vbno),
            Heartbeat {
                last_millis: epoch_millis(),
                seqno: mutation.seqno,
                vbuuid: mutation.vbuuid,
                snap_start,
                snap_end,
            },
        );
    }

    async fn probe(&self) {
        let now = epoch_millis();
        let stall = self.config.heartbeat_stall_in_ms;

        // group stalled vbuckets into one restart timestamp per stream+bucket
        let mut restarts: Vec<((StreamId, String), TsVbuuid)> = Vec::new();
        for mut entry in self.heartbeats.iter_mut() {
            let ((stream, bucket, vbno), hb) = (entry.key().clone(), entry.value().clone());
            if now.saturating_sub(hb.last_millis) < stall {
                continue;
            }
            let key = (stream, bucket.clone());
            let idx = match restarts.iter().position(|(k, _)| *k == key) {
                Some(idx) => idx,
                None => {
                    restarts.push((key, TsVbuuid::new("default", &bucket, MAX_VBUCKETS)));
                    restarts.len() - 1
                }
            };
            restarts[idx].1.append(vbno, hb.seqno, hb.vbuuid, hb.snap_start, hb.snap_end);
            // pushing the clock forward spaces consecutive restart attempts
            entry.value_mut().last_millis = now;
        }

        for ((stream, bucket), ts) in restarts {
            warn!(
                "heartbeats stalled on {} bucket {} vbnos {:?}",
                stream, bucket, ts.vbnos
            );
            STREAM_RESTART_METRIC
                .with_label_values(&[&stream.to_string()])
                .inc();
            if let Err(err) = self.admin.restart_stream_if_necessary(stream, vec![ts]).await {
                warn!("restart of {} bucket {} failed: {}", stream, bucket, err);
            } else {
                debug!("restart of {} bucket {} issued", stream, bucket);
            }
        }
    }
}
