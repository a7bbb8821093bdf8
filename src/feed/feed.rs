//! The topic feed actor.
//!
//! One [`Feed`] owns one topic. Every control operation is serialized
//! through the actor's command channel and answered on a per-call reply
//! channel; per-vbucket feedback from the data path arrives on a dedicated
//! back-channel and is correlated to the waiting operation by opaque tag.
//!
//! Because the actor is single-threaded, at most one feedback wait is
//! active at any time; feedback that does not belong to the current wait is
//! re-queued in FIFO order for the next waiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::command::Feedback;
use super::command::FeedCommand;
use super::endpoint::EndpointFactory;
use super::endpoint::RouterEndpoint;
use super::engine::Engine;
use super::engine::Evaluator;
use super::engine::IndexEvaluator;
use super::engine::InstanceRouter;
use super::engine::Router;
use super::feeder::BucketClient;
use super::feeder::BucketFeeder;
use super::feeder::ClusterClient;
use super::kvdata::KVData;
use super::opaque::opaque_tag;
use super::opaque::OpaqueGenerator;
use crate::config::FeedConfig;
use crate::constants::FEED_BACK_CHAN_SIZE;
use crate::constants::FEED_REQ_CHAN_SIZE;
use crate::constants::MAX_VBUCKETS;
use crate::metrics::FEED_CONTROL_OPS_METRIC;
use crate::metrics::FEED_FEEDBACK_TIMEOUT_METRIC;
use crate::metrics::FEED_ROLLBACK_METRIC;
use crate::mutation::Mutation;
use crate::mutation::StreamStatus;
use crate::proto::common::TsVbuuid;
use crate::proto::instance::Instance;
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
use crate::Error;
use crate::FeedError;
use crate::Result;

/// Immutable construction parameters for one topic feed.
pub struct FeedSettings {
    /// Producer-cluster address, for logging and bucket connections.
    pub cluster: String,
    /// Local address of this control plane, for logging.
    pub local_addr: String,
    /// Producer nodes to stream from.
    pub kvaddrs: Vec<String>,
}

/// Handle to a running topic feed. All methods are synchronous calls: they
/// post a command to the actor and block on its reply. After shutdown every
/// call fails with [`FeedError::Closed`].
#[derive(Clone)]
pub struct Feed {
    topic: String,
    req_tx: mpsc::Sender<FeedCommand>,
}

impl Feed {
    /// Create the feed and spawn its actor.
    pub fn new(
        topic: &str,
        settings: FeedSettings,
        cluster_client: Arc<dyn ClusterClient>,
        endpoint_factory: EndpointFactory,
        config: FeedConfig,
    ) -> Feed {
        let (req_tx, req_rx) = mpsc::channel(FEED_REQ_CHAN_SIZE);
        let (back_tx, back_rx) = mpsc::channel(FEED_BACK_CHAN_SIZE);

        let worker = FeedWorker {
            log_prefix: format!("[{}->{}]", settings.local_addr, topic),
            cluster: settings.cluster,
            topic: topic.to_string(),
            kvaddrs: settings.kvaddrs,
            config,
            cluster_client,
            endpoint_factory,
            opaques: OpaqueGenerator::new(),
            buckets: HashMap::new(),
            req_tss: HashMap::new(),
            roll_tss: HashMap::new(),
            feeders: HashMap::new(),
            kvdata: HashMap::new(),
            engines: HashMap::new(),
            endpoints: HashMap::new(),
            req_rx,
            back_rx,
            back_tx,
        };
        tokio::spawn(worker.run());

        Feed {
            topic: topic.to_string(),
            req_tx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Start the feed: install engines and endpoints, open upstreams for
    /// every requested bucket and wait for per-vbucket confirmation.
    pub async fn mutation_topic(
        &self,
        req: MutationTopicRequest,
    ) -> Result<TopicResponse> {
        self.post(|resp_tx| FeedCommand::Start { req, resp_tx }).await?
    }

    /// Restart upstream vbuckets for the specified buckets.
    pub async fn restart_vbuckets(
        &self,
        req: RestartVbucketsRequest,
    ) -> Result<TopicResponse> {
        self.post(|resp_tx| FeedCommand::RestartVbuckets { req, resp_tx }).await?
    }

    /// Shut down the streams of a vbucket subset.
    pub async fn shutdown_vbuckets(
        &self,
        req: ShutdownVbucketsRequest,
    ) -> Result<()> {
        self.post(|resp_tx| FeedCommand::ShutdownVbuckets { req, resp_tx }).await?
    }

    /// Add buckets, their upstream streams and data paths.
    pub async fn add_buckets(
        &self,
        req: AddBucketsRequest,
    ) -> Result<TopicResponse> {
        self.post(|resp_tx| FeedCommand::AddBuckets { req, resp_tx }).await?
    }

    /// Remove buckets and all their upstream and downstream elements,
    /// except endpoints.
    pub async fn del_buckets(
        &self,
        req: DelBucketsRequest,
    ) -> Result<()> {
        self.post(|resp_tx| FeedCommand::DelBuckets { req, resp_tx }).await?
    }

    /// Add index instances; only the data path view is updated.
    pub async fn add_instances(
        &self,
        req: AddInstancesRequest,
    ) -> Result<TimestampResponse> {
        self.post(|resp_tx| FeedCommand::AddInstances { req, resp_tx }).await?
    }

    /// Remove index instances; only the data path view is updated.
    pub async fn del_instances(
        &self,
        req: DelInstancesRequest,
    ) -> Result<TopicResponse> {
        self.post(|resp_tx| FeedCommand::DelInstances { req, resp_tx }).await?
    }

    /// Re-create dead endpoint handles and propagate the repaired set.
    pub async fn repair_endpoints(
        &self,
        req: RepairEndpointsRequest,
    ) -> Result<()> {
        self.post(|resp_tx| FeedCommand::RepairEndpoints { req, resp_tx }).await?
    }

    pub async fn get_statistics(&self) -> Result<serde_json::Value> {
        self.post(|resp_tx| FeedCommand::GetStatistics { resp_tx }).await
    }

    /// Shut the feed down: upstreams first, then data paths, then
    /// endpoints.
    pub async fn shutdown(&self) -> Result<()> {
        self.post(|resp_tx| FeedCommand::Shutdown { resp_tx }).await?
    }

    async fn post<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> FeedCommand,
    ) -> Result<R> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.req_tx
            .send(make(resp_tx))
            .await
            .map_err(|_| Error::from(FeedError::Closed(self.topic.clone())))?;
        resp_rx
            .await
            .map_err(|_| FeedError::Closed(self.topic.clone()).into())
    }
}

struct FeedWorker {
    log_prefix: String,
    cluster: String,
    topic: String,
    kvaddrs: Vec<String>,
    config: FeedConfig,
    cluster_client: Arc<dyn ClusterClient>,
    endpoint_factory: EndpointFactory,
    opaques: OpaqueGenerator,

    // cache of bucket connections
    buckets: HashMap<String, Arc<dyn BucketClient>>,
    // upstream
    req_tss: HashMap<String, TsVbuuid>,
    roll_tss: HashMap<String, TsVbuuid>,
    feeders: HashMap<String, Arc<dyn BucketFeeder>>,
    // downstream
    kvdata: HashMap<String, HashMap<String, KVData>>,
    engines: HashMap<String, HashMap<u64, Engine>>,
    endpoints: HashMap<String, Arc<dyn RouterEndpoint>>,
    // actor channels
    req_rx: mpsc::Receiver<FeedCommand>,
    back_rx: mpsc::Receiver<Feedback>,
    back_tx: mpsc::Sender<Feedback>,
}

impl FeedWorker {
    async fn run(mut self) {
        info!("{} started ...", self.log_prefix);
        let tick = Duration::from_millis(self.config.control_tick_in_ms);
        loop {
            tokio::select! {
                biased;

                cmd = self.req_rx.recv() => {
                    let cmd = match cmd {
                        Some(cmd) => cmd,
                        // supervisor dropped every handle
                        None => {
                            self.shutdown().await;
                            break;
                        }
                    };
                    match AssertUnwindSafe(self.handle_command(cmd)).catch_unwind().await {
                        Ok(false) => {}
                        Ok(true) => break,
                        Err(panic) => {
                            error!(
                                "{} gen-server crashed: {}",
                                self.log_prefix,
                                panic_message(&panic)
                            );
                            self.shutdown().await;
                            break;
                        }
                    }
                }

                _ = sleep(tick) => {
                    debug!(
                        "{} control channel has {} messages",
                        self.log_prefix,
                        self.back_rx.len()
                    );
                }
            }
        }
    }

    /// Returns true when the actor must exit.
    async fn handle_command(
        &mut self,
        cmd: FeedCommand,
    ) -> bool {
        match cmd {
            FeedCommand::Start { req, resp_tx } => {
                self.count_op("start");
                let res = self.start(req).await.map(|_| self.topic_response());
                let _ = resp_tx.send(res);
            }
            FeedCommand::RestartVbuckets { req, resp_tx } => {
                self.count_op("restart_vbuckets");
                let res = self
                    .restart_vbuckets(req)
                    .await
                    .map(|_| self.topic_response());
                let _ = resp_tx.send(res);
            }
            FeedCommand::ShutdownVbuckets { req, resp_tx } => {
                self.count_op("shutdown_vbuckets");
                let _ = resp_tx.send(self.shutdown_vbuckets(req).await);
            }
            FeedCommand::AddBuckets { req, resp_tx } => {
                self.count_op("add_buckets");
                let res = self.add_buckets(req).await.map(|_| self.topic_response());
                let _ = resp_tx.send(res);
            }
            FeedCommand::DelBuckets { req, resp_tx } => {
                self.count_op("del_buckets");
                let _ = resp_tx.send(self.del_buckets(req).await);
            }
            FeedCommand::AddInstances { req, resp_tx } => {
                self.count_op("add_instances");
                let res = self
                    .add_instances(req)
                    .await
                    .map(|_| self.timestamp_response());
                let _ = resp_tx.send(res);
            }
            FeedCommand::DelInstances { req, resp_tx } => {
                self.count_op("del_instances");
                let res = self.del_instances(req).await.map(|_| self.topic_response());
                let _ = resp_tx.send(res);
            }
            FeedCommand::RepairEndpoints { req, resp_tx } => {
                self.count_op("repair_endpoints");
                let _ = resp_tx.send(self.repair_endpoints(req).await);
            }
            FeedCommand::GetStatistics { resp_tx } => {
                let _ = resp_tx.send(self.get_statistics().await);
            }
            FeedCommand::Shutdown { resp_tx } => {
                self.count_op("shutdown");
                self.shutdown().await;
                let _ = resp_tx.send(Ok(()));
                return true;
            }
        }
        false
    }

    // ---- control operations

    /// Open upstream streams and data paths for every bucket in the
    /// request. State for a bucket is recorded only after its per-vbucket
    /// feedback completed.
    async fn start(
        &mut self,
        req: MutationTopicRequest,
    ) -> Result<()> {
        self.process_subscribers(&req.instances)?;

        let opaque = self.opaques.next_opaque();
        for req_ts in &req.req_timestamps {
            let (pool, bucket) = (req_ts.pool.clone(), req_ts.bucket.clone());
            let req_ts = self.bucket_feed(opaque, false, true, req_ts).await?;
            self.start_data_path(&bucket, &req_ts).await?;

            let vbnos = req_ts.vbnos_u16();
            let roll_ts = self.wait_stream_requests(opaque, &pool, &bucket, vbnos.clone()).await?;
            info!(
                "{} stream-request completed for {:?} #{:x}",
                self.log_prefix, vbnos, opaque
            );
            self.req_tss.insert(bucket.clone(), req_ts);
            self.roll_tss.insert(bucket.clone(), roll_ts);
        }
        Ok(())
    }

    /// Restart a subset of upstream vbuckets: end them, refresh the data
    /// path's start-sequence view, start them at the restart timestamp.
    async fn restart_vbuckets(
        &mut self,
        req: RestartVbucketsRequest,
    ) -> Result<()> {
        let opaque = self.opaques.next_opaque();
        for restart_ts in &req.restart_timestamps {
            let (pool, bucket) = (restart_ts.pool.clone(), restart_ts.bucket.clone());
            if !self.req_tss.contains_key(&bucket) || !self.kvdata.contains_key(&bucket) {
                error!("{} restart_vbuckets() invalid bucket {}", self.log_prefix, bucket);
                return Err(FeedError::InvalidBucket(bucket).into());
            }

            // first shutdown the upstream subset
            let shut_ts = self.bucket_feed(opaque, true, false, restart_ts).await?;
            self.wait_stream_ends(opaque, &bucket, shut_ts.vbnos_u16()).await?;

            // update data paths with the new start-sequence view
            for kv in self.kvdata[&bucket].values() {
                kv.update_ts(restart_ts.clone()).await?;
            }

            // then restart it
            let restart_ts = self.bucket_feed(opaque, false, true, restart_ts).await?;
            let vbnos = restart_ts.vbnos_u16();
            let roll_ts = self.wait_stream_requests(opaque, &pool, &bucket, vbnos.clone()).await?;
            info!(
                "{} stream-request completed for {:?} #{:x}",
                self.log_prefix, vbnos, opaque
            );

            let merged = self.req_tss[&bucket].union(&restart_ts);
            self.req_tss.insert(bucket.clone(), merged);
            self.roll_tss.insert(bucket.clone(), roll_ts);
        }
        Ok(())
    }

    /// Close a subset of upstream vbuckets and forget them.
    async fn shutdown_vbuckets(
        &mut self,
        req: ShutdownVbucketsRequest,
    ) -> Result<()> {
        let opaque = self.opaques.next_opaque();
        for shut_ts in &req.shutdown_timestamps {
            let bucket = shut_ts.bucket.clone();
            if !self.req_tss.contains_key(&bucket) {
                return Err(FeedError::InvalidBucket(bucket).into());
            }

            let shut_ts = self.bucket_feed(opaque, true, false, shut_ts).await?;
            let vbnos = shut_ts.vbnos_u16();
            self.wait_stream_ends(opaque, &bucket, vbnos.clone()).await?;
            info!(
                "{} stream-end completed for bucket {}, vbnos {:?} #{:x}",
                self.log_prefix, bucket, vbnos, opaque
            );

            let remaining = self.req_tss[&bucket].filter_by_vbuckets(&vbnos);
            self.req_tss.insert(bucket, remaining);
        }
        Ok(())
    }

    /// Same bring-up as `start`, for buckets added to a live topic.
    async fn add_buckets(
        &mut self,
        req: AddBucketsRequest,
    ) -> Result<()> {
        self.process_subscribers(&req.instances)?;

        let opaque = self.opaques.next_opaque();
        for req_ts in &req.req_timestamps {
            let (pool, bucket) = (req_ts.pool.clone(), req_ts.bucket.clone());
            let req_ts = self.bucket_feed(opaque, false, true, req_ts).await?;
            self.start_data_path(&bucket, &req_ts).await?;

            let vbnos = req_ts.vbnos_u16();
            let roll_ts = self.wait_stream_requests(opaque, &pool, &bucket, vbnos.clone()).await?;
            info!(
                "{} stream-request completed for {:?} #{:x}",
                self.log_prefix, vbnos, opaque
            );
            self.req_tss.insert(bucket.clone(), req_ts);
            self.roll_tss.insert(bucket.clone(), roll_ts);
        }
        Ok(())
    }

    /// Close every stream of the listed buckets and erase their state.
    /// Endpoints stay; they are shared across buckets.
    async fn del_buckets(
        &mut self,
        req: DelBucketsRequest,
    ) -> Result<()> {
        let opaque = self.opaques.next_opaque();
        for bucket in &req.buckets {
            if !self.kvdata.contains_key(bucket) {
                error!("{} del_buckets() no bucket {}", self.log_prefix, bucket);
                return Err(FeedError::InvalidBucket(bucket.clone()).into());
            }

            let req_ts = self.req_tss[bucket].clone();
            let shut_ts = self.bucket_feed(opaque, true, false, &req_ts).await?;
            self.wait_stream_ends(opaque, bucket, shut_ts.vbnos_u16()).await?;
            info!(
                "{} stream-end completed for bucket {} #{:x}",
                self.log_prefix, bucket, opaque
            );

            if let Some(feeder) = self.feeders.remove(bucket) {
                if let Err(err) = feeder.close_feed().await {
                    warn!("{} close_feed({}) failed: {}", self.log_prefix, bucket, err);
                }
            }
            if let Some(paths) = self.kvdata.remove(bucket) {
                for kv in paths.values() {
                    kv.close().await;
                }
            }
            self.req_tss.remove(bucket);
            self.roll_tss.remove(bucket);
            self.engines.remove(bucket);
            self.buckets.remove(bucket);
        }
        Ok(())
    }

    /// Install instances and push the refreshed view to every data path.
    async fn add_instances(
        &mut self,
        req: AddInstancesRequest,
    ) -> Result<()> {
        self.process_subscribers(&req.instances)?;
        for (bucket, engines) in &self.engines {
            if let Some(paths) = self.kvdata.get(bucket) {
                for kv in paths.values() {
                    kv.add_engines(engines.clone(), self.endpoints.clone()).await?;
                }
            }
        }
        Ok(())
    }

    /// Partition engines into kept/removed and push the removals.
    async fn del_instances(
        &mut self,
        req: DelInstancesRequest,
    ) -> Result<()> {
        let mut removed: HashMap<String, Vec<u64>> = HashMap::new();
        let mut kept: HashMap<String, HashMap<u64, Engine>> = HashMap::new();
        for (bucket, engines) in &self.engines {
            let mut uuids = Vec::new();
            let mut keep = HashMap::new();
            for (&uuid, engine) in engines {
                if req.instance_ids.contains(&uuid) {
                    uuids.push(uuid);
                } else {
                    keep.insert(uuid, engine.clone());
                }
            }
            removed.insert(bucket.clone(), uuids);
            kept.insert(bucket.clone(), keep);
        }

        for (bucket, uuids) in removed {
            if uuids.is_empty() {
                continue;
            }
            if let Some(paths) = self.kvdata.get(&bucket) {
                for kv in paths.values() {
                    kv.delete_engines(uuids.clone()).await?;
                }
            }
        }
        self.engines = kept;
        Ok(())
    }

    /// Re-create the listed endpoints when absent or dead, then push the
    /// endpoint set to every data path.
    async fn repair_endpoints(
        &mut self,
        req: RepairEndpointsRequest,
    ) -> Result<()> {
        for raddr in &req.endpoints {
            let live = self.endpoints.get(raddr).map(|e| e.ping()).unwrap_or(false);
            if !live {
                info!("{} repairing endpoint {}", self.log_prefix, raddr);
                let endpoint = (self.endpoint_factory)(&self.topic, raddr)?;
                self.endpoints.insert(raddr.clone(), endpoint);
            }
        }

        // though only endpoints may have changed, the full view is pushed
        for (bucket, paths) in &self.kvdata {
            let engines = self.engines.get(bucket).cloned().unwrap_or_default();
            for kv in paths.values() {
                kv.add_engines(engines.clone(), self.endpoints.clone()).await?;
            }
        }
        Ok(())
    }

    async fn get_statistics(&self) -> serde_json::Value {
        let mut stats = serde_json::Map::new();
        stats.insert("topic".into(), json!(self.topic));
        stats.insert("engines".into(), json!(self.engine_names()));
        for (bucket, paths) in &self.kvdata {
            let mut bstats = serde_json::Map::new();
            for (kvaddr, kv) in paths {
                bstats.insert(format!("node-{kvaddr}"), kv.get_statistics().await);
            }
            stats.insert(format!("bucket-{bucket}"), bstats.into());
        }
        let mut endstats = serde_json::Map::new();
        for (raddr, endpoint) in &self.endpoints {
            endstats.insert(raddr.clone(), endpoint.get_statistics());
        }
        stats.insert("endpoint".into(), endstats.into());
        stats.into()
    }

    /// Release order: upstreams, then data paths, then endpoints.
    async fn shutdown(&mut self) {
        for (bucket, feeder) in self.feeders.drain() {
            if let Err(err) = feeder.close_feed().await {
                warn!("{} close_feed({}) failed: {}", self.log_prefix, bucket, err);
            }
        }
        for (_, paths) in self.kvdata.drain() {
            for kv in paths.values() {
                kv.close().await;
            }
        }
        for (raddr, endpoint) in self.endpoints.drain() {
            if let Err(err) = endpoint.close().await {
                warn!("{} endpoint {} close failed: {}", self.log_prefix, raddr, err);
            }
        }
        self.req_tss.clear();
        self.roll_tss.clear();
        self.engines.clear();
        self.buckets.clear();
        info!("{} ... stopped", self.log_prefix);
    }

    // ---- upstream plumbing

    /// Issue stream controls for one bucket: resolve its vbmap and failover
    /// logs, validate the branch on starts, clamp the timestamp to the
    /// hosted vbuckets and call the feeder. Returns the clamped timestamp.
    async fn bucket_feed(
        &mut self,
        opaque: u32,
        stop: bool,
        start: bool,
        ts: &TsVbuuid,
    ) -> Result<TsVbuuid> {
        let (pool, bucket) = (ts.pool.clone(), ts.bucket.clone());
        let (vbnos, vbuuids) = self.bucket_details(&pool, &bucket).await?;

        if start && !ts.verify_branch(&vbnos, &vbuuids) {
            error!("{} VerifyBranch() failed for {:?}", self.log_prefix, bucket);
            return Err(FeedError::InvalidVbucketBranch(bucket).into());
        }

        let ts = ts.select_by_vbuckets(&vbnos);

        if !self.feeders.contains_key(&bucket) {
            // the feed is being started for the first time
            let client = self.get_bucket(&pool, &bucket).await?;
            let feeder = client.open_feed().await?;
            self.feeders.insert(bucket.clone(), feeder);
        }
        let feeder = &self.feeders[&bucket];

        if stop {
            info!("{} stop-timestamp for {:?}: {:?}", self.log_prefix, bucket, ts.vbnos);
            feeder.end_vb_streams(opaque, &ts).await?;
        }
        if start {
            info!("{} start-timestamp for {:?}: {:?}", self.log_prefix, bucket, ts.vbnos);
            feeder.start_vb_streams(opaque, &ts).await?;
        }
        Ok(ts)
    }

    /// Hosted vbuckets across this feed's kv-nodes, with the newest branch
    /// uuid from each failover log.
    async fn bucket_details(
        &mut self,
        pool: &str,
        bucket: &str,
    ) -> Result<(Vec<u16>, Vec<u64>)> {
        let client = self.get_bucket(pool, bucket).await?;
        // refresh the vbmap before gathering hosted vbuckets
        client.refresh().await?;
        let vbmap = client.vbmap(&self.kvaddrs).await?;
        let mut vbnos: Vec<u16> = vbmap.values().flatten().copied().collect();
        vbnos.sort_unstable();
        vbnos.dedup();

        let flogs = client.failover_logs(&vbnos).await?;
        let mut vbuuids = Vec::with_capacity(vbnos.len());
        for &vbno in &vbnos {
            let uuid = flogs
                .iter()
                .find(|log| log.vbno == vbno as u32)
                .and_then(|log| log.vbuuids.first().copied());
            match uuid {
                Some(uuid) => vbuuids.push(uuid),
                None => {
                    error!("{} empty failover log for vb {}", self.log_prefix, vbno);
                    return Err(Error::Fatal(format!(
                        "empty failover log for {bucket}/vb{vbno}"
                    )));
                }
            }
        }
        Ok((vbnos, vbuuids))
    }

    async fn get_bucket(
        &mut self,
        pool: &str,
        bucket: &str,
    ) -> Result<Arc<dyn BucketClient>> {
        if let Some(client) = self.buckets.get(bucket) {
            return Ok(client.clone());
        }
        let client = self.cluster_client.open_bucket(pool, bucket).await.map_err(|err| {
            error!("{} open_bucket({}) on {}: {}", self.log_prefix, bucket, self.cluster, err);
            err
        })?;
        self.buckets.insert(bucket.to_string(), client.clone());
        Ok(client)
    }

    /// Spawn one kv-data path per kv-node for `bucket` and the dispatcher
    /// that fans the feeder's mutation channel out to them. Re-entered for
    /// a bucket that already has paths, it only refreshes their view.
    async fn start_data_path(
        &mut self,
        bucket: &str,
        ts: &TsVbuuid,
    ) -> Result<()> {
        // a streaming bucket owns an engine slot even while it is empty
        self.engines.entry(bucket.to_string()).or_default();
        let engines = self.engines.get(bucket).cloned().unwrap_or_default();

        if let Some(paths) = self.kvdata.get(bucket) {
            for kv in paths.values() {
                kv.update_ts(ts.clone()).await?;
                kv.add_engines(engines.clone(), self.endpoints.clone()).await?;
            }
            return Ok(());
        }

        let mut paths = HashMap::new();
        for kvaddr in &self.kvaddrs {
            let kv = KVData::new(
                &self.topic,
                bucket,
                kvaddr,
                ts.clone(),
                engines.clone(),
                self.endpoints.clone(),
                self.back_tx.clone(),
            );
            paths.insert(kvaddr.clone(), kv);
        }

        if let Some(rx) = self.feeders[bucket].take_channel() {
            let senders: HashMap<String, mpsc::Sender<Mutation>> = paths
                .iter()
                .map(|(kvaddr, kv)| (kvaddr.clone(), kv.event_sender()))
                .collect();
            tokio::spawn(dispatch_bucket_events(self.log_prefix.clone(), rx, senders));
        }
        self.kvdata.insert(bucket.to_string(), paths);
        Ok(())
    }

    // ---- subscribers

    /// Install the request's engines and endpoints. Evaluator and router
    /// sets must agree in size and key set.
    fn process_subscribers(
        &mut self,
        instances: &[Instance],
    ) -> Result<()> {
        let (evaluators, routers) = self.subscribers(instances)?;
        self.start_endpoints(&routers)?;

        for (uuid, evaluator) in evaluators {
            let router = routers[&uuid].clone();
            let bucket = evaluator.bucket().to_string();
            let engine = Engine::new(uuid, evaluator, router);
            info!("{} new engine {} created ...", self.log_prefix, uuid);
            self.engines.entry(bucket).or_default().insert(uuid, engine);
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn subscribers(
        &self,
        instances: &[Instance],
    ) -> Result<(HashMap<u64, Arc<dyn Evaluator>>, HashMap<u64, Arc<dyn Router>>)> {
        let mut evaluators: HashMap<u64, Arc<dyn Evaluator>> = HashMap::new();
        let mut routers: HashMap<u64, Arc<dyn Router>> = HashMap::new();
        for instance in instances {
            if instance.definition.is_none() {
                error!("{} instance {} without definition", self.log_prefix, instance.instance_id);
                return Err(FeedError::InconsistentFeed.into());
            }
            evaluators.insert(
                instance.instance_id,
                Arc::new(IndexEvaluator::from_instance(instance)),
            );
            routers.insert(
                instance.instance_id,
                Arc::new(InstanceRouter::from_instance(instance)),
            );
        }

        if evaluators.len() != routers.len() {
            error!("{} error {}, len() mismatch", self.log_prefix, FeedError::InconsistentFeed);
            return Err(FeedError::InconsistentFeed.into());
        }
        for uuid in evaluators.keys() {
            if !routers.contains_key(uuid) {
                error!("{} error {}, uuid mismatch", self.log_prefix, FeedError::InconsistentFeed);
                return Err(FeedError::InconsistentFeed.into());
            }
        }
        Ok((evaluators, routers))
    }

    /// Ensure a live endpoint for every address the routers name; an
    /// already-present, live endpoint is reused.
    fn start_endpoints(
        &mut self,
        routers: &HashMap<u64, Arc<dyn Router>>,
    ) -> Result<()> {
        for router in routers.values() {
            for raddr in router.endpoints() {
                let live = self.endpoints.get(&raddr).map(|e| e.ping()).unwrap_or(false);
                if !live {
                    let endpoint = (self.endpoint_factory)(&self.topic, &raddr)?;
                    self.endpoints.insert(raddr, endpoint);
                }
            }
        }
        Ok(())
    }

    // ---- feedback waits

    /// Drain the back-channel until every vbucket in `vbnos` produced one
    /// `StreamRequest` carrying `(bucket, opaque)`, or the deadline
    /// expires. Rollback reports accumulate into the returned timestamp.
    async fn wait_stream_requests(
        &mut self,
        opaque: u32,
        pool: &str,
        bucket: &str,
        mut vbnos: Vec<u16>,
    ) -> Result<TsVbuuid> {
        let mut roll_ts = TsVbuuid::new(pool, bucket, MAX_VBUCKETS);
        if vbnos.is_empty() {
            return Ok(roll_ts);
        }

        let deadline =
            Instant::now() + Duration::from_millis(self.config.stream_request_timeout_in_ms);
        let topic = self.topic.clone();
        let res = self
            .wait_on_feedback(deadline, bucket, |msg| match msg {
                Feedback::StreamRequest {
                    bucket: b,
                    opaque: o,
                    status,
                    vbno,
                    vbuuid,
                    seqno,
                    ..
                } if b.as_str() == bucket && opaque_tag(*o) == opaque_tag(opaque) => {
                    if *status == StreamStatus::Rollback {
                        FEED_ROLLBACK_METRIC.with_label_values(&[&topic, b]).inc();
                        roll_ts.append(*vbno, *seqno, *vbuuid, 0, 0);
                    }
                    vbnos.retain(|v| v != vbno);
                    if vbnos.is_empty() {
                        Verdict::Done
                    } else {
                        Verdict::Consumed
                    }
                }
                _ => Verdict::Skip,
            })
            .await;
        res.map(|_| roll_ts)
    }

    /// Same drain for `StreamEnd` confirmations.
    async fn wait_stream_ends(
        &mut self,
        opaque: u32,
        bucket: &str,
        mut vbnos: Vec<u16>,
    ) -> Result<()> {
        if vbnos.is_empty() {
            return Ok(());
        }

        let deadline =
            Instant::now() + Duration::from_millis(self.config.stream_end_timeout_in_ms);
        self.wait_on_feedback(deadline, bucket, |msg| match msg {
            Feedback::StreamEnd {
                bucket: b,
                opaque: o,
                vbno,
                ..
            } if b.as_str() == bucket && opaque_tag(*o) == opaque_tag(opaque) => {
                vbnos.retain(|v| v != vbno);
                if vbnos.is_empty() {
                    Verdict::Done
                } else {
                    Verdict::Consumed
                }
            }
            _ => Verdict::Skip,
        })
        .await
    }

    /// Block on the back-channel, judging each message with `callb`.
    /// Skipped messages are re-posted in FIFO order once the wait
    /// completes; consumed messages are never replayed, even on timeout.
    async fn wait_on_feedback(
        &mut self,
        deadline: Instant,
        bucket: &str,
        mut callb: impl FnMut(&Feedback) -> Verdict,
    ) -> Result<()> {
        let mut skipped: Vec<Feedback> = Vec::new();
        let mut result = Ok(());
        loop {
            tokio::select! {
                msg = self.back_rx.recv() => {
                    let msg = match msg {
                        Some(msg) => msg,
                        None => {
                            result = Err(FeedError::Closed(self.topic.clone()).into());
                            break;
                        }
                    };
                    debug!("{} back channel {:?}", self.log_prefix, msg);
                    match callb(&msg) {
                        Verdict::Skip => skipped.push(msg),
                        Verdict::Consumed => {}
                        Verdict::Done => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    FEED_FEEDBACK_TIMEOUT_METRIC
                        .with_label_values(&[&self.topic, bucket])
                        .inc();
                    error!("{} feedback timeout", self.log_prefix);
                    result = Err(FeedError::ResponseTimeout.into());
                    break;
                }
            }
        }
        for msg in skipped {
            if self.back_tx.try_send(msg).is_err() {
                warn!("{} back channel overflow while re-queueing", self.log_prefix);
            }
        }
        result
    }

    // ---- responses

    fn topic_response(&self) -> TopicResponse {
        let mut instance_ids: Vec<u64> = self
            .engines
            .values()
            .flat_map(|m| m.keys().copied())
            .collect();
        instance_ids.sort_unstable();
        TopicResponse {
            topic: self.topic.clone(),
            instance_ids,
            req_timestamps: self.req_tss.values().cloned().collect(),
            rollback_timestamps: self.roll_tss.values().cloned().collect(),
            error: String::new(),
        }
    }

    fn timestamp_response(&self) -> TimestampResponse {
        TimestampResponse {
            topic: self.topic.clone(),
            current_timestamps: self.req_tss.values().cloned().collect(),
            error: String::new(),
        }
    }

    fn engine_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .engines
            .values()
            .flat_map(|m| m.keys().map(|uuid| uuid.to_string()))
            .collect();
        names.sort();
        names
    }

    fn count_op(
        &self,
        op: &str,
    ) {
        FEED_CONTROL_OPS_METRIC
            .with_label_values(&[&self.topic, op])
            .inc();
    }
}

enum Verdict {
    Skip,
    Consumed,
    Done,
}

/// Fan the feeder's single mutation channel out to the per-node data
/// paths. Events for an unknown node are dropped with a warning; the task
/// exits when the feeder closes its channel.
async fn dispatch_bucket_events(
    log_prefix: String,
    mut rx: mpsc::Receiver<Mutation>,
    senders: HashMap<String, mpsc::Sender<Mutation>>,
) {
    while let Some(mutation) = rx.recv().await {
        match senders.get(&mutation.kvaddr) {
            Some(tx) => {
                // a closed data path means its bucket was deleted; drop
                let _ = tx.send(mutation).await;
            }
            None => {
                warn!("{} event from unknown kv-node {}", log_prefix, mutation.kvaddr);
            }
        }
    }
    debug!("{} bucket dispatcher exited", log_prefix);
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
