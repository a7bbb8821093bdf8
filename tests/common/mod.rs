//! Shared fixtures for integration tests: a simulated producer cluster, a
//! sink endpoint and an in-memory topology store.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use vbflow::config::VbflowConfig;
use vbflow::feed::BucketClient;
use vbflow::feed::BucketFeeder;
use vbflow::feed::ClusterClient;
use vbflow::feed::EndpointFactory;
use vbflow::feed::ProjectedRecord;
use vbflow::feed::RouterEndpoint;
use vbflow::manager::GlobalTopology;
use vbflow::manager::IndexState;
use vbflow::manager::IndexTopology;
use vbflow::manager::StreamId;
use vbflow::manager::TopologyStore;
use vbflow::mutation::ConnectionError;
use vbflow::mutation::Mutation;
use vbflow::mutation::MutationHandler;
use vbflow::mutation::MutationKind;
use vbflow::proto::common::FailoverLog;
use vbflow::proto::common::TsVbuuid;
use vbflow::Error;
use vbflow::Result;

// ---- producer cluster

pub struct SimFeeder {
    bucket: String,
    vb_owner: HashMap<u16, String>,
    tx: mpsc::Sender<Mutation>,
    rx: Mutex<Option<mpsc::Receiver<Mutation>>>,
    closed: AtomicBool,
}

#[async_trait]
impl BucketFeeder for SimFeeder {
    async fn start_vb_streams(
        &self,
        opaque: u32,
        ts: &TsVbuuid,
    ) -> Result<()> {
        for vbno in ts.vbnos_u16() {
            let (seqno, vbuuid, _) = ts.entry(vbno).expect("requested vbucket");
            let owner = self.vb_owner.get(&vbno).cloned().unwrap_or_default();
            let event = Mutation::control(
                &self.bucket,
                &owner,
                vbno,
                vbuuid,
                seqno,
                opaque | vbno as u32,
                MutationKind::StreamBegin,
            );
            if !self.closed.load(Ordering::SeqCst) {
                let _ = self.tx.send(event).await;
            }
        }
        Ok(())
    }

    async fn end_vb_streams(
        &self,
        opaque: u32,
        ts: &TsVbuuid,
    ) -> Result<()> {
        for vbno in ts.vbnos_u16() {
            let owner = self.vb_owner.get(&vbno).cloned().unwrap_or_default();
            let event = Mutation::control(
                &self.bucket,
                &owner,
                vbno,
                0,
                0,
                opaque | vbno as u32,
                MutationKind::StreamEnd,
            );
            if !self.closed.load(Ordering::SeqCst) {
                let _ = self.tx.send(event).await;
            }
        }
        Ok(())
    }

    fn take_channel(&self) -> Option<mpsc::Receiver<Mutation>> {
        self.rx.lock().take()
    }

    async fn close_feed(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct SimBucket {
    pub bucket: String,
    pub vbmap: HashMap<String, Vec<u16>>,
    pub vbuuid: u64,
}

impl SimBucket {
    pub fn new(
        bucket: &str,
        vbmap: &[(&str, &[u16])],
        vbuuid: u64,
    ) -> SimBucket {
        SimBucket {
            bucket: bucket.to_string(),
            vbmap: vbmap
                .iter()
                .map(|(kvaddr, vbnos)| (kvaddr.to_string(), vbnos.to_vec()))
                .collect(),
            vbuuid,
        }
    }
}

#[async_trait]
impl BucketClient for SimBucket {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn vbmap(
        &self,
        kvaddrs: &[String],
    ) -> Result<HashMap<String, Vec<u16>>> {
        Ok(self
            .vbmap
            .iter()
            .filter(|(kvaddr, _)| kvaddrs.contains(kvaddr))
            .map(|(kvaddr, vbnos)| (kvaddr.clone(), vbnos.clone()))
            .collect())
    }

    async fn failover_logs(
        &self,
        vbnos: &[u16],
    ) -> Result<Vec<FailoverLog>> {
        Ok(vbnos
            .iter()
            .map(|&vbno| FailoverLog {
                vbno: vbno as u32,
                vbuuids: vec![self.vbuuid],
                seqnos: vec![0],
            })
            .collect())
    }

    async fn open_feed(&self) -> Result<Arc<dyn BucketFeeder>> {
        let (tx, rx) = mpsc::channel(1024);
        let vb_owner = self
            .vbmap
            .iter()
            .flat_map(|(kvaddr, vbnos)| vbnos.iter().map(|&vbno| (vbno, kvaddr.clone())))
            .collect();
        Ok(Arc::new(SimFeeder {
            bucket: self.bucket.clone(),
            vb_owner,
            tx,
            rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Default)]
pub struct SimCluster {
    buckets: Mutex<HashMap<String, Arc<SimBucket>>>,
}

impl SimCluster {
    pub fn with_bucket(bucket: SimBucket) -> Arc<SimCluster> {
        let cluster = SimCluster::default();
        cluster.buckets.lock().insert(bucket.bucket.clone(), Arc::new(bucket));
        Arc::new(cluster)
    }
}

#[async_trait]
impl ClusterClient for SimCluster {
    async fn open_bucket(
        &self,
        _pool: &str,
        bucket: &str,
    ) -> Result<Arc<dyn BucketClient>> {
        self.buckets
            .lock()
            .get(bucket)
            .cloned()
            .map(|b| b as Arc<dyn BucketClient>)
            .ok_or_else(|| Error::Fatal(format!("no such bucket {bucket}")))
    }
}

// ---- endpoints

pub struct SinkEndpoint {
    pub records: Mutex<Vec<ProjectedRecord>>,
}

#[async_trait]
impl RouterEndpoint for SinkEndpoint {
    fn ping(&self) -> bool {
        true
    }

    async fn send(
        &self,
        record: ProjectedRecord,
    ) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }

    fn get_statistics(&self) -> serde_json::Value {
        json!({ "records": self.records.lock().len() })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub fn sink_endpoint_factory() -> EndpointFactory {
    Arc::new(|_topic, _raddr| {
        Ok(Arc::new(SinkEndpoint {
            records: Mutex::new(Vec::new()),
        }) as Arc<dyn RouterEndpoint>)
    })
}

// ---- topology store

pub struct SimStore {
    topologies: Mutex<HashMap<String, IndexTopology>>,
    updates: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl SimStore {
    pub fn new(initial: IndexTopology) -> Arc<SimStore> {
        let mut topologies = HashMap::new();
        topologies.insert(initial.bucket.clone(), initial);
        Arc::new(SimStore {
            topologies: Mutex::new(topologies),
            updates: Mutex::new(None),
        })
    }

    /// Store a new topology version and notify the listener.
    pub async fn publish(
        &self,
        topology: IndexTopology,
    ) {
        let raw = Bytes::from(serde_json::to_vec(&topology).unwrap());
        self.topologies.lock().insert(topology.bucket.clone(), topology);
        let tx = self.updates.lock().clone();
        if let Some(tx) = tx {
            tx.send(raw).await.unwrap();
        }
    }
}

#[async_trait]
impl TopologyStore for SimStore {
    async fn global_topology(&self) -> Result<Option<GlobalTopology>> {
        let topologies = self.topologies.lock();
        if topologies.is_empty() {
            return Ok(None);
        }
        Ok(Some(GlobalTopology {
            topology_keys: topologies
                .keys()
                .map(|bucket| format!("indexing/topology/{bucket}"))
                .collect(),
        }))
    }

    async fn topology_by_bucket(
        &self,
        bucket: &str,
    ) -> Result<IndexTopology> {
        self.topologies
            .lock()
            .get(bucket)
            .cloned()
            .ok_or_else(|| Error::Fatal(format!("no topology for {bucket}")))
    }

    async fn listen_topology_updates(
        &self,
        _listener: &str,
    ) -> Result<mpsc::Receiver<Bytes>> {
        let (tx, rx) = mpsc::channel(16);
        *self.updates.lock() = Some(tx);
        Ok(rx)
    }
}

// ---- handler

#[derive(Default)]
pub struct NullHandler {
    pub dispatched: Mutex<Vec<(StreamId, Mutation)>>,
}

impl MutationHandler for NullHandler {
    fn dispatch(
        &self,
        stream_id: StreamId,
        mutation: &Mutation,
        _offset: usize,
    ) {
        self.dispatched.lock().push((stream_id, mutation.clone()));
    }

    fn handle_connection_error(
        &self,
        _stream_id: StreamId,
        _err: ConnectionError,
    ) {
    }
}

// ---- builders

pub fn topology_v(
    version: u64,
    bucket: &str,
    instances: &[(u64, IndexState)],
) -> IndexTopology {
    IndexTopology {
        version,
        bucket: bucket.to_string(),
        definitions: vec![vbflow::manager::IndexDefnDistribution {
            bucket: bucket.to_string(),
            name: "idx-city".into(),
            defn_id: 1,
            sec_exprs: vec!["`city`".into()],
            instances: instances
                .iter()
                .map(|&(inst_id, state)| vbflow::manager::IndexInstDistribution { inst_id, state })
                .collect(),
        }],
    }
}

pub fn loopback_config() -> VbflowConfig {
    let mut config = VbflowConfig::default();
    config.network.admin_listen_addr = "127.0.0.1:0".to_string();
    config.feed.stream_request_timeout_in_ms = 2_000;
    config.feed.stream_end_timeout_in_ms = 2_000;
    config
}

/// Install a test subscriber honoring `RUST_LOG`; repeated calls are
/// no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `probe` until it returns true or ~3s elapse.
pub async fn eventually<F>(mut probe: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..150 {
        if probe() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    false
}
