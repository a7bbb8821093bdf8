//! Shared test doubles for unit tests: a scripted producer cluster, an
//! in-memory endpoint and a recording mutation handler.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use crate::feed::BucketClient;
use crate::feed::BucketFeeder;
use crate::feed::ClusterClient;
use crate::feed::EndpointFactory;
use crate::feed::ProjectedRecord;
use crate::feed::RouterEndpoint;
use crate::manager::StreamId;
use crate::mutation::ConnectionError;
use crate::mutation::Mutation;
use crate::mutation::MutationHandler;
use crate::mutation::MutationKind;
use crate::mutation::StreamStatus;
use crate::proto::common::FailoverLog;
use crate::proto::common::TsVbuuid;
use crate::proto::instance::IndexDefn;
use crate::proto::instance::IndexState;
use crate::proto::instance::Instance;
use crate::Error;
use crate::Result;

// ---- endpoints

/// In-memory endpoint recording every projected record.
pub(crate) struct TestEndpoint {
    pub(crate) raddr: String,
    alive: AtomicBool,
    pings: AtomicU32,
    closed: AtomicBool,
    pub(crate) records: Mutex<Vec<ProjectedRecord>>,
}

impl TestEndpoint {
    pub(crate) fn new(raddr: &str) -> Arc<TestEndpoint> {
        Arc::new(TestEndpoint {
            raddr: raddr.to_string(),
            alive: AtomicBool::new(true),
            pings: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            records: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub(crate) fn ping_count(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RouterEndpoint for TestEndpoint {
    fn ping(&self) -> bool {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.alive.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn send(
        &self,
        record: ProjectedRecord,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(crate::NetworkError::ConnectionError(format!(
                "endpoint {} closed",
                self.raddr
            ))
            .into());
        }
        self.records.lock().push(record);
        Ok(())
    }

    fn get_statistics(&self) -> serde_json::Value {
        json!({ "records": self.records.lock().len() })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Registry of every endpoint a factory has created, for inspection.
#[derive(Default)]
pub(crate) struct EndpointBook {
    pub(crate) endpoints: Mutex<Vec<Arc<TestEndpoint>>>,
}

impl EndpointBook {
    pub(crate) fn find(
        &self,
        raddr: &str,
    ) -> Option<Arc<TestEndpoint>> {
        self.endpoints
            .lock()
            .iter()
            .rev()
            .find(|e| e.raddr == raddr)
            .cloned()
    }

    pub(crate) fn created(&self) -> usize {
        self.endpoints.lock().len()
    }
}

pub(crate) fn test_endpoint_factory() -> (EndpointFactory, Arc<EndpointBook>) {
    let book = Arc::new(EndpointBook::default());
    let registry = book.clone();
    let factory: EndpointFactory = Arc::new(move |_topic, raddr| {
        let endpoint = TestEndpoint::new(raddr);
        registry.endpoints.lock().push(endpoint.clone());
        Ok(endpoint as Arc<dyn RouterEndpoint>)
    });
    (factory, book)
}

// ---- producer cluster

/// Scripted feeder: stream controls synthesize the per-vbucket control
/// events a real producer would send.
pub(crate) struct TestFeeder {
    bucket: String,
    vb_owner: HashMap<u16, String>,
    rollbacks: HashMap<u16, (u64, u64)>,
    mute: Vec<u16>,
    tx: mpsc::Sender<Mutation>,
    rx: Mutex<Option<mpsc::Receiver<Mutation>>>,
    closed: AtomicBool,
    stray_opaque: Option<u32>,
}

impl TestFeeder {
    fn owner(
        &self,
        vbno: u16,
    ) -> String {
        self.vb_owner.get(&vbno).cloned().unwrap_or_else(|| "kv-unknown".into())
    }

    /// Inject arbitrary events, e.g. data mutations, into the feed.
    pub(crate) async fn inject(
        &self,
        mutation: Mutation,
    ) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.tx.send(mutation).await;
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BucketFeeder for TestFeeder {
    async fn start_vb_streams(
        &self,
        opaque: u32,
        ts: &TsVbuuid,
    ) -> Result<()> {
        if let Some(stale) = self.stray_opaque {
            // a leftover confirmation from an earlier operation
            let vbno = ts.vbnos_u16().first().copied().unwrap_or(0);
            let owner = self.owner(vbno);
            self.inject(Mutation::control(&self.bucket, &owner, vbno, 0xDEAD, 0, stale, MutationKind::StreamBegin))
                .await;
        }
        for vbno in ts.vbnos_u16() {
            if self.mute.contains(&vbno) {
                continue;
            }
            let (seqno, vbuuid, _) = ts.entry(vbno).expect("requested vbucket");
            let owner = self.owner(vbno);
            let mut event = Mutation::control(
                &self.bucket,
                &owner,
                vbno,
                vbuuid,
                seqno,
                opaque | vbno as u32,
                MutationKind::StreamBegin,
            );
            if let Some(&(roll_seqno, roll_vbuuid)) = self.rollbacks.get(&vbno) {
                event.status = StreamStatus::Rollback;
                event.seqno = roll_seqno;
                event.vbuuid = roll_vbuuid;
            }
            self.inject(event).await;
        }
        Ok(())
    }

    async fn end_vb_streams(
        &self,
        opaque: u32,
        ts: &TsVbuuid,
    ) -> Result<()> {
        for vbno in ts.vbnos_u16() {
            if self.mute.contains(&vbno) {
                continue;
            }
            let owner = self.owner(vbno);
            self.inject(Mutation::control(
                &self.bucket,
                &owner,
                vbno,
                0,
                0,
                opaque | vbno as u32,
                MutationKind::StreamEnd,
            ))
            .await;
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

/// One scripted bucket of the producer cluster.
pub(crate) struct TestBucket {
    pub(crate) bucket: String,
    /// kvaddr -> hosted vbuckets
    pub(crate) vbmap: HashMap<String, Vec<u16>>,
    /// newest branch uuid per vbucket
    pub(crate) vbuuids: HashMap<u16, u64>,
    /// vbuckets that answer stream requests with ROLLBACK
    pub(crate) rollbacks: HashMap<u16, (u64, u64)>,
    /// vbuckets that never confirm, to provoke feedback timeouts
    pub(crate) mute: Vec<u16>,
    /// stale opaque injected ahead of real confirmations
    pub(crate) stray_opaque: Option<u32>,
    pub(crate) feeder: Mutex<Option<Arc<TestFeeder>>>,
}

impl TestBucket {
    pub(crate) fn new(
        bucket: &str,
        vbmap: &[(&str, &[u16])],
        vbuuid: u64,
    ) -> TestBucket {
        let vbmap: HashMap<String, Vec<u16>> = vbmap
            .iter()
            .map(|(kvaddr, vbnos)| (kvaddr.to_string(), vbnos.to_vec()))
            .collect();
        let vbuuids = vbmap
            .values()
            .flatten()
            .map(|&vbno| (vbno, vbuuid))
            .collect();
        TestBucket {
            bucket: bucket.to_string(),
            vbmap,
            vbuuids,
            rollbacks: HashMap::new(),
            mute: Vec::new(),
            stray_opaque: None,
            feeder: Mutex::new(None),
        }
    }

    pub(crate) fn feeder(&self) -> Option<Arc<TestFeeder>> {
        self.feeder.lock().clone()
    }
}

#[async_trait]
impl BucketClient for TestBucket {
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
            .filter_map(|vbno| {
                self.vbuuids.get(vbno).map(|&uuid| FailoverLog {
                    vbno: *vbno as u32,
                    vbuuids: vec![uuid, uuid ^ 0xFF],
                    seqnos: vec![0, 0],
                })
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
        let feeder = Arc::new(TestFeeder {
            bucket: self.bucket.clone(),
            vb_owner,
            rollbacks: self.rollbacks.clone(),
            mute: self.mute.clone(),
            tx,
            rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
            stray_opaque: self.stray_opaque,
        });
        *self.feeder.lock() = Some(feeder.clone());
        Ok(feeder as Arc<dyn BucketFeeder>)
    }
}

/// Scripted producer cluster keyed by bucket name.
#[derive(Default)]
pub(crate) struct TestCluster {
    pub(crate) buckets: Mutex<HashMap<String, Arc<TestBucket>>>,
}

impl TestCluster {
    pub(crate) fn with_bucket(bucket: TestBucket) -> Arc<TestCluster> {
        let cluster = TestCluster::default();
        cluster.buckets.lock().insert(bucket.bucket.clone(), Arc::new(bucket));
        Arc::new(cluster)
    }

    pub(crate) fn add_bucket(
        &self,
        bucket: TestBucket,
    ) {
        self.buckets.lock().insert(bucket.bucket.clone(), Arc::new(bucket));
    }

    pub(crate) fn bucket(
        &self,
        name: &str,
    ) -> Option<Arc<TestBucket>> {
        self.buckets.lock().get(name).cloned()
    }
}

#[async_trait]
impl ClusterClient for TestCluster {
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

// ---- consumer side

/// Mutation handler recording every dispatch.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    pub(crate) mutations: Mutex<Vec<(StreamId, Mutation, usize)>>,
    pub(crate) conn_errors: Mutex<Vec<(StreamId, ConnectionError)>>,
}

impl MutationHandler for RecordingHandler {
    fn dispatch(
        &self,
        stream_id: StreamId,
        mutation: &Mutation,
        offset: usize,
    ) {
        self.mutations.lock().push((stream_id, mutation.clone(), offset));
    }

    fn handle_connection_error(
        &self,
        stream_id: StreamId,
        err: ConnectionError,
    ) {
        self.conn_errors.lock().push((stream_id, err));
    }
}

// ---- builders

pub(crate) fn test_instance(
    id: u64,
    bucket: &str,
    state: IndexState,
    endpoints: &[&str],
) -> Instance {
    Instance {
        instance_id: id,
        state: state as i32,
        definition: Some(IndexDefn {
            defn_id: id,
            bucket: bucket.to_string(),
            name: format!("idx-{id}"),
            sec_exprs: vec!["`city`".to_string()],
        }),
        endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
    }
}

pub(crate) fn test_ts(
    bucket: &str,
    entries: &[(u16, u64, u64)],
) -> TsVbuuid {
    let mut ts = TsVbuuid::new("default", bucket, entries.len());
    for &(vbno, seqno, vbuuid) in entries {
        ts.append(vbno, seqno, vbuuid, 0, seqno);
    }
    ts
}

/// Poll `probe` until it returns true or ~2s elapse.
pub(crate) async fn eventually<F>(mut probe: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if probe() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    false
}

pub(crate) fn upsert(
    bucket: &str,
    kvaddr: &str,
    vbno: u16,
    seqno: u64,
    key: &str,
    value: &str,
) -> Mutation {
    let mut m = Mutation::control(bucket, kvaddr, vbno, 0xB0, seqno, 0, MutationKind::Upsert);
    m.key = Bytes::from(key.to_string());
    m.value = Bytes::from(value.to_string());
    m
}
