//! The stream manager: keeps producer topics aligned with the index
//! topology store.
//!
//! Every public method takes the single manager lock; arguments for
//! blocking producer calls are deep-copied and the lock is released before
//! the call. Topology-change events arrive on a dedicated channel and are
//! processed sequentially; a panic inside one handler is recovered so a
//! malformed payload cannot kill the reconciler.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::monitor::StreamMonitor;
use super::stream::Stream;
use super::stream::StreamId;
use super::stream::StreamMessage;
use super::topology::add_instances_to_change_list;
use super::topology::ChangeRecord;
use super::topology::GlobalTopology;
use super::topology::IndexState;
use super::topology::IndexTopology;
use super::TopologyStore;
use crate::admin::StreamAdmin;
use crate::config::ManagerConfig;
use crate::constants::port_for_stream;
use crate::metrics::TOPOLOGY_CHANGE_METRIC;
use crate::mutation::MutationHandler;
use crate::proto::instance::Instance;
use crate::Result;
use crate::StreamError;

struct Inner {
    streams: HashMap<StreamId, Stream>,
    topologies: HashMap<String, IndexTopology>,
    is_closed: bool,
}

/// Consumer-side reconciler driving the producer admin surface from
/// topology change events.
pub struct StreamManager {
    store: Arc<dyn TopologyStore>,
    handler: Arc<dyn MutationHandler>,
    admin: Arc<dyn StreamAdmin>,
    monitor: Option<Arc<StreamMonitor>>,
    config: ManagerConfig,
    inner: Mutex<Inner>,
    stop_tx: watch::Sender<bool>,
}

impl StreamManager {
    pub fn new(
        store: Arc<dyn TopologyStore>,
        handler: Arc<dyn MutationHandler>,
        admin: Arc<dyn StreamAdmin>,
        monitor: Option<Arc<StreamMonitor>>,
        config: ManagerConfig,
    ) -> Arc<StreamManager> {
        let (stop_tx, _) = watch::channel(false);
        let manager = Arc::new(StreamManager {
            store,
            handler,
            admin,
            monitor: monitor.clone(),
            config,
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                topologies: HashMap::new(),
                is_closed: false,
            }),
            stop_tx,
        });
        if let Some(monitor) = monitor {
            monitor.start();
        }
        manager
    }

    /// Close every stream; the producers clean their side up when the
    /// connections drop.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.is_closed {
            return;
        }
        for stream in inner.streams.values_mut() {
            stream.close();
        }
        inner.streams.clear();
        if let Some(monitor) = &self.monitor {
            monitor.close();
        }
        inner.is_closed = true;
        let _ = self.stop_tx.send(true);
        info!("stream manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_closed
    }

    /// Spawn the bootstrap-and-reconcile loop.
    pub fn start_handling_topology_change(self: &Arc<Self>) {
        if !self.is_closed() {
            debug!("stream manager starts handling topology changes");
            let manager = self.clone();
            tokio::spawn(manager.run());
        }
    }

    /// Start a stream for listening only; the producer is not asked to
    /// stream anything until instances are added.
    pub fn start_stream(
        &self,
        stream_id: StreamId,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.is_closed {
            return Ok(());
        }
        if inner.streams.get(&stream_id).map(|s| s.status).unwrap_or(false) {
            debug!("stream {} already started", stream_id);
            return Ok(());
        }

        let port = port_for_stream(self.config.stream_port_base, stream_id);
        let stream = Stream::start(
            stream_id,
            port,
            self.handler.clone(),
            self.monitor.clone(),
        );
        inner.streams.insert(stream_id, stream);
        Ok(())
    }

    /// Message sender for the external wire receiver of `stream_id`.
    pub fn stream_sender(
        &self,
        stream_id: StreamId,
    ) -> Result<mpsc::Sender<StreamMessage>> {
        let inner = self.inner.lock();
        match inner.streams.get(&stream_id) {
            Some(stream) if stream.status => Ok(stream.sender()),
            _ => Err(StreamError::StreamNotOpen(stream_id.to_string()).into()),
        }
    }

    /// Ask the producers to stream every bucket that has indexes.
    pub async fn add_index_for_all_buckets(
        &self,
        stream_id: StreamId,
    ) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let buckets = self.buckets_with_indexes().await?;
        self.add_index_for_buckets(stream_id, buckets).await
    }

    /// Ask the producers to stream the given buckets: every instance in
    /// `READY` or `ACTIVE` state joins the stream.
    pub async fn add_index_for_buckets(
        &self,
        stream_id: StreamId,
        buckets: Vec<String>,
    ) -> Result<()> {
        self.ensure_stream_open(stream_id)?;

        let addr = self.addr_for_stream(stream_id);
        let mut all_instances: Vec<Instance> = Vec::new();
        for bucket in &buckets {
            let topology = self.store.topology_by_bucket(bucket).await?;
            for defn in &topology.definitions {
                let changes = add_instances_to_change_list(
                    None,
                    defn,
                    None,
                    Some(&[IndexState::Ready, IndexState::Active]),
                );
                all_instances.extend(changes.iter().map(|c| c.as_instance(&addr)));
            }
        }

        if all_instances.is_empty() {
            return Ok(());
        }
        self.admin
            .add_index_to_stream(stream_id, buckets, all_instances, None)
            .await
    }

    /// Drop every instance already marked `DELETED` from the stream.
    pub async fn delete_index_for_buckets(
        &self,
        stream_id: StreamId,
        buckets: Vec<String>,
    ) -> Result<()> {
        self.ensure_stream_open(stream_id)?;

        let mut deleted: Vec<u64> = Vec::new();
        for bucket in &buckets {
            let topology = self.store.topology_by_bucket(bucket).await?;
            for defn in &topology.definitions {
                let changes = add_instances_to_change_list(
                    None,
                    defn,
                    None,
                    Some(&[IndexState::Deleted]),
                );
                deleted.extend(changes.iter().map(|c| c.inst_id));
            }
        }

        if deleted.is_empty() {
            return Ok(());
        }
        self.admin
            .delete_index_from_stream(stream_id, buckets, deleted)
            .await
    }

    /// Ask the producers to rebuild a dead endpoint of the stream, e.g.
    /// after the mutation handler reported a connection error for it.
    pub async fn repair_endpoint_for_stream(
        &self,
        stream_id: StreamId,
        endpoint: String,
    ) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.ensure_stream_open(stream_id)?;
        self.admin.repair_endpoint_for_stream(stream_id, endpoint).await
    }

    /// Restart specific vbuckets of the stream at the given timestamps.
    pub async fn restart_stream_if_necessary(
        &self,
        stream_id: StreamId,
        timestamps: Vec<crate::proto::common::TsVbuuid>,
    ) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.admin.restart_stream_if_necessary(stream_id, timestamps).await
    }

    pub fn close_stream(
        &self,
        stream_id: StreamId,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.is_closed {
            return Ok(());
        }
        if let Some(mut stream) = inner.streams.remove(&stream_id) {
            stream.close();
        }
        Ok(())
    }

    // ---- bootstrap + reconciliation loop

    async fn run(self: Arc<Self>) {
        let mut changes = match self.store.listen_topology_updates("Stream Manager").await {
            Ok(changes) => changes,
            Err(err) => {
                error!("failed to listen to topology changes: {}", err);
                return;
            }
        };
        if let Err(err) = self.load_topology().await {
            error!("failed to load topology: {}", err);
            return;
        }
        if let Err(err) = self.initialize_maintenance_stream().await {
            error!("failed to initialize maintenance stream: {}", err);
            return;
        }

        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => return,
                raw = changes.recv() => match raw {
                    None => {
                        debug!("topology change channel closed, terminating");
                        return;
                    }
                    Some(raw) => {
                        // one malformed event must not kill the reconciler
                        if AssertUnwindSafe(self.on_topology_payload(raw))
                            .catch_unwind()
                            .await
                            .is_err()
                        {
                            warn!("panic in topology change handler, event ignored");
                        }
                    }
                }
            }
        }
    }

    async fn on_topology_payload(
        &self,
        raw: Bytes,
    ) {
        let topology = match IndexTopology::decode(&raw) {
            Ok(topology) => topology,
            Err(err) => {
                error!("topology change ignored: {}", err);
                return;
            }
        };
        TOPOLOGY_CHANGE_METRIC
            .with_label_values(&[&topology.bucket])
            .inc();
        if let Err(err) = self.handle_topology_change(topology).await {
            error!("handle_topology_change failed: {}. Ignored", err);
        }
    }

    /// Bootstrap: open the maintenance stream and align it with the
    /// current store contents.
    async fn initialize_maintenance_stream(&self) -> Result<()> {
        debug!("initializing maintenance stream");
        self.start_stream(StreamId::Maint)?;

        let buckets = self.buckets_with_indexes().await?;
        if buckets.is_empty() {
            return Ok(());
        }
        self.add_index_for_buckets(StreamId::Maint, buckets.clone()).await?;
        self.delete_index_for_buckets(StreamId::Maint, buckets).await?;
        Ok(())
    }

    /// Buckets named by the global topology. A store without one yet is
    /// treated as empty rather than a hard failure.
    async fn buckets_with_indexes(&self) -> Result<Vec<String>> {
        match self.store.global_topology().await? {
            Some(global) => Ok(global
                .topology_keys
                .iter()
                .map(|key| GlobalTopology::bucket_from_key(key).to_string())
                .collect()),
            None => {
                warn!("no global topology in the store yet");
                Ok(Vec::new())
            }
        }
    }

    async fn load_topology(&self) -> Result<()> {
        for bucket in self.buckets_with_indexes().await? {
            let topology = self.store.topology_by_bucket(&bucket).await?;
            self.inner.lock().topologies.insert(bucket, topology);
        }
        Ok(())
    }

    // ---- topology change handling

    async fn handle_topology_change(
        &self,
        new_topology: IndexTopology,
    ) -> Result<()> {
        debug!(
            "topology change for bucket {} version {}",
            new_topology.bucket, new_topology.version
        );
        self.handle_topology_change_for_maint_stream(&new_topology).await?;
        self.handle_topology_change_for_init_stream(&new_topology).await?;

        self.inner
            .lock()
            .topologies
            .insert(new_topology.bucket.clone(), new_topology);
        Ok(())
    }

    async fn handle_topology_change_for_maint_stream(
        &self,
        new_topology: &IndexTopology,
    ) -> Result<()> {
        let (open, old_topology) = self.stream_view(StreamId::Maint, &new_topology.bucket);
        if !open {
            return Ok(());
        }

        // instances moving CREATED -> READY join the stream
        self.handle_add_instances(
            StreamId::Maint,
            old_topology.as_ref(),
            new_topology,
            Some(&[IndexState::Created]),
            Some(&[IndexState::Ready]),
        )
        .await?;

        // instances moving out of READY/ACTIVE into DELETED leave it
        self.handle_delete_instances(
            StreamId::Maint,
            old_topology.as_ref(),
            new_topology,
            Some(&[IndexState::Active, IndexState::Ready]),
            Some(&[IndexState::Deleted]),
        )
        .await
    }

    async fn handle_topology_change_for_init_stream(
        &self,
        new_topology: &IndexTopology,
    ) -> Result<()> {
        let (open, old_topology) = self.stream_view(StreamId::Init, &new_topology.bucket);
        if !open {
            return Ok(());
        }

        self.handle_add_instances(
            StreamId::Init,
            old_topology.as_ref(),
            new_topology,
            Some(&[IndexState::Created]),
            Some(&[IndexState::Ready]),
        )
        .await?;

        // instances graduate out of the init stream when they become
        // active, and leave it when deleted
        self.handle_delete_instances(
            StreamId::Init,
            old_topology.as_ref(),
            new_topology,
            None,
            Some(&[IndexState::Deleted, IndexState::Active]),
        )
        .await
    }

    async fn handle_add_instances(
        &self,
        stream_id: StreamId,
        old_topology: Option<&IndexTopology>,
        new_topology: &IndexTopology,
        from_states: Option<&[IndexState]>,
        to_states: Option<&[IndexState]>,
    ) -> Result<()> {
        if let Some(old) = old_topology {
            if old.version == new_topology.version {
                debug!(
                    "unchanged topology version {} for bucket {}",
                    new_topology.version, new_topology.bucket
                );
                return Ok(());
            }
        }

        let changes = self.diff(old_topology, new_topology, from_states, to_states);
        if changes.is_empty() {
            debug!("no instances to add for bucket {}", new_topology.bucket);
            return Ok(());
        }

        let addr = self.addr_for_stream(stream_id);
        let instances: Vec<Instance> = changes.iter().map(|c| c.as_instance(&addr)).collect();
        self.ensure_stream_open(stream_id)?;
        self.admin
            .add_index_to_stream(stream_id, vec![new_topology.bucket.clone()], instances, None)
            .await
    }

    async fn handle_delete_instances(
        &self,
        stream_id: StreamId,
        old_topology: Option<&IndexTopology>,
        new_topology: &IndexTopology,
        from_states: Option<&[IndexState]>,
        to_states: Option<&[IndexState]>,
    ) -> Result<()> {
        let old = match old_topology {
            // nothing can transition without a predecessor
            None => return Ok(()),
            Some(old) => old,
        };
        if old.version == new_topology.version {
            return Ok(());
        }

        let changes = self.diff(Some(old), new_topology, from_states, to_states);
        if changes.is_empty() {
            return Ok(());
        }

        let to_be_deleted: Vec<u64> = changes.iter().map(|c| c.inst_id).collect();
        debug!(
            "deleting {} instances from {} for bucket {}",
            to_be_deleted.len(),
            stream_id,
            new_topology.bucket
        );
        self.ensure_stream_open(stream_id)?;
        self.admin
            .delete_index_from_stream(stream_id, vec![new_topology.bucket.clone()], to_be_deleted)
            .await
    }

    fn diff(
        &self,
        old_topology: Option<&IndexTopology>,
        new_topology: &IndexTopology,
        from_states: Option<&[IndexState]>,
        to_states: Option<&[IndexState]>,
    ) -> Vec<ChangeRecord> {
        let mut changes = Vec::new();
        for new_defn in &new_topology.definitions {
            let old_defn = old_topology
                .and_then(|old| old.find_index_definition(&new_defn.bucket, &new_defn.name));
            changes.extend(add_instances_to_change_list(
                old_defn, new_defn, from_states, to_states,
            ));
        }
        changes
    }

    // ---- helpers

    /// Listening status of the stream and a deep copy of the bucket's
    /// last-seen topology, taken under the lock.
    fn stream_view(
        &self,
        stream_id: StreamId,
        bucket: &str,
    ) -> (bool, Option<IndexTopology>) {
        let inner = self.inner.lock();
        let open = inner.streams.get(&stream_id).map(|s| s.status).unwrap_or(false);
        let old = inner.topologies.get(bucket).cloned();
        (open, old)
    }

    fn ensure_stream_open(
        &self,
        stream_id: StreamId,
    ) -> Result<()> {
        let inner = self.inner.lock();
        match inner.streams.get(&stream_id) {
            Some(stream) if stream.status => Ok(()),
            _ => Err(StreamError::StreamNotOpen(stream_id.to_string()).into()),
        }
    }

    /// Receive address published to producers for this stream.
    fn addr_for_stream(
        &self,
        stream_id: StreamId,
    ) -> String {
        format!(
            "{}:{}",
            self.config.local_host,
            port_for_stream(self.config.stream_port_base, stream_id)
        )
    }
}
