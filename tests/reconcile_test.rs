//! Full-loop reconciliation: topology store -> stream manager -> admin
//! transport -> topic feed controller -> producer.

mod common;

use std::sync::Arc;

use common::*;
use vbflow::admin::AdminClient;
use vbflow::admin::AdminServer;
use vbflow::admin::ProjectorContext;
use vbflow::manager::IndexState;
use vbflow::manager::StreamId;
use vbflow::manager::StreamManager;

struct Loop {
    server: AdminServer,
    manager: Arc<StreamManager>,
    store: Arc<SimStore>,
}

async fn spawn_loop() -> Loop {
    init_tracing();
    let cluster = SimCluster::with_bucket(SimBucket::new("b1", &[("kv1:11210", &[0, 1, 2])], 0xAA));
    let ctx = ProjectorContext {
        cluster: "cluster:8091".into(),
        local_addr: "proj-node-1".into(),
        kvaddrs: vec!["kv1:11210".into()],
        cluster_client: cluster,
        endpoint_factory: sink_endpoint_factory(),
    };
    let config = loopback_config();
    let server = AdminServer::serve(ctx, config.clone()).await.unwrap();
    let client = Arc::new(AdminClient::new(
        &server.local_addr().to_string(),
        config.network.clone(),
    ));

    let store = SimStore::new(topology_v(1, "b1", &[(42, IndexState::Ready)]));
    let manager = StreamManager::new(
        store.clone(),
        Arc::new(NullHandler::default()),
        client,
        None,
        config.manager.clone(),
    );
    manager.start_handling_topology_change();

    Loop {
        server,
        manager,
        store,
    }
}

async fn engine_names(
    server: &AdminServer,
    topic: &str,
) -> Vec<String> {
    match server.topic_feed(topic).await {
        None => Vec::new(),
        Some(feed) => match feed.get_statistics().await {
            Ok(stats) => stats["engines"]
                .as_array()
                .map(|names| {
                    names
                        .iter()
                        .map(|v| v.as_str().unwrap_or_default().to_string())
                        .collect()
                })
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        },
    }
}

#[tokio::test]
async fn topology_transitions_drive_the_producer() {
    let fixture = spawn_loop().await;
    let topic = StreamId::Maint.topic_name();

    // bootstrap: the READY instance 42 reaches the producer
    assert!(
        eventually_async(|| engine_names(&fixture.server, topic), |names| *names
            == vec!["42".to_string()])
        .await,
        "bootstrap never subscribed instance 42"
    );

    // CREATED -> READY: 43 joins the stream
    fixture
        .store
        .publish(topology_v(
            2,
            "b1",
            &[(42, IndexState::Ready), (43, IndexState::Ready)],
        ))
        .await;
    assert!(
        eventually_async(|| engine_names(&fixture.server, topic), |names| *names
            == vec!["42".to_string(), "43".to_string()])
        .await,
        "instance 43 never joined"
    );

    // READY -> DELETED: 42 leaves the stream
    fixture
        .store
        .publish(topology_v(
            3,
            "b1",
            &[(42, IndexState::Deleted), (43, IndexState::Ready)],
        ))
        .await;
    assert!(
        eventually_async(|| engine_names(&fixture.server, topic), |names| *names
            == vec!["43".to_string()])
        .await,
        "instance 42 never left"
    );

    fixture.manager.close();
    fixture.server.shutdown().await;
}

/// Poll an async probe until `check` accepts its output or ~3s elapse.
async fn eventually_async<F, Fut, T, C>(
    mut probe: F,
    check: C,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = T>,
    C: Fn(&T) -> bool,
{
    for _ in 0..150 {
        if check(&probe().await) {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    false
}
