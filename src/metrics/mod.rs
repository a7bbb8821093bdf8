
use lazy_static::lazy_static;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::exponential_buckets;

lazy_static! {
    pub static ref FEED_CONTROL_OPS_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("feed_control_ops", "Control operations handled per topic"),
        &["topic", "op"]
    )
    .expect("metric can not be created");
    pub static ref FEED_FEEDBACK_TIMEOUT_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "feed_feedback_timeouts",
            "Feedback waits that expired before every vbucket reported"
        ),
        &["topic", "bucket"]
    )
    .expect("metric can not be created");
    pub static ref FEED_ROLLBACK_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("feed_rollbacks", "Per-vbucket rollbacks reported by the producer"),
        &["topic", "bucket"]
    )
    .expect("metric can not be created");
    pub static ref MUTATIONS_ROUTED_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("mutations_routed", "Data events routed to endpoints"),
        &["bucket", "kvaddr"]
    )
    .expect("metric can not be created");
    pub static ref ADMIN_REQUEST_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("admin_requests", "Admin transport requests by kind"),
        &["kind"]
    )
    .expect("metric can not be created");
    pub static ref ADMIN_REQUEST_DURATION_METRIC: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "admin_request_duration_ms",
            "Histogram of admin request round-trip duration in ms"
        )
        .buckets(exponential_buckets(1.0, 2.0, 12).unwrap()),
        &["kind"]
    )
    .expect("metric can not be created");
    pub static ref TOPOLOGY_CHANGE_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("topology_changes", "Topology change events processed per bucket"),
        &["bucket"]
    )
    .expect("metric can not be created");
    pub static ref STREAM_RESTART_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("stream_restarts", "Restart requests issued by the stream monitor"),
        &["stream"]
    )
    .expect("metric can not be created");
    pub static ref ACTIVE_TOPIC_METRIC: IntGaugeVec =
        IntGaugeVec::new(Opts::new("active_topics", "Topics currently hosted"), &["node"])
            .expect("metric can not be created");
    pub static ref CUSTOM_REGISTRY: Registry =
        Registry::new_custom(Some("vbflow".to_string()), None).unwrap();
}

/// Register every control-plane metric with `registry`. The host process
/// owns the export path; this crate only populates the collectors.
pub(crate) fn register_custom_metrics(registry: &Registry) {
    registry
        .register(Box::new(FEED_CONTROL_OPS_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(FEED_FEEDBACK_TIMEOUT_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(FEED_ROLLBACK_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(MUTATIONS_ROUTED_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(ADMIN_REQUEST_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(ADMIN_REQUEST_DURATION_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(TOPOLOGY_CHANGE_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(STREAM_RESTART_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(ACTIVE_TOPIC_METRIC.clone()))
        .expect("collector can be registered");
}
