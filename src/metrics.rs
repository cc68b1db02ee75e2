use lazy_static::lazy_static;
use prometheus::{register_counter, register_histogram, Counter, Histogram, HistogramOpts, Opts};

lazy_static! {
    // Decision metrics
    pub static ref NOTIFICATIONS_GENERATED: Counter = register_counter!(Opts::new(
        "notifications_generated_total",
        "Total number of reminder candidates emitted by the rule engine"
    ))
    .unwrap();

    pub static ref NOTIFICATIONS_SUPPRESSED: Counter = register_counter!(Opts::new(
        "notifications_suppressed_total",
        "Total number of sends denied by user preferences"
    ))
    .unwrap();

    pub static ref LOCAL_NOTIFICATIONS_SCHEDULED: Counter = register_counter!(Opts::new(
        "local_notifications_scheduled_total",
        "Total number of one-shot local timers registered"
    ))
    .unwrap();

    // Delivery metrics
    pub static ref PUSH_MESSAGES_SENT: Counter = register_counter!(Opts::new(
        "push_messages_sent_total",
        "Total number of push messages accepted by the provider"
    ))
    .unwrap();

    pub static ref PUSH_MESSAGES_FAILED: Counter = register_counter!(Opts::new(
        "push_messages_failed_total",
        "Total number of push messages rejected or lost"
    ))
    .unwrap();

    pub static ref TOKENS_DEACTIVATED: Counter = register_counter!(Opts::new(
        "push_tokens_deactivated_total",
        "Total number of push tokens deactivated"
    ))
    .unwrap();

    pub static ref PUSH_BATCH_SIZE: Histogram = register_histogram!(
        HistogramOpts::new("push_batch_size", "Number of messages per provider request")
            .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0])
    )
    .unwrap();

    pub static ref PUSH_BATCH_LATENCY: Histogram = register_histogram!(
        HistogramOpts::new(
            "push_batch_latency_seconds",
            "Latency of provider batch submissions"
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0])
    )
    .unwrap();
}

pub fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return format!("Error encoding metrics: {}", e);
    }

    match String::from_utf8(buffer) {
        Ok(metrics) => metrics,
        Err(e) => format!("Error converting metrics to string: {}", e),
    }
}
