use std::env;
use tracing_subscriber::{fmt, EnvFilter};

pub fn setup_logging() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    // RUST_LOG wins when set; otherwise build the default directive set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("vehicle_reminder_notifier={}", log_level))
            // Delivery and scheduling decisions stay visible
            .add_directive("vehicle_reminder_notifier::delivery=info".parse().unwrap())
            .add_directive("vehicle_reminder_notifier::scheduler=info".parse().unwrap())
            // Third-party noise
            .add_directive("tower_http=warn".parse().unwrap())
            .add_directive("a2=warn".parse().unwrap())
            .add_directive("reqwest=warn".parse().unwrap())
            .add_directive("sqlx=warn".parse().unwrap())
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    tracing::info!("Logging initialized");
}
