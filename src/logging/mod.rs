use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Install the process-wide subscriber with an `info` default filter.
pub fn init_logging() -> Result<(), SetGlobalDefaultError> {
    init_logging_with("info")
}

/// Install the process-wide subscriber. `RUST_LOG` wins over `default_directive`.
pub fn init_logging_with(default_directive: &str) -> Result<(), SetGlobalDefaultError> {
    let filter: EnvFilter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let formatting_layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .compact();

    let subscriber = Registry::default().with(filter).with(formatting_layer);

    tracing::subscriber::set_global_default(subscriber)
}
