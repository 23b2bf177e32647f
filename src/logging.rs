use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{fmt, MakeWriter};
use tracing_subscriber::util::SubscriberInitExt;

/// Initializes JSON line logging for services embedding a cache.
///
/// Library code only emits `tracing` events; embedders that already have a
/// subscriber should keep using it and skip this helper.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(make_writer)
        .finish()
        .init();
}

/// Initializes human-readable logging, mainly for local runs and examples.
pub fn init_pretty_logging(env_filter: &str) {
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .finish()
        .init();
}
