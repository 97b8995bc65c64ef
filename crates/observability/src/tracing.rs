//! JSON log output filtered by `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Default directive when `RUST_LOG` is unset or unparseable.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

pub(crate) fn init() {
    let filter = filter_from(std::env::var("RUST_LOG").ok().as_deref());

    // Span fields (job_id, job_type, attempt) ride along on every event.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

fn filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
