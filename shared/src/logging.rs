//! Tracing/logging bootstrap for hosts embedding the client.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,expense_sync=debug";

/// Initialize the global tracing subscriber. Calling it again is a no-op.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `EXPENSE_SYNC_LOG`
/// 3) internal default filter
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_names(true)
        .with_env_filter(filter_from(|key| env::var(key).ok()))
        .try_init();
}

fn filter_from<F>(lookup: F) -> EnvFilter
where
    F: Fn(&str) -> Option<String>,
{
    let configured = [EnvFilter::DEFAULT_ENV, "EXPENSE_SYNC_LOG"]
        .into_iter()
        .filter_map(|key| lookup(key).filter(|v| !v.trim().is_empty()))
        .find_map(|value| EnvFilter::try_new(value).ok());
    configured.unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
