pub mod alert;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod model;
pub mod rpc;
pub mod runtime;
pub mod taskgroup;

/// Installs the `tracing` subscriber used by the binary. `RUST_LOG` overrides the
/// default filter.
pub fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
