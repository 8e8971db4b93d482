//! feedscale Observability
//!
//! Prometheus metrics and structured logging setup shared by the agent and the scaler.
//!
//! # Usage
//!
//! ```no_run
//! use feedscale_observability::{exporter, init_tracing, metrics};
//!
//! init_tracing("info");
//! metrics::init();
//!
//! let metrics_router: axum::Router = exporter::create_metrics_router();
//! ```

pub mod exporter;
pub mod metrics;

pub use metrics::{init as init_metrics, REGISTRY};

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` wins over `default_directive`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Initialize all observability components
pub fn init() {
    metrics::init();
    init_tracing("info");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_init_is_safe() {
        init();
        init();
        let _registry = &*REGISTRY;
    }

    #[test]
    fn test_init_metrics_alias() {
        init_metrics();
    }
}
