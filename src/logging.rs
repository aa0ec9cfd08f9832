use crate::config::AppConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the tracing subscriber from configuration. `RUST_LOG` wins over
/// the configured level when set.
pub fn init(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    if config.log_json {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}
