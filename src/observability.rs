//! Structured logging setup.

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Initialize JSON-formatted tracing for the process. `config.service.log_level`
/// is used as the `tracing_subscriber::EnvFilter` directive, falling back to
/// `info` if it doesn't parse.
pub fn init_tracing(config: &Config) -> Result<()> {
    let log_level = config.service.log_level.clone();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Tracing initialized for service: {}", config.service.name);

    Ok(())
}

/// No-op hook kept for symmetry with `init_tracing`; there is no span
/// exporter to flush without an OpenTelemetry pipeline.
pub fn shutdown_tracing() {
    tracing::info!("Tracing shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_without_otlp() {
        let config = Config::default();
        // This should not panic
        let _ = init_tracing(&config);
    }
}
