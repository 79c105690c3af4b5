//! Thin reference binary wiring `fleet-core`'s default service together.
//!
//! Not the product: consumers embed the library and bind their own admin
//! routes via [`fleet_core::service_builder::ServiceBuilder::with_routes`].
//! This binary exists so the crate's defaults are exercised end-to-end.

use fleet_core::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("warning: failed to load config ({e}), using defaults");
        Config::default()
    });

    init_tracing(&config)?;

    let state = AppState::builder().config(config.clone()).build().await?;

    let service = ServiceBuilder::new(config, state).build();
    service.serve().await
}
