//! telemetry-bridge server binary.

use std::sync::Arc;
use telemetry_bridge::config::Config;
use telemetry_bridge::server::Server;
use telemetry_bridge::service::HttpModelService;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        service = %config.service_url,
        model = %config.model.name,
        algorithm = %config.model.algorithm,
        train_samples = config.train_samples,
        test_samples = config.test_samples,
        "Starting telemetry-bridge"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let service = Arc::new(HttpModelService::new(
        &config.service_url,
        config.request_timeout,
        config.training_timeout,
    )?);

    let server = match Server::start(&config, service.clone()).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return Err(e.into());
        }
    };

    match service.describe_model(&config.model.name).await {
        Ok(info) => debug!(%info, "Model service view of the model"),
        Err(e) => warn!(error = %e, "Could not describe model"),
    }

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await
        .map_err(|e| e as Box<dyn std::error::Error>)
}
