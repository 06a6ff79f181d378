use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mailsum::{MailService, ServiceConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mailsum=info")),
        )
        .init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let service = match MailService::new(config) {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to start: {}", e);
            std::process::exit(1);
        }
    };

    service.start_background();
    info!("mailsum running; press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    service.shutdown().await;
}

fn load_config() -> Result<ServiceConfig, String> {
    if let Some(path) = std::env::args().nth(1) {
        return ServiceConfig::load(&PathBuf::from(&path))
            .map_err(|e| format!("Failed to load {}: {}", path, e));
    }
    for path in ServiceConfig::default_paths() {
        if path.exists() {
            return ServiceConfig::load(&path)
                .map_err(|e| format!("Failed to load {:?}: {}", path, e));
        }
    }
    Err("No configuration file found; pass a path or create one under the config directory"
        .to_string())
}
