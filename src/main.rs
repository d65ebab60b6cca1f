use std::process::ExitCode;

use rh_bridge::config::load_config;
use rh_bridge::utils::logging;
use tracing::error;

/// Level used while the configuration itself is being read.
const BOOTSTRAP_LOG_LEVEL: &str = "info";

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let loaded = tracing::subscriber::with_default(
        logging::subscriber(BOOTSTRAP_LOG_LEVEL),
        load_config,
    );
    let settings = match loaded {
        Ok(settings) => settings,
        Err(e) => {
            logging::init(BOOTSTRAP_LOG_LEVEL);
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.log_level);

    match rh_bridge::app::run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Bridge failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
