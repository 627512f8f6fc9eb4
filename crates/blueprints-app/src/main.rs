//! Main application entry point.

use blueprints_app::{App, AppConfig};

fn main() {
    env_logger::init();
    log::info!("Starting Blueprints");

    let config = AppConfig::from_env();
    match App::from_config(&config) {
        Ok(app) => app.run(),
        Err(e) => {
            log::error!("Failed to start: {e}");
            std::process::exit(1);
        }
    }
}
