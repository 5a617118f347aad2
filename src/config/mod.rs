pub mod settings;

pub use settings::{Config, DEFAULT_KEY_NAME};

use crate::error::GatewayError;
use std::sync::Arc;

/// Loads and returns the engine configuration as an `Arc<Config>`.
///
/// Reads a `.env` file if present, then the process environment, and
/// validates the result before handing it out.
pub fn load_config() -> Result<Arc<Config>, GatewayError> {
    dotenv::dotenv().ok();
    let config = Config::from_env();
    config.validate()?;
    log::info!(
        "Gateway configuration loaded: host={}, keys={}, rps={}, key_rps={}, key_limit={}",
        config.host,
        config.keys.len(),
        config.rps,
        config.key_rps,
        config.key_limit
    );
    Ok(Arc::new(config))
}
