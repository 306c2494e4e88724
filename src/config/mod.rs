pub mod settings;

pub use settings::{
    BackoffConfig, BatchingConfig, GovernorConfig, OptimizerConfig, RateLimiterConfig,
};

use crate::error::GovernorError;

/// Loads the configuration from the environment (a `.env` file is read first
/// when present) and validates it.
pub fn load_config() -> Result<GovernorConfig, GovernorError> {
    dotenv::dotenv().ok(); // Missing .env is fine

    let config = GovernorConfig::from_env();
    config.validate_and_log()?;

    Ok(config)
}
