pub mod api_error;
pub mod config_error;

pub use api_error::ApiError;
pub use config_error::ConfigError;
