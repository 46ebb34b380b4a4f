use thiserror::Error;

/// Errors raised by the shared model, schema, and configuration layers.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invalid date value for {key}: {value}")]
    InvalidDate { key: String, value: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
