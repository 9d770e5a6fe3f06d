//! Error types shared across the crate

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunerError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Invalid configuration for `{field}`: {reason}")]
    Config { field: String, reason: String },

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TunerError {
    pub fn config(field: &str, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub type TunerResult<T> = Result<T, TunerError>;
