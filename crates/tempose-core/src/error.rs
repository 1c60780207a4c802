//! Error types for the temporal pose estimation system.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Model loading error: {0}")]
    ModelLoad(String),
}

pub type Result<T> = std::result::Result<T, Error>;
