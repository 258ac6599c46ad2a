use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HolisticError {
    #[error("holistic tracking is not initialized")]
    NotInitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unsupported image format tag {0}")]
    UnsupportedFormat(i32),

    #[error("model path {} does not exist", .0.display())]
    ModelPathMissing(PathBuf),

    #[error("failed to load config {}: {message}", .path.display())]
    Config { path: PathBuf, message: String },

    #[error("camera error: {0}")]
    Camera(String),

    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HolisticError>;
