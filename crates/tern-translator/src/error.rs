use thiserror::Error;

pub type Result<T> = std::result::Result<T, TranslatorError>;

#[derive(Debug, Error)]
pub enum TranslatorError {
    #[error("failed to extract translator library: {0}")]
    Extract(#[from] std::io::Error),

    #[error("failed to load translator library: {0}")]
    Load(#[from] libloading::Error),

    #[error("translator rejected cpu type {0:?}")]
    UnsupportedCpuType(String),
}
