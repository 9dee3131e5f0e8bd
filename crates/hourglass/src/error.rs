use thiserror::Error;

#[derive(Error, Debug)]
pub enum HourglassError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("channel mismatch: expected {expected}, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("input {height}x{width} is not divisible by {factor}")]
    IndivisibleInput {
        height: usize,
        width: usize,
        factor: usize,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HourglassError>;

impl From<HourglassError> for candle_core::Error {
    fn from(err: HourglassError) -> Self {
        match err {
            HourglassError::Candle(inner) => inner,
            other => candle_core::Error::wrap(other),
        }
    }
}
