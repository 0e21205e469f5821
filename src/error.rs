use crate::state::StateDictDiff;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptionerError {
    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Json deser error: {0}")]
    JsonDeserError(#[from] serde_json::Error),
    #[error("Hugging Face Hub error: {0}")]
    ApiError(#[from] hf_hub::api::sync::ApiError),
    #[error("model path not found: {}", .0.display())]
    ModelPathNotFound(PathBuf),
    #[error("state dict mismatch: {0}")]
    StateDictMismatch(StateDictDiff),
    #[error("invalid keyword arguments: {0}")]
    InvalidKwargs(String),
    #[error("dataset error: {0}")]
    Dataset(String),
    #[error("unknown zoo key '{0}'")]
    UnknownZooKey(String),
}

pub type Result<T> = std::result::Result<T, CaptionerError>;
