use tbdr_cs::StreamError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecordError>;

/// Failures that poison a command buffer recording.
///
/// The first one is kept on the command buffer and returned by `end()`; recording carries on
/// after it so callers only have to check once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("scratch buffer of {size} bytes exceeds the largest supported size")]
    ScratchTooLarge { size: u64 },

    #[error("out of host memory: {0}")]
    OutOfHostMemory(&'static str),
}
