use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

/// Recoverable failures while building command streams.
///
/// Packet framing mistakes are not represented here; they are caller bugs and trip debug
/// assertions instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("sub-stream arena exhausted: requested {requested} words, {remaining} remaining")]
    SubStreamExhausted { requested: u64, remaining: u64 },

    #[error("sub-stream overrun: reserved {reserved} words, wrote {written}")]
    SubStreamOverrun { reserved: usize, written: usize },

    #[error("sub-stream allocation at offset {offset} is out of range")]
    BadAllocation { offset: u64 },
}
