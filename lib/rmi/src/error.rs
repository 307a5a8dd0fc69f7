use thiserror::Error;

pub type Result<T, E = BlockError> = error_stack::Result<T, E>;

/// Closed set of causes for the block manager (spec.md §7's `BlockError` family), as opposed to
/// `net::NetError`'s open string-carrying variants — the set of ways a block request can fail
/// locally is small and known up front.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("no block set named {0:?}")]
    UnknownName(String),
    #[error("block {idx} of {name:?} not yet present")]
    BlockNotPresent { name: String, idx: usize },
    #[error("invalid block_size: {0}")]
    InvalidBlockSize(usize),
    #[error("could not reach any candidate for block {idx} of {name:?}")]
    NoReachableSource { name: String, idx: usize },
}

impl BlockError {
    pub fn unknown_name(name: impl Into<String>) -> Self {
        Self::UnknownName(name.into())
    }
}
