use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("transaction rejected: {0}")]
    Transaction(String),
    #[error("invalid proof: {0}")]
    InvalidProof(String),
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
    #[error("tip stream ended: {0}")]
    TipStreamEnded(&'static str),
    #[error("transition stream overflowed: {0}")]
    EmissionOverflow(&'static str),
    #[error("task failed: {0}")]
    Task(&'static str),
    #[error("mining cancelled")]
    MiningCancelled,
    #[error("bundling failed")]
    BundlingFailed,
}

pub type ChainResult<T> = Result<T, ChainError>;
