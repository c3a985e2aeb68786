use thiserror::Error;

#[derive(Error, Debug)]
pub enum AlmanacError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Unsupported blockchain: {0}")]
    UnsupportedChain(String),

    #[error("Hex parse error: {0}")]
    Hex(String),

    #[error("ABI parse error: {0}")]
    AbiParse(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("errors occurred during crawling: {}", .0.join("; "))]
    Workers(Vec<String>),
}

impl AlmanacError {
    /// True when the error aggregates failures from parallel workers.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, AlmanacError::Workers(_))
    }
}
