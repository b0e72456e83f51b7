//! Error types for minting and verifying macaroons.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BakeryError>;

#[derive(Error, Debug)]
pub enum BakeryError {
    /// The serialized macaroon could not be decoded.
    #[error("Cannot deserialize Macaroon: {0}")]
    Malformed(String),

    /// A caveat body does not follow the `key op value` grammar.
    #[error("Cannot parse caveat: {0}")]
    InvalidCondition(String),

    #[error("Third-party caveats are not supported (location: {0})")]
    UnsupportedThirdParty(String),

    /// A caveat was rejected, or no verifier claimed it.
    #[error("Caveat is not satisfied: {0}")]
    Unsatisfied(String),

    #[error("Macaroon signature does not match")]
    InvalidSignature,

    #[error("Cannot find root key for identifier: {0}")]
    UnknownRootKey(String),

    #[error("Root key store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl BakeryError {
    /// Format and protocol errors are never worth retrying; only a store outage is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BakeryError::Store(_))
    }
}
