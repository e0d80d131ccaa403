//! PKI error types.

use thiserror::Error;

use kilngrid_state::StateError;

/// Result type alias for CA and certificate operations.
pub type PkiResult<T> = Result<T, PkiError>;

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("no CA stored in {namespace}/{secret}")]
    CaNotFound { namespace: String, secret: String },

    #[error("unsupported key algorithm: {0}")]
    UnsupportedKeyAlgorithm(String),

    #[error("invalid PEM material: {0}")]
    InvalidPem(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate signing failed: {0}")]
    Signing(String),

    #[error("invalid certificate request: {0}")]
    InvalidRequest(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl PkiError {
    /// Material exists but cannot serve as the CA.
    pub fn is_corrupt_material(&self) -> bool {
        matches!(self, Self::UnsupportedKeyAlgorithm(_) | Self::InvalidPem(_))
    }
}
