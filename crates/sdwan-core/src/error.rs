//! Error types for the core crate

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed identity text
    #[error("identity error: {0}")]
    Identity(#[from] crate::identity::IdentityError),

    /// Address derivation invoked with invalid arguments
    #[error("address error: {0}")]
    Address(#[from] crate::address::AddressError),
}
