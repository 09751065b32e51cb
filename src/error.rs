use std::io;
use thiserror::Error;

/// Result type for package operations
pub type Result<T> = std::result::Result<T, PkgError>;

/// Unified error type for all package operations
#[derive(Debug, Error)]
pub enum PkgError {
    // Caller errors
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Invalid file: {0}")]
    InvalidFile(String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Permission denied: {0}")]
    NoPermission(String),

    #[error("Out of memory: {0}")]
    NoneMemory(String),

    // Format errors
    #[error("Invalid package format: {0}")]
    InvalidPkgFormat(String),

    #[error("Invalid lz4 data: {0}")]
    InvalidLz4(String),

    #[error("Algorithm not supported: {0}")]
    NotExistAlgorithm(String),

    #[error("Invalid stream: {0}")]
    InvalidStream(String),

    // Integrity errors
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Verification failed: {0}")]
    VerifyFailed(String),

    #[error("CRC mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(String),
}

impl From<toml::de::Error> for PkgError {
    fn from(err: toml::de::Error) -> Self {
        PkgError::TomlError(err.to_string())
    }
}

impl From<toml::ser::Error> for PkgError {
    fn from(err: toml::ser::Error) -> Self {
        PkgError::TomlError(err.to_string())
    }
}

impl From<rsa::Error> for PkgError {
    fn from(err: rsa::Error) -> Self {
        PkgError::InvalidSignature(err.to_string())
    }
}

impl From<p256::ecdsa::Error> for PkgError {
    fn from(err: p256::ecdsa::Error) -> Self {
        PkgError::InvalidSignature(err.to_string())
    }
}

impl From<x509_cert::der::Error> for PkgError {
    fn from(err: x509_cert::der::Error) -> Self {
        PkgError::InvalidFile(format!("malformed DER: {}", err))
    }
}
