//! Covtest - COVID-19 test lifecycle service
//!
//! This library tracks COVID-19 tests (PCR and rapid antigen) against a remote
//! verification backend: registration, asynchronous result polling, persistence,
//! outdated-state aging, local notifications and privacy-preserving decoy traffic.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod model;
pub mod service;
pub mod store;

use model::TestType;

/// Result type alias for Covtest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Covtest operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport-level HTTP failure (connect, body read, request build)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Verification server answered with an unexpected status code
    #[error("Unexpected response status: {0}")]
    UnexpectedStatus(u16),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Storage operation error
    #[error("Storage error: {0}")]
    Storage(String),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Date-of-birth key failed local validation (must start with "x")
    #[error("Malformed date of birth key")]
    MalformedDateOfBirthKey,

    /// The test has no registration token (never issued, or already spent on a TAN)
    #[error("No registration token available")]
    NoRegistrationToken,

    /// A test of this type is already tracked
    #[error("A {0} test is already registered")]
    TestAlreadyRegistered(TestType),

    /// No tracked test of the requested type
    #[error("No {0} test registered")]
    NoTestOfRequestedType(TestType),

    /// No tracked test carries the given identity
    #[error("No tracked test with this identity")]
    UnknownTest,

    /// Server sent a result code outside the published ranges
    #[error("Unknown raw test result code: {0}")]
    UnknownTestResult(u32),

    /// A freshly registered test must not already be expired
    #[error("Test was already expired at registration")]
    ExpiredAtRegistration,

    /// Registration token unknown to the verification server (HTTP 400)
    #[error("Registration token not found on the verification server")]
    QrCodeNotFound,
}

/// Initialize the Covtest library with logging
pub fn init() {
    tracing_subscriber::fmt::init();
}

#[cfg(test)]
mod tests;
