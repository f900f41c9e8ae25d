//! Test-certificate issuance hand-off
//!
//! The registry starts issuance at most once per test (the flag flips
//! inside the same mutation that applies the negative result); the actual
//! certificate work happens in an external collaborator which reports the
//! issued identifier back through the service's `certificate_issued`.

use crate::model::TestType;
use chrono::{DateTime, Utc};
use tracing::info;

/// Everything the issuance collaborator needs to start a certificate request.
///
/// Deliberately excludes the qr_code_hash: the collaborator identifies the
/// test by registration token when reporting back.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateRequest {
    /// Registration token of the test the certificate is for
    pub registration_token: String,
    /// When the test was registered
    pub registration_date: DateTime<Utc>,
    /// Laboratory identifier, if the result response carried one
    pub lab_id: Option<String>,
    /// Kind of the underlying test
    pub test_type: TestType,
}

/// Starts test-certificate issuance
pub trait CertificateIssuer: Send + Sync {
    /// Begin issuance for the given request. Called at most once per test;
    /// must not block the calling task.
    fn issue(&self, request: CertificateRequest);
}

/// Log-only issuer, useful as a default and in headless deployments
#[derive(Debug, Default)]
pub struct TracingIssuer;

impl CertificateIssuer for TracingIssuer {
    fn issue(&self, request: CertificateRequest) {
        info!(
            "Certificate issuance requested for {} test registered {}",
            request.test_type, request.registration_date
        );
    }
}
