//! Verification-server client module
//!
//! This module handles all communication with the remote verification
//! backend:
//! - `api` - Wire request/response structures
//! - `verification` - HTTP client for the registrationToken/testresult/tan endpoints
//! - `padding` - Decoy traffic dispatched whenever a real call was skipped

// Submodules
pub mod api;
pub mod padding;
pub mod verification;

// Re-export commonly used types
pub use api::{
    KeyType, RegistrationTokenRequest, RegistrationTokenResponse, TanRequest, TanResponse,
    TestResultRequest, TestResultResponse,
};
pub use padding::TrafficPadding;
pub use verification::VerificationClient;
