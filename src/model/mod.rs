//! Domain model for tracked COVID-19 tests
//!
//! The module is organized into submodules:
//! - `result` - Test result enum and raw server-code mapping
//! - `test` - The `CoronaTest` tagged union (PCR / antigen) and its accessors
//! - `family` - Family-member wrapper around `CoronaTest`

// Submodules
pub mod family;
pub mod result;

// Re-export commonly used types
pub use family::FamilyMemberTest;
pub use result::TestResult;
pub use test::{AntigenTest, CoronaTest, PcrTest, TestCommon, TestResultChange, TestType};

// Re-export main functions
pub use test::hash_qr_payload;
