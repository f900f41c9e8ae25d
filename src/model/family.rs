//! Family-member wrapper around `CoronaTest`
//!
//! Family-member tests carry a display name plus UI freshness flags; the
//! underlying lifecycle state is the same `CoronaTest` the single-user
//! service tracks.

use crate::model::test::CoronaTest;
use serde::{Deserialize, Serialize};

/// A COVID-19 test tracked on behalf of a family member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyMemberTest {
    /// User-chosen name shown in the test list
    pub display_name: String,
    /// Underlying tracked test
    pub test: CoronaTest,
    /// True until the user opened the test entry for the first time
    pub is_new: bool,
    /// True until the user has seen the most recent result change
    pub test_result_is_new: bool,
    /// Whether the point of care supports certificate issuance for this test
    pub certificate_supported_by_point_of_care: bool,
}

impl FamilyMemberTest {
    /// Wrap a freshly registered test for a family member
    pub fn new(
        display_name: String,
        test: CoronaTest,
        certificate_supported_by_point_of_care: bool,
    ) -> Self {
        Self {
            display_name,
            test,
            is_new: true,
            test_result_is_new: false,
            certificate_supported_by_point_of_care,
        }
    }

    /// Stable local identity of the wrapped test
    pub fn qr_code_hash(&self) -> &str {
        self.test.qr_code_hash()
    }

    /// The user opened the test entry
    pub fn mark_seen(&mut self) {
        self.is_new = false;
    }

    /// The user saw the latest result change
    pub fn mark_result_seen(&mut self) {
        self.test_result_is_new = false;
    }
}
