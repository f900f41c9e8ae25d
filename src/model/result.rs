//! Test result states and raw server-code mapping

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Domain result of a tracked COVID-19 test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestResult {
    /// No result available yet
    Pending,
    /// Negative result
    Negative,
    /// Positive result
    Positive,
    /// Sample could not be evaluated
    Invalid,
    /// Test is past the backend retention window
    Expired,
}

impl TestResult {
    /// Map a raw server result code to a domain result.
    ///
    /// The backend encodes PCR results as 0-4 and rapid antigen results as 5-9;
    /// both ranges alias onto the same five states via `code % 5`:
    /// 0 pending, 1 negative, 2 positive, 3 invalid, 4 expired.
    /// Codes above 9 are outside both published ranges and are rejected.
    pub fn from_raw(code: u32) -> Result<Self> {
        if code > 9 {
            return Err(Error::UnknownTestResult(code));
        }
        Ok(match code % 5 {
            0 => TestResult::Pending,
            1 => TestResult::Negative,
            2 => TestResult::Positive,
            3 => TestResult::Invalid,
            _ => TestResult::Expired,
        })
    }

    /// Whether this result is terminal for notification/final-date purposes.
    ///
    /// Expired is a terminal display state but never stamps the
    /// final-result-received date.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TestResult::Negative | TestResult::Positive | TestResult::Invalid
        )
    }

    /// Convert from integer (database representation)
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(TestResult::Pending),
            1 => Some(TestResult::Negative),
            2 => Some(TestResult::Positive),
            3 => Some(TestResult::Invalid),
            4 => Some(TestResult::Expired),
            _ => None,
        }
    }

    /// Convert to integer (database representation)
    pub fn as_i64(&self) -> i64 {
        match self {
            TestResult::Pending => 0,
            TestResult::Negative => 1,
            TestResult::Positive => 2,
            TestResult::Invalid => 3,
            TestResult::Expired => 4,
        }
    }
}
