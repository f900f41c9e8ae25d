//! Wire structures for the verification server endpoints

use serde::{Deserialize, Serialize};

/// Kind of key exchanged for a registration token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    /// SHA-256 hash of the GUID scanned from a test QR code
    #[serde(rename = "GUID")]
    Guid,
    /// TeleTAN handed out by the health authority hotline
    #[serde(rename = "TELETAN")]
    TeleTan,
}

/// Request body for POST /version/v1/registrationToken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationTokenRequest {
    /// Hashed test identifier (or TeleTAN)
    pub key: String,
    /// What kind of key is being exchanged
    #[serde(rename = "keyType")]
    pub key_type: KeyType,
    /// Optional date-of-birth key; must start with "x" when present
    #[serde(rename = "keyDob", skip_serializing_if = "Option::is_none", default)]
    pub key_dob: Option<String>,
}

/// Response body for POST /version/v1/registrationToken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationTokenResponse {
    /// Opaque token used to poll for results
    #[serde(rename = "registrationToken")]
    pub registration_token: String,
}

/// Request body for POST /version/v1/testresult
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResultRequest {
    /// Token obtained at registration
    #[serde(rename = "registrationToken")]
    pub registration_token: String,
}

/// Response body for POST /version/v1/testresult
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResultResponse {
    /// Raw result code; PCR uses 0-4, antigen 5-9
    #[serde(rename = "testResult")]
    pub test_result: u32,
    /// Sample collection timestamp (epoch seconds), if reported
    #[serde(rename = "sc", skip_serializing_if = "Option::is_none", default)]
    pub sample_collected_at: Option<i64>,
    /// Laboratory identifier, if reported
    #[serde(rename = "labId", skip_serializing_if = "Option::is_none", default)]
    pub lab_id: Option<String>,
}

/// Request body for POST /version/v1/tan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TanRequest {
    /// Token to spend on a one-time submission TAN
    #[serde(rename = "registrationToken")]
    pub registration_token: String,
}

/// Response body for POST /version/v1/tan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TanResponse {
    /// One-time submission TAN
    pub tan: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_request_field_names() {
        let request = RegistrationTokenRequest {
            key: "abc".to_string(),
            key_type: KeyType::Guid,
            key_dob: Some("x123".to_string()),
        };
        let json = serde_json::to_value(&request).expect("Failed to serialize");
        assert_eq!(json["key"], "abc");
        assert_eq!(json["keyType"], "GUID");
        assert_eq!(json["keyDob"], "x123");
    }

    #[test]
    fn test_absent_dob_key_is_omitted() {
        let request = RegistrationTokenRequest {
            key: "abc".to_string(),
            key_type: KeyType::TeleTan,
            key_dob: None,
        };
        let json = serde_json::to_string(&request).expect("Failed to serialize");
        assert!(!json.contains("keyDob"));
        assert!(json.contains("TELETAN"));
    }

    #[test]
    fn test_result_response_optional_fields() {
        let response: TestResultResponse =
            serde_json::from_str(r#"{"testResult":6}"#).expect("Failed to deserialize");
        assert_eq!(response.test_result, 6);
        assert_eq!(response.sample_collected_at, None);
        assert_eq!(response.lab_id, None);

        let response: TestResultResponse =
            serde_json::from_str(r#"{"testResult":2,"sc":1650000000,"labId":"lab-1"}"#)
                .expect("Failed to deserialize");
        assert_eq!(response.sample_collected_at, Some(1_650_000_000));
        assert_eq!(response.lab_id.as_deref(), Some("lab-1"));
    }
}
