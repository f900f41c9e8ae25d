//! HTTP client for the verification server
//!
//! All three endpoints are JSON POSTs. Every request carries a `cwa-fake`
//! header so genuine and decoy traffic are byte-shaped alike; the server
//! discards decoys, an on-path observer cannot tell them apart.
//!
//! No request is ever retried here. Callers re-invoke polling on their own
//! schedule (timer, foreground resume).

use crate::client::api::{
    KeyType, RegistrationTokenRequest, RegistrationTokenResponse, TanRequest, TanResponse,
    TestResultRequest, TestResultResponse,
};
use crate::model::hash_qr_payload;
use crate::{Error, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Header marking a request as genuine ("0") or decoy ("1")
pub const FAKE_HEADER: &str = "cwa-fake";

const REGISTRATION_TOKEN_PATH: &str = "/version/v1/registrationToken";
const TEST_RESULT_PATH: &str = "/version/v1/testresult";
const TAN_PATH: &str = "/version/v1/tan";

/// Client for the verification server
#[derive(Clone)]
pub struct VerificationClient {
    /// Base URL of the verification server, without trailing slash
    base_url: String,
    /// HTTP client for sending requests
    client: Client<HttpConnector, Full<Bytes>>,
}

impl VerificationClient {
    /// Create a new client for the given verification server
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Exchange a hashed key for a registration token.
    ///
    /// A present date-of-birth key is validated locally before any request:
    /// it must start with the literal prefix "x", otherwise the call fails
    /// with `MalformedDateOfBirthKey` and nothing is sent.
    pub async fn register_token(&self, request: &RegistrationTokenRequest) -> Result<String> {
        if let Some(key_dob) = &request.key_dob {
            if !key_dob.starts_with('x') {
                warn!("Rejecting registration with malformed date of birth key");
                return Err(Error::MalformedDateOfBirthKey);
            }
        }

        let (status, body) = self.post(REGISTRATION_TOKEN_PATH, request, false).await?;
        if !status.is_success() {
            warn!("Registration token request failed with status {}", status);
            return Err(Error::UnexpectedStatus(status.as_u16()));
        }

        let response: RegistrationTokenResponse = parse_body(&body)?;
        info!("Obtained registration token");
        Ok(response.registration_token)
    }

    /// Poll the raw test result for a registration token.
    ///
    /// HTTP 400 means the server no longer (or never did) know the token;
    /// that is surfaced as `QrCodeNotFound` and interpreted by the service
    /// layer against the retention horizon.
    pub async fn fetch_result(&self, registration_token: &str) -> Result<TestResultResponse> {
        let request = TestResultRequest {
            registration_token: registration_token.to_string(),
        };

        let (status, body) = self.post(TEST_RESULT_PATH, &request, false).await?;
        if status == StatusCode::BAD_REQUEST {
            info!("Verification server does not know this registration token");
            return Err(Error::QrCodeNotFound);
        }
        if !status.is_success() {
            warn!("Test result request failed with status {}", status);
            return Err(Error::UnexpectedStatus(status.as_u16()));
        }

        let response: TestResultResponse = parse_body(&body)?;
        debug!("Received raw test result code {}", response.test_result);
        Ok(response)
    }

    /// Spend a registration token on a one-time submission TAN
    pub async fn fetch_tan(&self, registration_token: &str) -> Result<String> {
        let request = TanRequest {
            registration_token: registration_token.to_string(),
        };

        let (status, body) = self.post(TAN_PATH, &request, false).await?;
        if !status.is_success() {
            warn!("TAN request failed with status {}", status);
            return Err(Error::UnexpectedStatus(status.as_u16()));
        }

        let response: TanResponse = parse_body(&body)?;
        info!("Obtained submission TAN");
        Ok(response.tan)
    }

    /// Send a decoy registration request with a plausible random key
    pub async fn fake_registration(&self) -> Result<()> {
        let request = RegistrationTokenRequest {
            key: hash_qr_payload(&Uuid::new_v4().to_string()),
            key_type: KeyType::Guid,
            key_dob: None,
        };
        self.post(REGISTRATION_TOKEN_PATH, &request, true).await?;
        debug!("Dispatched decoy registration request");
        Ok(())
    }

    /// Send a decoy result request with a plausible random token
    pub async fn fake_result(&self) -> Result<()> {
        let request = TestResultRequest {
            registration_token: Uuid::new_v4().to_string(),
        };
        self.post(TEST_RESULT_PATH, &request, true).await?;
        debug!("Dispatched decoy result request");
        Ok(())
    }

    /// Send a decoy TAN request with a plausible random token
    pub async fn fake_tan(&self) -> Result<()> {
        let request = TanRequest {
            registration_token: Uuid::new_v4().to_string(),
        };
        self.post(TAN_PATH, &request, true).await?;
        debug!("Dispatched decoy TAN request");
        Ok(())
    }

    /// POST a JSON body and return the status plus raw response bytes
    async fn post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
        fake: bool,
    ) -> Result<(StatusCode, Bytes)> {
        let url = format!("{}{}", self.base_url, path);
        let payload = serde_json::to_vec(body)?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(&url)
            .header("Content-Type", "application/json")
            .header(FAKE_HEADER, if fake { "1" } else { "0" })
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| Error::Http(format!("Failed to build request: {}", e)))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| Error::Http(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        let bytes = response
            .collect()
            .await
            .map_err(|e| Error::Http(format!("Failed to read response from {}: {}", url, e)))?
            .to_bytes();

        Ok((status, bytes))
    }
}

fn parse_body<R: DeserializeOwned>(body: &Bytes) -> Result<R> {
    serde_json::from_slice(body).map_err(Error::JsonSerialization)
}
