//! Shared fixtures for service-level tests
//!
//! `StubServer` is an in-process verification server with scripted responses
//! and per-endpoint hit counters. Decoy requests (those carrying the fake
//! header) are counted separately so tests can assert on real traffic alone.

use crate::client::VerificationClient;
use crate::client::api::KeyType;
use crate::client::verification::FAKE_HEADER;
use crate::config::{AppConfig, ConfigManager};
use crate::model::{TestType, hash_qr_payload};
use crate::service::certificates::{CertificateIssuer, CertificateRequest};
use crate::service::family::FamilyTestService;
use crate::service::notifications::{Notifier, ReminderKind, TestResultNotification};
use crate::service::registry::{CoronaTestService, RegistrationRequest};
use crate::store::{MemoryRecycleBin, MemoryTestStore};
use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

/// Scripted responses and hit counters of the stub verification server
pub struct StubState {
    pub registration_token: StdMutex<String>,
    pub result_code: AtomicU32,
    pub result_status: AtomicU16,
    pub lab_id: StdMutex<Option<String>>,
    pub sample_collected_at: StdMutex<Option<i64>>,
    pub tan: StdMutex<String>,
    pub registration_hits: AtomicUsize,
    pub result_hits: AtomicUsize,
    pub tan_hits: AtomicUsize,
    pub fake_hits: AtomicUsize,
}

impl Default for StubState {
    fn default() -> Self {
        Self {
            registration_token: StdMutex::new("reg-token-1".to_string()),
            result_code: AtomicU32::new(0),
            result_status: AtomicU16::new(200),
            lab_id: StdMutex::new(None),
            sample_collected_at: StdMutex::new(None),
            tan: StdMutex::new("tan-1".to_string()),
            registration_hits: AtomicUsize::new(0),
            result_hits: AtomicUsize::new(0),
            tan_hits: AtomicUsize::new(0),
            fake_hits: AtomicUsize::new(0),
        }
    }
}

impl StubState {
    pub fn set_result_code(&self, code: u32) {
        self.result_code.store(code, Ordering::SeqCst);
    }

    pub fn set_result_status(&self, status: u16) {
        self.result_status.store(status, Ordering::SeqCst);
    }

    pub fn set_lab_id(&self, lab_id: &str) {
        *self.lab_id.lock().unwrap() = Some(lab_id.to_string());
    }

    pub fn set_sample_collected_at(&self, epoch_seconds: i64) {
        *self.sample_collected_at.lock().unwrap() = Some(epoch_seconds);
    }

    pub fn registration_hits(&self) -> usize {
        self.registration_hits.load(Ordering::SeqCst)
    }

    pub fn result_hits(&self) -> usize {
        self.result_hits.load(Ordering::SeqCst)
    }

    pub fn tan_hits(&self) -> usize {
        self.tan_hits.load(Ordering::SeqCst)
    }

    pub fn fake_hits(&self) -> usize {
        self.fake_hits.load(Ordering::SeqCst)
    }
}

/// In-process verification server answering from `StubState`
pub struct StubServer {
    pub base_url: String,
    pub state: Arc<StubState>,
}

impl StubServer {
    /// Bind to an ephemeral port and start serving
    pub async fn start() -> Self {
        let state = Arc::new(StubState::default());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind stub server");
        let addr = listener.local_addr().expect("Failed to get local address");

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let io = TokioIo::new(stream);
                let conn_state = accept_state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, conn_state.clone()));
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    state: Arc<StubState>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let fake = req
        .headers()
        .get(FAKE_HEADER)
        .is_some_and(|value| value == "1");
    if fake {
        state.fake_hits.fetch_add(1, Ordering::SeqCst);
        // Decoy responses are discarded by the client
        return Ok(json_response(StatusCode::OK, serde_json::json!({})));
    }

    let response = match req.uri().path() {
        "/version/v1/registrationToken" => {
            state.registration_hits.fetch_add(1, Ordering::SeqCst);
            let token = state.registration_token.lock().unwrap().clone();
            json_response(
                StatusCode::OK,
                serde_json::json!({ "registrationToken": token }),
            )
        }
        "/version/v1/testresult" => {
            state.result_hits.fetch_add(1, Ordering::SeqCst);
            let status = state.result_status.load(Ordering::SeqCst);
            if status != 200 {
                json_response(
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    serde_json::json!({}),
                )
            } else {
                let mut body = serde_json::json!({
                    "testResult": state.result_code.load(Ordering::SeqCst),
                });
                if let Some(lab_id) = state.lab_id.lock().unwrap().clone() {
                    body["labId"] = serde_json::json!(lab_id);
                }
                if let Some(sc) = *state.sample_collected_at.lock().unwrap() {
                    body["sc"] = serde_json::json!(sc);
                }
                json_response(StatusCode::OK, body)
            }
        }
        "/version/v1/tan" => {
            state.tan_hits.fetch_add(1, Ordering::SeqCst);
            let tan = state.tan.lock().unwrap().clone();
            json_response(StatusCode::OK, serde_json::json!({ "tan": tan }))
        }
        _ => json_response(StatusCode::NOT_FOUND, serde_json::json!({})),
    };
    Ok(response)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("Failed to build stub response")
}

/// Notifier double recording every call
#[derive(Default)]
pub struct RecordingNotifier {
    results: StdMutex<Vec<TestResultNotification>>,
    scheduled: StdMutex<Vec<(ReminderKind, Duration)>>,
    cancelled: StdMutex<Vec<ReminderKind>>,
}

impl RecordingNotifier {
    pub fn results(&self) -> Vec<TestResultNotification> {
        self.results.lock().unwrap().clone()
    }

    pub fn scheduled(&self) -> Vec<(ReminderKind, Duration)> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<ReminderKind> {
        self.cancelled.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn present_test_result(&self, notification: TestResultNotification) {
        self.results.lock().unwrap().push(notification);
    }

    fn schedule_reminder(&self, kind: ReminderKind, delay: Duration) {
        self.scheduled.lock().unwrap().push((kind, delay));
    }

    fn cancel_reminder(&self, kind: ReminderKind) {
        self.cancelled.lock().unwrap().push(kind);
    }
}

/// Certificate issuer double recording every issuance request
#[derive(Default)]
pub struct RecordingIssuer {
    requests: StdMutex<Vec<CertificateRequest>>,
}

impl RecordingIssuer {
    pub fn requests(&self) -> Vec<CertificateRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl CertificateIssuer for RecordingIssuer {
    fn issue(&self, request: CertificateRequest) {
        self.requests.lock().unwrap().push(request);
    }
}

/// A fully wired pair of services backed by the stub server
pub struct Harness {
    pub server: StubServer,
    pub service: CoronaTestService,
    pub family: FamilyTestService,
    pub store: Arc<MemoryTestStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub issuer: Arc<RecordingIssuer>,
    pub recycle_bin: Arc<MemoryRecycleBin>,
    pub config: ConfigManager,
}

pub async fn harness() -> Harness {
    harness_with(AppConfig::default(), Arc::new(MemoryTestStore::new())).await
}

pub async fn harness_with_config(config: AppConfig) -> Harness {
    harness_with(config, Arc::new(MemoryTestStore::new())).await
}

/// Build services over an existing store, e.g. one preloaded with tests
pub async fn harness_with(config: AppConfig, store: Arc<MemoryTestStore>) -> Harness {
    let server = StubServer::start().await;
    let client = Arc::new(VerificationClient::new(server.base_url.clone()));
    let notifier = Arc::new(RecordingNotifier::default());
    let issuer = Arc::new(RecordingIssuer::default());
    let recycle_bin = Arc::new(MemoryRecycleBin::new());
    let config = ConfigManager::from_config(config);

    let service = CoronaTestService::new(
        client.clone(),
        store.clone(),
        notifier.clone(),
        issuer.clone(),
        recycle_bin.clone(),
        config.clone(),
    )
    .expect("Failed to build test service");
    let family = FamilyTestService::new(
        client,
        store.clone(),
        notifier.clone(),
        issuer.clone(),
        recycle_bin.clone(),
        config.clone(),
    )
    .expect("Failed to build family service");

    Harness {
        server,
        service,
        family,
        store,
        notifier,
        issuer,
        recycle_bin,
        config,
    }
}

/// Registration request with a hashed key derived from `payload`
pub fn registration_request(test_type: TestType, payload: &str) -> RegistrationRequest {
    RegistrationRequest {
        test_type,
        key: hash_qr_payload(payload),
        key_type: KeyType::Guid,
        date_of_birth_key: None,
        point_of_care_consent_date: match test_type {
            TestType::Antigen => Some(Utc::now()),
            TestType::Pcr => None,
        },
        submission_consent: true,
        certificate_consent: false,
    }
}

/// Poll a condition until it holds, failing the test after a few seconds.
/// Decoy traffic is dispatched with random jitter, so asserting on it
/// needs a wait.
pub async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..150 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("Timed out waiting until {}", description);
}
