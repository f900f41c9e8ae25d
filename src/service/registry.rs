//! Single-user test registry
//!
//! Owns the tracked tests of the app user (at most one PCR and one antigen
//! test at a time), applies every mutation through one serialized owner and
//! republishes state after each change. Registration performs the first
//! result poll inline so the UI never has to poll separately.

use crate::client::api::{KeyType, RegistrationTokenRequest, TestResultResponse};
use crate::client::{TrafficPadding, VerificationClient};
use crate::config::ConfigManager;
use crate::model::{CoronaTest, TestResult, TestType, hash_qr_payload};
use crate::service::certificates::{CertificateIssuer, CertificateRequest};
use crate::service::notifications::{
    NotificationScope, Notifier, ReminderKind, TestResultNotification, WARN_OTHERS_REMINDER_DELAY,
};
use crate::store::{RecycleBin, StoredTest, TestStore};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Parameters for registering a new test
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    /// Kind of test being registered
    pub test_type: TestType,
    /// Hashed QR payload (GUID) or TeleTAN
    pub key: String,
    /// What kind of key is being exchanged
    pub key_type: KeyType,
    /// Optional date-of-birth key (must start with "x")
    pub date_of_birth_key: Option<String>,
    /// Point-of-care consent timestamp (antigen only)
    pub point_of_care_consent_date: Option<DateTime<Utc>>,
    /// Consent to submit diagnosis keys after a positive result
    pub submission_consent: bool,
    /// Consent to have a test certificate issued
    pub certificate_consent: bool,
}

/// The app user's currently tracked tests, one slot per type
#[derive(Debug, Clone, Default)]
pub struct TrackedTests {
    /// Tracked PCR test, if any
    pub pcr: Option<CoronaTest>,
    /// Tracked antigen test, if any
    pub antigen: Option<CoronaTest>,
}

impl TrackedTests {
    /// Tracked test of the given type
    pub fn get(&self, test_type: TestType) -> Option<&CoronaTest> {
        match test_type {
            TestType::Pcr => self.pcr.as_ref(),
            TestType::Antigen => self.antigen.as_ref(),
        }
    }

    fn slot_mut(&mut self, test_type: TestType) -> &mut Option<CoronaTest> {
        match test_type {
            TestType::Pcr => &mut self.pcr,
            TestType::Antigen => &mut self.antigen,
        }
    }

    /// Iterate over all tracked tests
    pub fn iter(&self) -> impl Iterator<Item = &CoronaTest> {
        self.pcr.iter().chain(self.antigen.iter())
    }

    fn find_mut(&mut self, qr_code_hash: &str) -> Option<&mut CoronaTest> {
        self.pcr
            .iter_mut()
            .chain(self.antigen.iter_mut())
            .find(|t| t.qr_code_hash() == qr_code_hash)
    }
}

/// Outcome of applying a poll response inside the keyed mutation
struct PollOutcome {
    previous: TestResult,
    newly_final: bool,
    submission_consent: bool,
    issue_request: Option<CertificateRequest>,
}

/// Single-user test lifecycle service
#[derive(Clone)]
pub struct CoronaTestService {
    client: Arc<VerificationClient>,
    padding: TrafficPadding,
    store: Arc<dyn TestStore>,
    notifier: Arc<dyn Notifier>,
    issuer: Arc<dyn CertificateIssuer>,
    recycle_bin: Arc<dyn RecycleBin>,
    config: ConfigManager,
    /// Single serialized owner of all tracked-test mutation
    tests: Arc<Mutex<TrackedTests>>,
    /// Publish-on-mutation, replay-latest-on-subscribe
    publisher: watch::Sender<TrackedTests>,
}

impl CoronaTestService {
    /// Create the service, loading previously tracked tests from the store
    pub fn new(
        client: Arc<VerificationClient>,
        store: Arc<dyn TestStore>,
        notifier: Arc<dyn Notifier>,
        issuer: Arc<dyn CertificateIssuer>,
        recycle_bin: Arc<dyn RecycleBin>,
        config: ConfigManager,
    ) -> Result<Self> {
        let mut tracked = TrackedTests::default();
        for entry in store.load()? {
            if let StoredTest::User(test) = entry {
                let test_type = test.test_type();
                *tracked.slot_mut(test_type) = Some(test);
            }
        }

        let (publisher, _) = watch::channel(tracked.clone());
        let padding = TrafficPadding::new(client.clone());

        Ok(Self {
            client,
            padding,
            store,
            notifier,
            issuer,
            recycle_bin,
            config,
            tests: Arc::new(Mutex::new(tracked)),
            publisher,
        })
    }

    /// Subscribe to tracked-test state; the receiver immediately holds the
    /// latest snapshot and observes every later mutation.
    pub fn subscribe(&self) -> watch::Receiver<TrackedTests> {
        self.publisher.subscribe()
    }

    /// Snapshot of the currently tracked tests
    pub async fn tracked_tests(&self) -> TrackedTests {
        self.tests.lock().await.clone()
    }

    /// Register a new test and perform its first result poll.
    ///
    /// Fails fast without any network call while a test of the same type is
    /// tracked. A failed token exchange never creates a tracked test. A test
    /// that is already expired (or unknown) on its first poll is discarded
    /// again and the condition surfaced as an error.
    pub async fn register(&self, request: RegistrationRequest) -> Result<CoronaTest> {
        {
            let tracked = self.tests.lock().await;
            if tracked.get(request.test_type).is_some() {
                // Nothing went out; pad both calls a genuine registration makes
                self.padding.fake_registration();
                self.padding.fake_result();
                return Err(Error::TestAlreadyRegistered(request.test_type));
            }
        }

        let token_request = RegistrationTokenRequest {
            key: request.key.clone(),
            key_type: request.key_type,
            key_dob: request.date_of_birth_key.clone(),
        };

        let registration_token = match self.client.register_token(&token_request).await {
            Ok(token) => token,
            Err(e) => {
                if matches!(e, Error::MalformedDateOfBirthKey) {
                    // Rejected locally, the registration call itself was skipped
                    self.padding.fake_registration();
                }
                // The follow-up first poll is skipped either way
                self.padding.fake_result();
                warn!("Registration of {} test failed: {}", request.test_type, e);
                return Err(e);
            }
        };

        let qr_code_hash = match request.key_type {
            KeyType::Guid => request.key.clone(),
            // TeleTANs have no QR code; hash the TAN for a stable local identity
            KeyType::TeleTan => hash_qr_payload(&request.key),
        };

        let now = Utc::now();
        let test = match request.test_type {
            TestType::Pcr => CoronaTest::pcr(
                qr_code_hash.clone(),
                registration_token.clone(),
                now,
                request.submission_consent,
                request.certificate_consent,
            ),
            TestType::Antigen => CoronaTest::antigen(
                qr_code_hash.clone(),
                registration_token.clone(),
                now,
                request.point_of_care_consent_date.unwrap_or(now),
                request.submission_consent,
                request.certificate_consent,
            ),
        };

        // Track the pending test before the first poll
        {
            let mut tracked = self.tests.lock().await;
            if tracked.get(request.test_type).is_some() {
                // Lost a race against a concurrent registration
                return Err(Error::TestAlreadyRegistered(request.test_type));
            }
            self.store.upsert(&StoredTest::User(test.clone()))?;
            *tracked.slot_mut(request.test_type) = Some(test);
            self.publisher.send_replace(tracked.clone());
        }
        info!("Registered {} test", request.test_type);

        // Immediate first poll so the UI does not need a separate request
        match self.client.fetch_result(&registration_token).await {
            Ok(response) => match TestResult::from_raw(response.test_result) {
                Ok(TestResult::Expired) => {
                    // A newly registered test must never already be expired
                    self.discard(request.test_type, &qr_code_hash).await?;
                    return Err(Error::ExpiredAtRegistration);
                }
                Ok(_) => {
                    self.apply_poll_response(&qr_code_hash, request.test_type, &response, false)
                        .await?;
                }
                Err(e) => warn!("First poll returned an unusable result code: {}", e),
            },
            Err(Error::QrCodeNotFound) => {
                // A brand-new test cannot have aged out of backend retention
                self.discard(request.test_type, &qr_code_hash).await?;
                return Err(Error::QrCodeNotFound);
            }
            // Transient failure: the test stays tracked in pending state and
            // is picked up by the next update cycle
            Err(e) => warn!("First poll after registration failed: {}", e),
        }

        let tracked = self.tests.lock().await;
        tracked
            .get(request.test_type)
            .cloned()
            .ok_or(Error::NoTestOfRequestedType(request.test_type))
    }

    /// Poll the result of the tracked test of the given type.
    ///
    /// With `force == false`, a test whose final result has already arrived
    /// is answered from cache with zero network calls (a decoy is dispatched
    /// instead). `present_notification` gates the result notification, e.g.
    /// true only in background-refresh contexts.
    pub async fn test_result(
        &self,
        test_type: TestType,
        force: bool,
        present_notification: bool,
    ) -> Result<TestResult> {
        let (qr_code_hash, token, registration_date) = {
            let tracked = self.tests.lock().await;
            let Some(test) = tracked.get(test_type) else {
                drop(tracked);
                // Every skipped real request must stay invisible to an observer
                self.padding.fake_result();
                return Err(Error::NoTestOfRequestedType(test_type));
            };

            if !force && test.final_test_result_received_date().is_some() {
                let cached = test.test_result();
                let submission_consent = test.is_submission_consent_given();
                drop(tracked);
                self.padding.fake_result();
                // The cached answer is still a showing-state evaluation
                if submission_consent {
                    self.reschedule_deadman().await;
                }
                debug!("Returning cached {} result", test_type);
                return Ok(cached);
            }

            let Some(token) = test.registration_token().map(str::to_string) else {
                drop(tracked);
                self.padding.fake_result();
                return Err(Error::NoRegistrationToken);
            };
            (
                test.qr_code_hash().to_string(),
                token,
                test.registration_date(),
            )
        };

        match self.client.fetch_result(&token).await {
            Ok(response) => {
                self.apply_poll_response(&qr_code_hash, test_type, &response, present_notification)
                    .await
            }
            Err(Error::QrCodeNotFound) => {
                let retention_days = self.config.retention_period_days().await;
                let age = Utc::now().signed_duration_since(registration_date);
                if age >= chrono::Duration::days(retention_days as i64) {
                    // The backend has legitimately forgotten the test
                    info!("Recovering forgotten {} test into expired state", test_type);
                    let applied = self
                        .modify_test(&qr_code_hash, |test| {
                            test.apply_result(TestResult::Expired, Utc::now());
                        })
                        .await?;
                    if applied.is_none() {
                        return Err(Error::NoTestOfRequestedType(test_type));
                    }
                    Ok(TestResult::Expired)
                } else {
                    // Too young for expected expiry: a genuine backend failure
                    Err(Error::QrCodeNotFound)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Re-poll every tracked test.
    ///
    /// One poll per test; completion is a barrier over all of them. Every
    /// individually succeeded update is applied even when another poll
    /// failed, and the first error encountered is reported.
    pub async fn update_test_results(&self, present_notification: bool) -> Result<()> {
        let types: Vec<TestType> = {
            let tracked = self.tests.lock().await;
            tracked.iter().map(|t| t.test_type()).collect()
        };

        let mut first_error = None;
        for test_type in types {
            if let Err(e) = self
                .test_result(test_type, false, present_notification)
                .await
            {
                warn!("Updating {} test failed: {}", test_type, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Spend the registration token on a one-time submission TAN.
    ///
    /// On success the TAN replaces the token in a single mutation; the two
    /// are never present at the same time.
    pub async fn submission_tan(&self, test_type: TestType) -> Result<String> {
        let (qr_code_hash, token) = {
            let tracked = self.tests.lock().await;
            let Some(test) = tracked.get(test_type) else {
                drop(tracked);
                self.padding.fake_tan();
                return Err(Error::NoTestOfRequestedType(test_type));
            };
            let Some(token) = test.registration_token().map(str::to_string) else {
                drop(tracked);
                // The token is already spent; pad the skipped TAN exchange
                self.padding.fake_tan();
                return Err(Error::NoRegistrationToken);
            };
            (test.qr_code_hash().to_string(), token)
        };

        let tan = self.client.fetch_tan(&token).await?;

        let applied = self
            .modify_test(&qr_code_hash, |test| {
                test.redeem_token_for_tan(tan.clone())
            })
            .await?;
        if applied.is_none() {
            return Err(Error::NoTestOfRequestedType(test_type));
        }
        Ok(tan)
    }

    /// Record that diagnosis keys were submitted for the tracked test
    pub async fn mark_keys_submitted(&self, test_type: TestType) -> Result<()> {
        let qr_code_hash = {
            let tracked = self.tests.lock().await;
            tracked
                .get(test_type)
                .ok_or(Error::NoTestOfRequestedType(test_type))?
                .qr_code_hash()
                .to_string()
        };

        let applied = self
            .modify_test(&qr_code_hash, |test| test.mark_keys_submitted())
            .await?;
        if applied.is_none() {
            return Err(Error::NoTestOfRequestedType(test_type));
        }

        self.notifier
            .cancel_reminder(ReminderKind::WarnOthersReminder);
        Ok(())
    }

    /// Soft-delete the tracked test into the recycle bin
    pub async fn move_test_to_recycle_bin(&self, test_type: TestType) -> Result<()> {
        let mut tracked = self.tests.lock().await;
        let Some(test) = tracked.slot_mut(test_type).take() else {
            return Err(Error::NoTestOfRequestedType(test_type));
        };
        self.store.remove(test.qr_code_hash())?;
        self.recycle_bin.recycle(StoredTest::User(test));
        self.publisher.send_replace(tracked.clone());
        info!("Moved {} test to the recycle bin", test_type);
        Ok(())
    }

    /// Hard-delete the tracked test (consent withdrawal)
    pub async fn remove_test(&self, test_type: TestType) -> Result<()> {
        let mut tracked = self.tests.lock().await;
        let Some(test) = tracked.slot_mut(test_type).take() else {
            return Err(Error::NoTestOfRequestedType(test_type));
        };
        self.store.remove(test.qr_code_hash())?;
        self.publisher.send_replace(tracked.clone());
        info!("Removed {} test", test_type);
        Ok(())
    }

    /// Callback from the certificate collaborator: stamp the issued
    /// identifier onto the matching test.
    ///
    /// The collaborator never sees the qr_code_hash, so the lookup goes by
    /// registration token.
    pub async fn certificate_issued(
        &self,
        identifier: String,
        request: &CertificateRequest,
    ) -> Result<()> {
        let qr_code_hash = {
            let tracked = self.tests.lock().await;
            tracked
                .iter()
                .find(|t| t.registration_token() == Some(request.registration_token.as_str()))
                .map(|t| t.qr_code_hash().to_string())
        };

        match qr_code_hash {
            Some(hash) => {
                self.modify_test(&hash, |test| {
                    test.assign_certificate_identifier(identifier)
                })
                .await?;
                Ok(())
            }
            None => {
                warn!("No tracked test matches the issued certificate's token");
                Ok(())
            }
        }
    }

    /// Test dates of negative antigen tests that are not yet outdated
    pub async fn antigen_outdated_candidates(&self) -> Vec<DateTime<Utc>> {
        let tracked = self.tests.lock().await;
        tracked
            .iter()
            .filter(|t| {
                t.test_type() == TestType::Antigen
                    && t.test_result() == TestResult::Negative
                    && !t.is_outdated()
            })
            .map(|t| t.test_date())
            .collect()
    }

    /// Recompute the outdated flag of the tracked antigen test.
    ///
    /// `ttl_hours == 0` disables the feature; the flag is then never set.
    pub async fn refresh_outdated_state(&self, now: DateTime<Utc>, ttl_hours: u32) -> Result<()> {
        if ttl_hours == 0 {
            return Ok(());
        }

        let candidate = {
            let tracked = self.tests.lock().await;
            tracked
                .get(TestType::Antigen)
                .filter(|t| t.test_result() == TestResult::Negative && !t.is_outdated())
                .map(|t| (t.qr_code_hash().to_string(), t.test_date()))
        };

        if let Some((qr_code_hash, test_date)) = candidate {
            if now >= test_date + chrono::Duration::hours(ttl_hours as i64) {
                info!("Marking antigen test outdated");
                self.modify_test(&qr_code_hash, |test| {
                    test.set_outdated(true);
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Keyed in-place mutation helper.
    ///
    /// Every writer (poller, outdated scheduler, certificate callback) goes
    /// through this, so concurrent updates touch individual fields instead
    /// of clobbering whole records. Persists and republishes after the
    /// mutation; returns None when no test with that hash is tracked.
    pub async fn modify_test<R>(
        &self,
        qr_code_hash: &str,
        mutate: impl FnOnce(&mut CoronaTest) -> R,
    ) -> Result<Option<R>> {
        let mut tracked = self.tests.lock().await;
        let Some(test) = tracked.find_mut(qr_code_hash) else {
            return Ok(None);
        };
        let value = mutate(test);
        let snapshot = test.clone();
        self.store.upsert(&StoredTest::User(snapshot))?;
        self.publisher.send_replace(tracked.clone());
        Ok(Some(value))
    }

    /// Cancel and re-arm the deadman reminder after a showing-state
    /// evaluation
    async fn reschedule_deadman(&self) {
        let hours = self.config.deadman_reminder_hours().await;
        self.notifier.cancel_reminder(ReminderKind::DeadmanReminder);
        self.notifier.schedule_reminder(
            ReminderKind::DeadmanReminder,
            Duration::from_secs(u64::from(hours) * 3600),
        );
    }

    /// Apply a poll response through the keyed mutation helper, then fire
    /// the downstream effects (notification, reminders, certificate flow).
    async fn apply_poll_response(
        &self,
        qr_code_hash: &str,
        test_type: TestType,
        response: &TestResultResponse,
        present_notification: bool,
    ) -> Result<TestResult> {
        let result = TestResult::from_raw(response.test_result)?;
        let raw_result = response.test_result;
        let lab_id = response.lab_id.clone();
        let sample_collected_at = response.sample_collected_at;

        let outcome = self
            .modify_test(qr_code_hash, |test| {
                if let Some(lab) = lab_id {
                    test.set_lab_id(lab);
                }
                if let Some(epoch) = sample_collected_at {
                    if let Some(date) = DateTime::from_timestamp(epoch, 0) {
                        test.set_sample_collection_date(date);
                    }
                }

                let change = test.apply_result(result, Utc::now());

                // Certificate flow: the requested flag flips inside this same
                // mutation so two concurrently completing polls cannot both
                // hand off to the issuer.
                let mut issue_request = None;
                if result == TestResult::Negative && test.is_certificate_consent_given() {
                    if let Some(token) = test.registration_token().map(str::to_string) {
                        if test.mark_certificate_requested() {
                            issue_request = Some(CertificateRequest {
                                registration_token: token,
                                registration_date: test.registration_date(),
                                lab_id: test.lab_id().map(str::to_string),
                                test_type: test.test_type(),
                            });
                        }
                    }
                }

                PollOutcome {
                    previous: change.previous,
                    newly_final: change.newly_final,
                    submission_consent: test.is_submission_consent_given(),
                    issue_request,
                }
            })
            .await?;

        let Some(outcome) = outcome else {
            return Err(Error::NoTestOfRequestedType(test_type));
        };

        if present_notification && outcome.previous != result && result.is_final() {
            self.notifier.present_test_result(TestResultNotification {
                scope: NotificationScope::User(test_type),
                raw_result,
            });
        }

        if outcome.newly_final && result == TestResult::Positive && outcome.submission_consent {
            self.notifier
                .schedule_reminder(ReminderKind::WarnOthersReminder, WARN_OTHERS_REMINDER_DELAY);
        }

        // Showing-state was evaluated; while submission consent is active the
        // deadman reminder is pushed out again so a stalled background cycle
        // still surfaces to the user.
        if outcome.submission_consent {
            self.reschedule_deadman().await;
        }

        if let Some(request) = outcome.issue_request {
            // Hand off after the mutation is committed; must not block polling
            self.issuer.issue(request);
        }

        Ok(result)
    }

    async fn discard(&self, test_type: TestType, qr_code_hash: &str) -> Result<()> {
        let mut tracked = self.tests.lock().await;
        let slot = tracked.slot_mut(test_type);
        if slot
            .as_ref()
            .is_some_and(|t| t.qr_code_hash() == qr_code_hash)
        {
            *slot = None;
            self.store.remove(qr_code_hash)?;
            self.publisher.send_replace(tracked.clone());
        }
        Ok(())
    }
}
