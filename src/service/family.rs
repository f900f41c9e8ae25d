//! Family-member test service
//!
//! Tracks an unbounded set of tests on behalf of family members, keyed by
//! qr_code_hash. Batch polling is strictly sequential (one outstanding
//! network operation at a time) so notification dedup stays deterministic.
//! Family notifications share one channel and never carry member identity.

use crate::client::api::{KeyType, RegistrationTokenRequest, TestResultResponse};
use crate::client::{TrafficPadding, VerificationClient};
use crate::config::ConfigManager;
use crate::model::{CoronaTest, FamilyMemberTest, TestResult, TestType, hash_qr_payload};
use crate::service::certificates::{CertificateIssuer, CertificateRequest};
use crate::service::notifications::{NotificationScope, Notifier, TestResultNotification};
use crate::service::registry::RegistrationRequest;
use crate::store::{RecycleBin, StoredTest, TestStore};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Outcome of applying a poll response to a family-member test
struct PollOutcome {
    previous: TestResult,
    issue_request: Option<CertificateRequest>,
}

/// Test lifecycle service for family members
#[derive(Clone)]
pub struct FamilyTestService {
    client: Arc<VerificationClient>,
    padding: TrafficPadding,
    store: Arc<dyn TestStore>,
    notifier: Arc<dyn Notifier>,
    issuer: Arc<dyn CertificateIssuer>,
    recycle_bin: Arc<dyn RecycleBin>,
    config: ConfigManager,
    /// Single serialized owner of all family-test mutation
    tests: Arc<Mutex<Vec<FamilyMemberTest>>>,
    /// Publish-on-mutation, replay-latest-on-subscribe
    publisher: watch::Sender<Vec<FamilyMemberTest>>,
}

impl FamilyTestService {
    /// Create the service, loading previously tracked tests from the store
    pub fn new(
        client: Arc<VerificationClient>,
        store: Arc<dyn TestStore>,
        notifier: Arc<dyn Notifier>,
        issuer: Arc<dyn CertificateIssuer>,
        recycle_bin: Arc<dyn RecycleBin>,
        config: ConfigManager,
    ) -> Result<Self> {
        let mut tests = Vec::new();
        for entry in store.load()? {
            if let StoredTest::Family(member) = entry {
                tests.push(member);
            }
        }

        let (publisher, _) = watch::channel(tests.clone());
        let padding = TrafficPadding::new(client.clone());

        Ok(Self {
            client,
            padding,
            store,
            notifier,
            issuer,
            recycle_bin,
            config,
            tests: Arc::new(Mutex::new(tests)),
            publisher,
        })
    }

    /// Subscribe to family-test state; the receiver immediately holds the
    /// latest snapshot and observes every later mutation.
    pub fn subscribe(&self) -> watch::Receiver<Vec<FamilyMemberTest>> {
        self.publisher.subscribe()
    }

    /// Snapshot of the currently tracked family tests
    pub async fn tracked_tests(&self) -> Vec<FamilyMemberTest> {
        self.tests.lock().await.clone()
    }

    /// Register a new test for a family member and perform its first poll.
    ///
    /// The set is unbounded; only a duplicate qr_code_hash fails fast
    /// (without network, padded like any skipped call).
    pub async fn register(
        &self,
        display_name: String,
        request: RegistrationRequest,
        certificate_supported_by_point_of_care: bool,
    ) -> Result<FamilyMemberTest> {
        let qr_code_hash = match request.key_type {
            KeyType::Guid => request.key.clone(),
            KeyType::TeleTan => hash_qr_payload(&request.key),
        };

        {
            let tests = self.tests.lock().await;
            if tests.iter().any(|m| m.qr_code_hash() == qr_code_hash) {
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
                    self.padding.fake_registration();
                }
                self.padding.fake_result();
                warn!("Family registration of {} test failed: {}", request.test_type, e);
                return Err(e);
            }
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
        let member = FamilyMemberTest::new(
            display_name,
            test,
            certificate_supported_by_point_of_care,
        );

        {
            let mut tests = self.tests.lock().await;
            if tests.iter().any(|m| m.qr_code_hash() == qr_code_hash) {
                return Err(Error::TestAlreadyRegistered(request.test_type));
            }
            self.store.upsert(&StoredTest::Family(member.clone()))?;
            tests.push(member);
            self.publisher.send_replace(tests.clone());
        }
        info!("Registered family {} test", request.test_type);

        match self.client.fetch_result(&registration_token).await {
            Ok(response) => match TestResult::from_raw(response.test_result) {
                Ok(TestResult::Expired) => {
                    self.discard(&qr_code_hash).await?;
                    return Err(Error::ExpiredAtRegistration);
                }
                Ok(_) => {
                    self.apply_poll_response(&qr_code_hash, &response, false)
                        .await?;
                }
                Err(e) => warn!("First family poll returned an unusable result code: {}", e),
            },
            Err(Error::QrCodeNotFound) => {
                self.discard(&qr_code_hash).await?;
                return Err(Error::QrCodeNotFound);
            }
            Err(e) => warn!("First poll after family registration failed: {}", e),
        }

        let tests = self.tests.lock().await;
        tests
            .iter()
            .find(|m| m.qr_code_hash() == qr_code_hash)
            .cloned()
            .ok_or(Error::UnknownTest)
    }

    /// Poll the result of one family-member test.
    ///
    /// The cached short-circuit has one exception: a final Invalid result
    /// may still change on a later poll, so it never short-circuits.
    pub async fn test_result(
        &self,
        qr_code_hash: &str,
        force: bool,
        present_notification: bool,
    ) -> Result<TestResult> {
        let (token, registration_date) = {
            let tests = self.tests.lock().await;
            let Some(member) = tests.iter().find(|m| m.qr_code_hash() == qr_code_hash) else {
                drop(tests);
                // Every skipped real request must stay invisible to an observer
                self.padding.fake_result();
                return Err(Error::UnknownTest);
            };
            let test = &member.test;

            if !force
                && test.final_test_result_received_date().is_some()
                && test.test_result() != TestResult::Invalid
            {
                let cached = test.test_result();
                drop(tests);
                self.padding.fake_result();
                debug!("Returning cached family result");
                return Ok(cached);
            }

            let Some(token) = test.registration_token().map(str::to_string) else {
                drop(tests);
                self.padding.fake_result();
                return Err(Error::NoRegistrationToken);
            };
            (token, test.registration_date())
        };

        match self.client.fetch_result(&token).await {
            Ok(response) => {
                self.apply_poll_response(qr_code_hash, &response, present_notification)
                    .await
            }
            Err(Error::QrCodeNotFound) => {
                let retention_days = self.config.retention_period_days().await;
                let age = Utc::now().signed_duration_since(registration_date);
                if age >= chrono::Duration::days(retention_days as i64) {
                    info!("Recovering forgotten family test into expired state");
                    let applied = self
                        .modify_test(qr_code_hash, |member| {
                            member.test.apply_result(TestResult::Expired, Utc::now());
                        })
                        .await?;
                    if applied.is_none() {
                        return Err(Error::UnknownTest);
                    }
                    Ok(TestResult::Expired)
                } else {
                    Err(Error::QrCodeNotFound)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Re-poll every tracked family test.
    ///
    /// Strictly sequential: one network operation in flight at a time, so
    /// notification ordering is deterministic. The first error is reported
    /// only after every poll (or its padding decoy) has finished.
    pub async fn update_all(&self, present_notification: bool) -> Result<()> {
        let hashes: Vec<String> = {
            let tests = self.tests.lock().await;
            tests.iter().map(|m| m.qr_code_hash().to_string()).collect()
        };

        let mut first_error = None;
        for qr_code_hash in hashes {
            if let Err(e) = self
                .test_result(&qr_code_hash, false, present_notification)
                .await
            {
                warn!("Updating family test failed: {}", e);
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

    /// The user opened the family test entry
    pub async fn mark_seen(&self, qr_code_hash: &str) -> Result<()> {
        self.modify_test(qr_code_hash, |member| member.mark_seen())
            .await?
            .ok_or(Error::UnknownTest)
    }

    /// The user saw the latest result change of a family test
    pub async fn mark_result_seen(&self, qr_code_hash: &str) -> Result<()> {
        self.modify_test(qr_code_hash, |member| member.mark_result_seen())
            .await?
            .ok_or(Error::UnknownTest)
    }

    /// Soft-delete a family test into the recycle bin
    pub async fn move_test_to_recycle_bin(&self, qr_code_hash: &str) -> Result<()> {
        let mut tests = self.tests.lock().await;
        let Some(index) = tests.iter().position(|m| m.qr_code_hash() == qr_code_hash) else {
            return Err(Error::UnknownTest);
        };
        let member = tests.remove(index);
        self.store.remove(member.qr_code_hash())?;
        self.recycle_bin.recycle(StoredTest::Family(member));
        self.publisher.send_replace(tests.clone());
        info!("Moved family test to the recycle bin");
        Ok(())
    }

    /// Callback from the certificate collaborator, keyed by registration token
    pub async fn certificate_issued(
        &self,
        identifier: String,
        request: &CertificateRequest,
    ) -> Result<()> {
        let qr_code_hash = {
            let tests = self.tests.lock().await;
            tests
                .iter()
                .find(|m| {
                    m.test.registration_token() == Some(request.registration_token.as_str())
                })
                .map(|m| m.qr_code_hash().to_string())
        };

        match qr_code_hash {
            Some(hash) => {
                self.modify_test(&hash, |member| {
                    member.test.assign_certificate_identifier(identifier)
                })
                .await?;
                Ok(())
            }
            None => {
                warn!("No family test matches the issued certificate's token");
                Ok(())
            }
        }
    }

    /// Test dates of negative antigen tests that are not yet outdated
    pub async fn antigen_outdated_candidates(&self) -> Vec<DateTime<Utc>> {
        let tests = self.tests.lock().await;
        tests
            .iter()
            .map(|m| &m.test)
            .filter(|t| {
                t.test_type() == TestType::Antigen
                    && t.test_result() == TestResult::Negative
                    && !t.is_outdated()
            })
            .map(|t| t.test_date())
            .collect()
    }

    /// Recompute outdated flags of all eligible family tests.
    ///
    /// `ttl_hours == 0` disables the feature; flags are then never set.
    pub async fn refresh_outdated_state(&self, now: DateTime<Utc>, ttl_hours: u32) -> Result<()> {
        if ttl_hours == 0 {
            return Ok(());
        }

        let due: Vec<String> = {
            let tests = self.tests.lock().await;
            tests
                .iter()
                .map(|m| &m.test)
                .filter(|t| {
                    t.test_type() == TestType::Antigen
                        && t.test_result() == TestResult::Negative
                        && !t.is_outdated()
                        && now >= t.test_date() + chrono::Duration::hours(ttl_hours as i64)
                })
                .map(|t| t.qr_code_hash().to_string())
                .collect()
        };

        for qr_code_hash in due {
            info!("Marking family antigen test outdated");
            self.modify_test(&qr_code_hash, |member| {
                member.test.set_outdated(true);
            })
            .await?;
        }
        Ok(())
    }

    /// Keyed in-place mutation helper; the only write path for all callers.
    /// Persists and republishes after the mutation.
    pub async fn modify_test<R>(
        &self,
        qr_code_hash: &str,
        mutate: impl FnOnce(&mut FamilyMemberTest) -> R,
    ) -> Result<Option<R>> {
        let mut tests = self.tests.lock().await;
        let Some(member) = tests.iter_mut().find(|m| m.qr_code_hash() == qr_code_hash) else {
            return Ok(None);
        };
        let value = mutate(member);
        let snapshot = member.clone();
        self.store.upsert(&StoredTest::Family(snapshot))?;
        self.publisher.send_replace(tests.clone());
        Ok(Some(value))
    }

    async fn apply_poll_response(
        &self,
        qr_code_hash: &str,
        response: &TestResultResponse,
        present_notification: bool,
    ) -> Result<TestResult> {
        let result = TestResult::from_raw(response.test_result)?;
        let raw_result = response.test_result;
        let lab_id = response.lab_id.clone();
        let sample_collected_at = response.sample_collected_at;

        let outcome = self
            .modify_test(qr_code_hash, |member| {
                let certificate_supported = member.certificate_supported_by_point_of_care;
                let test = &mut member.test;

                if let Some(lab) = lab_id {
                    test.set_lab_id(lab);
                }
                if let Some(epoch) = sample_collected_at {
                    if let Some(date) = DateTime::from_timestamp(epoch, 0) {
                        test.set_sample_collection_date(date);
                    }
                }

                let change = test.apply_result(result, Utc::now());
                if change.previous != result {
                    member.test_result_is_new = true;
                }

                let test = &mut member.test;
                let mut issue_request = None;
                let certificate_eligible = test.is_certificate_consent_given()
                    && (test.test_type() == TestType::Pcr || certificate_supported);
                if result == TestResult::Negative && certificate_eligible {
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
                    issue_request,
                }
            })
            .await?;

        let Some(outcome) = outcome else {
            return Err(Error::UnknownTest);
        };

        // Shared family channel: no per-member identity in the payload
        if present_notification && outcome.previous != result && result.is_final() {
            self.notifier.present_test_result(TestResultNotification {
                scope: NotificationScope::Family,
                raw_result,
            });
        }

        if let Some(request) = outcome.issue_request {
            self.issuer.issue(request);
        }

        Ok(result)
    }

    async fn discard(&self, qr_code_hash: &str) -> Result<()> {
        let mut tests = self.tests.lock().await;
        if let Some(index) = tests.iter().position(|m| m.qr_code_hash() == qr_code_hash) {
            tests.remove(index);
            self.store.remove(qr_code_hash)?;
            self.publisher.send_replace(tests.clone());
        }
        Ok(())
    }
}
