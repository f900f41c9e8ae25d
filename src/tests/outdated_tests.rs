use crate::config::AppConfig;
use crate::model::{CoronaTest, TestType};
use crate::service::outdated::OutdatedStateScheduler;
use crate::tests::support::{Harness, harness_with_config, registration_request, wait_until};
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

fn config_with_ttl(hours: u32) -> AppConfig {
    AppConfig {
        hours_to_deem_test_outdated: hours,
        ..AppConfig::default()
    }
}

async fn register_overdue_antigen(h: &Harness, payload: &str) {
    // Negative antigen test whose cutoff already passed
    h.server.state.set_result_code(6);
    let mut request = registration_request(TestType::Antigen, payload);
    request.point_of_care_consent_date = Some(Utc::now() - ChronoDuration::hours(30));
    h.service
        .register(request)
        .await
        .expect("Registration failed");
}

#[tokio::test]
async fn test_scheduler_catches_up_on_start() {
    let h = harness_with_config(config_with_ttl(24)).await;
    register_overdue_antigen(&h, "overdue-payload").await;

    // Also one overdue family test, flagged by the same timer
    let mut request = registration_request(TestType::Antigen, "family-payload");
    request.point_of_care_consent_date = Some(Utc::now() - ChronoDuration::hours(30));
    h.family
        .register("Alex".to_string(), request, false)
        .await
        .expect("Family registration failed");

    let scheduler =
        OutdatedStateScheduler::new(h.service.clone(), h.family.clone(), h.config.clone());
    scheduler.start().await;

    let mut rx = h.service.subscribe();
    wait_until("the user test is flagged outdated", || {
        rx.borrow_and_update()
            .get(TestType::Antigen)
            .is_some_and(CoronaTest::is_outdated)
    })
    .await;

    let mut family_rx = h.family.subscribe();
    wait_until("the family test is flagged outdated", || {
        family_rx
            .borrow_and_update()
            .iter()
            .all(|m| m.test.is_outdated())
    })
    .await;
    scheduler.stop().await;
}

#[tokio::test]
async fn test_scheduler_wakes_on_tracked_set_changes() {
    let h = harness_with_config(config_with_ttl(24)).await;
    let scheduler =
        OutdatedStateScheduler::new(h.service.clone(), h.family.clone(), h.config.clone());
    scheduler.start().await;

    // Registered only after the scheduler went to sleep
    register_overdue_antigen(&h, "late-payload").await;

    let mut rx = h.service.subscribe();
    wait_until("the late registration is flagged outdated", || {
        rx.borrow_and_update()
            .get(TestType::Antigen)
            .is_some_and(CoronaTest::is_outdated)
    })
    .await;
    scheduler.stop().await;
}

#[tokio::test]
async fn test_stopped_scheduler_flags_nothing() {
    let h = harness_with_config(config_with_ttl(24)).await;
    let scheduler =
        OutdatedStateScheduler::new(h.service.clone(), h.family.clone(), h.config.clone());
    scheduler.start().await;
    scheduler.stop().await;

    register_overdue_antigen(&h, "overdue-payload").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let tracked = h.service.tracked_tests().await;
    assert!(
        !tracked
            .get(TestType::Antigen)
            .is_some_and(CoronaTest::is_outdated)
    );
}

#[tokio::test]
async fn test_zero_ttl_scheduler_never_flags() {
    let h = harness_with_config(config_with_ttl(0)).await;
    let scheduler =
        OutdatedStateScheduler::new(h.service.clone(), h.family.clone(), h.config.clone());
    scheduler.start().await;

    register_overdue_antigen(&h, "overdue-payload").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let tracked = h.service.tracked_tests().await;
    assert!(
        !tracked
            .get(TestType::Antigen)
            .is_some_and(CoronaTest::is_outdated)
    );
    scheduler.stop().await;
}
