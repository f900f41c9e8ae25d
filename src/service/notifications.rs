//! Local notification dispatch
//!
//! The services decide *when* a notification is due (result transitions,
//! reminder rescheduling); presenting it is delegated to a `Notifier`
//! collaborator supplied by the host process.

use crate::model::TestType;
use std::time::Duration;
use tracing::info;

/// Delay before the warn-others reminder fires after a positive result
pub const WARN_OTHERS_REMINDER_DELAY: Duration = Duration::from_secs(2 * 60 * 60);

/// Which channel a result notification belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationScope {
    /// The app user's own test; the type routes to the correct screen on tap
    User(TestType),
    /// Shared family channel; deliberately carries no member identity
    Family,
}

/// Payload of a test-result notification
///
/// The raw server code is kept alongside the scope so the tap handler can
/// route to the right screen without re-deriving the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestResultNotification {
    /// Channel and routing information
    pub scope: NotificationScope,
    /// Raw result code as received from the server
    pub raw_result: u32,
}

/// Recurring reminder notifications managed by the services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReminderKind {
    /// Fires when background processing stalls; rescheduled on every
    /// showing-state evaluation while submission consent is active
    DeadmanReminder,
    /// Reminds the user to warn others after a positive result
    WarnOthersReminder,
}

/// Presents local notifications on behalf of the services
pub trait Notifier: Send + Sync {
    /// Present a result notification (already gated by the caller)
    fn present_test_result(&self, notification: TestResultNotification);

    /// (Re)schedule a recurring reminder to fire after `delay`
    fn schedule_reminder(&self, kind: ReminderKind, delay: Duration);

    /// Cancel a pending reminder, if scheduled
    fn cancel_reminder(&self, kind: ReminderKind);
}

/// Log-only notifier, useful as a default and in headless deployments
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn present_test_result(&self, notification: TestResultNotification) {
        match notification.scope {
            NotificationScope::User(test_type) => info!(
                "Test result notification: {} test, raw code {}",
                test_type, notification.raw_result
            ),
            NotificationScope::Family => info!(
                "Family test result notification: raw code {}",
                notification.raw_result
            ),
        }
    }

    fn schedule_reminder(&self, kind: ReminderKind, delay: Duration) {
        info!("Scheduling {:?} in {:?}", kind, delay);
    }

    fn cancel_reminder(&self, kind: ReminderKind) {
        info!("Cancelling {:?}", kind);
    }
}
