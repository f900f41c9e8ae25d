//! Test lifecycle services
//!
//! `CoronaTestService` tracks the user's own tests (at most one per type),
//! `FamilyTestService` an unbounded set of family-member tests. Both feed
//! the shared `OutdatedStateScheduler` and the notification and certificate
//! seams.

pub mod certificates;
pub mod family;
pub mod notifications;
pub mod outdated;
pub mod registry;

pub use certificates::{CertificateIssuer, CertificateRequest, TracingIssuer};
pub use family::FamilyTestService;
pub use notifications::{
    NotificationScope, Notifier, ReminderKind, TestResultNotification, TracingNotifier,
    WARN_OTHERS_REMINDER_DELAY,
};
pub use outdated::OutdatedStateScheduler;
pub use registry::{CoronaTestService, RegistrationRequest, TrackedTests};
