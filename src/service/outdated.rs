//! Outdated-state scheduler
//!
//! One coalesced timer for all negative antigen tests (single-user and
//! family). Each wakeup recomputes the flags with a fresh clock reading,
//! then sleeps until the single next-due cutoff. Tracked-set changes on
//! either service interrupt the sleep so the cutoff is recomputed.

use crate::Result;
use crate::config::ConfigManager;
use crate::service::family::FamilyTestService;
use crate::service::registry::CoronaTestService;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Drives the outdated flag of negative antigen tests over time
pub struct OutdatedStateScheduler {
    user_service: CoronaTestService,
    family_service: FamilyTestService,
    config: ConfigManager,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OutdatedStateScheduler {
    /// Create a stopped scheduler over both test services
    pub fn new(
        user_service: CoronaTestService,
        family_service: FamilyTestService,
        config: ConfigManager,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_service,
            family_service,
            config,
            task: Mutex::new(None),
        })
    }

    /// Start the scheduler task, replacing a previously running one.
    ///
    /// The first iteration performs a catch-up pass, so tests whose cutoff
    /// passed while the process was down are flagged immediately.
    pub async fn start(self: &Arc<Self>) {
        self.stop().await;

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut user_rx = scheduler.user_service.subscribe();
            let mut family_rx = scheduler.family_service.subscribe();

            loop {
                let ttl_hours = scheduler.config.hours_to_deem_test_outdated().await;

                let cutoff = if ttl_hours == 0 {
                    // Feature disabled: no flags to set, wait for changes only
                    None
                } else {
                    let now = Utc::now();
                    if let Err(e) = scheduler.refresh(now, ttl_hours).await {
                        warn!("Refreshing outdated state failed: {}", e);
                    }
                    scheduler.next_cutoff(ttl_hours).await
                };

                match cutoff {
                    Some(at) => {
                        let wait = (at - Utc::now()).to_std().unwrap_or_default();
                        debug!("Next outdated-state cutoff in {:?}", wait);
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            changed = user_rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                            }
                            changed = family_rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    None => {
                        tokio::select! {
                            changed = user_rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                            }
                            changed = family_rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        *self.task.lock().await = Some(handle);
        info!("Outdated-state scheduler started");
    }

    /// Stop the scheduler task if one is running
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            info!("Outdated-state scheduler stopped");
        }
    }

    async fn refresh(&self, now: DateTime<Utc>, ttl_hours: u32) -> Result<()> {
        self.user_service.refresh_outdated_state(now, ttl_hours).await?;
        self.family_service.refresh_outdated_state(now, ttl_hours).await
    }

    /// Earliest future moment any tracked test becomes outdated
    async fn next_cutoff(&self, ttl_hours: u32) -> Option<DateTime<Utc>> {
        let ttl = Duration::hours(ttl_hours as i64);
        let mut candidates = self.user_service.antigen_outdated_candidates().await;
        candidates.extend(self.family_service.antigen_outdated_candidates().await);
        candidates.into_iter().map(|date| date + ttl).min()
    }
}
