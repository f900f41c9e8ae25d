//! Privacy-padding decoy traffic
//!
//! Whenever a caller path completes without performing a genuine network
//! request (validation failure, cached short-circuit, fail-fast on an
//! occupied slot), an equivalent-shaped decoy is dispatched to the same
//! endpoint class. An observer therefore sees the same request cadence
//! whether or not a real test event happened.

use crate::client::verification::VerificationClient;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which endpoint class a decoy should mimic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoyKind {
    Registration,
    Result,
    Tan,
}

/// Dispatches decoy requests without blocking the caller
#[derive(Clone)]
pub struct TrafficPadding {
    client: Arc<VerificationClient>,
}

impl TrafficPadding {
    /// Create a padding dispatcher sharing the real verification client
    pub fn new(client: Arc<VerificationClient>) -> Self {
        Self { client }
    }

    /// Dispatch a decoy registration request
    pub fn fake_registration(&self) {
        self.dispatch(DecoyKind::Registration);
    }

    /// Dispatch a decoy result request
    pub fn fake_result(&self) {
        self.dispatch(DecoyKind::Result);
    }

    /// Dispatch a decoy TAN request
    pub fn fake_tan(&self) {
        self.dispatch(DecoyKind::Tan);
    }

    /// Spawn the decoy with a short random delay so decoys do not land in
    /// lockstep with the caller path that skipped the real request.
    fn dispatch(&self, kind: DecoyKind) {
        let client = self.client.clone();
        let delay_ms = rand::thread_rng().gen_range(0..=1000u64);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            let outcome = match kind {
                DecoyKind::Registration => client.fake_registration().await,
                DecoyKind::Result => client.fake_result().await,
                DecoyKind::Tan => client.fake_tan().await,
            };

            // Decoy failures must never surface to the user
            if let Err(e) = outcome {
                debug!("Decoy {:?} request failed: {}", kind, e);
            }
        });
    }
}
