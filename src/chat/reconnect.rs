//! Credential refresh after authorization failures
//!
//! Any number of sessions and sends can hit an expired credential at the
//! same moment. The controller makes sure only one refresh is in flight,
//! that callers who lost the race reuse its result, and that a failed
//! refresh is terminal until a new credential is installed from outside.

use crate::chat::credentials::{CredentialStore, VersionedCredential};
use crate::transport::CredentialRefresher;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of a refresh request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A credential newer than the failed one is installed
    Refreshed(VersionedCredential),
    /// Refresh failed; the session must be treated as expired
    Expired,
}

#[derive(Debug, Default)]
struct RefreshState {
    /// Store version whose refresh already failed
    failed_at: Option<u64>,
    attempts: u64,
}

/// Single-flight credential refresher
pub struct ReconnectController {
    refresher: Arc<dyn CredentialRefresher>,
    store: CredentialStore,
    state: Mutex<RefreshState>,
}

impl ReconnectController {
    /// Create a controller writing refreshed credentials into `store`
    pub fn new(refresher: Arc<dyn CredentialRefresher>, store: CredentialStore) -> Self {
        Self {
            refresher,
            store,
            state: Mutex::new(RefreshState::default()),
        }
    }

    /// Shared credential store
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Refresh after a call made with credential version `failed_version`
    /// was rejected
    ///
    /// # Arguments
    /// * `failed_version` - Store version of the credential the server refused
    ///
    /// # Returns
    /// * `RefreshOutcome::Refreshed` - A newer credential is available (either
    ///   just fetched, or installed by a concurrent caller)
    /// * `RefreshOutcome::Expired` - Refresh failed now or earlier for this version
    pub async fn refresh_after_failure(&self, failed_version: u64) -> RefreshOutcome {
        // Held across the refresh call so concurrent failures queue behind it
        let mut state = self.state.lock().await;

        let current = self.store.current().await;
        if let Some(current) = &current {
            if current.version > failed_version {
                debug!(
                    failed_version,
                    current_version = current.version,
                    "Credential already replaced; reusing it"
                );
                return RefreshOutcome::Refreshed(current.clone());
            }
        }

        let version = self.store.version().await;
        if state.failed_at == Some(version) {
            debug!(version, "Refresh already failed for this credential");
            return RefreshOutcome::Expired;
        }

        state.attempts += 1;
        let previous = current.as_ref().map(|c| &c.credential);
        match self.refresher.refresh(previous).await {
            Ok(credential) => {
                let version = self.store.replace(credential.clone()).await;
                state.failed_at = None;
                info!(version, attempt = state.attempts, "Credential refreshed");
                RefreshOutcome::Refreshed(VersionedCredential {
                    credential,
                    version,
                })
            }
            Err(e) => {
                warn!(version, error = %e, "Credential refresh failed; session expired");
                state.failed_at = Some(version);
                RefreshOutcome::Expired
            }
        }
    }

    /// Whether the current credential is known to be unrefreshable
    pub async fn is_expired(&self) -> bool {
        let state = self.state.lock().await;
        state.failed_at.is_some() && state.failed_at == Some(self.store.version().await)
    }

    /// Number of refresh calls actually issued
    pub async fn refresh_attempts(&self) -> u64 {
        self.state.lock().await.attempts
    }
}
