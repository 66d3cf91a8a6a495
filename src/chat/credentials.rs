//! Shared credential slot
//!
//! Every session reads the credential from here right before each network
//! call instead of caching it, because the reconnect controller (or an
//! external login) can swap it mid-session. A version counter lets
//! concurrent failures tell whether a refresh already happened.

use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Opaque bearer credential
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
}

impl Credential {
    /// Wrap a raw token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Raw token value
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// A credential together with the store version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedCredential {
    /// The credential
    pub credential: Credential,
    /// Store version when it was installed
    pub version: u64,
}

#[derive(Debug, Default)]
struct Slot {
    credential: Option<Credential>,
    version: u64,
}

/// Shared, externally refreshed credential
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    slot: Arc<RwLock<Slot>>,
}

impl CredentialStore {
    /// Create an empty store (version 0)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `credential` at version 1
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Slot {
                credential: Some(credential),
                version: 1,
            })),
        }
    }

    /// Latest credential, if any
    pub async fn current(&self) -> Option<VersionedCredential> {
        let slot = self.slot.read().await;
        slot.credential.as_ref().map(|credential| VersionedCredential {
            credential: credential.clone(),
            version: slot.version,
        })
    }

    /// Current version (bumped on every install or clear)
    pub async fn version(&self) -> u64 {
        self.slot.read().await.version
    }

    /// Install a new credential and return its version
    ///
    /// Used by the reconnect controller after a refresh and by the login
    /// flow after the user signs in again.
    pub async fn replace(&self, credential: Credential) -> u64 {
        let mut slot = self.slot.write().await;
        slot.credential = Some(credential);
        slot.version += 1;
        slot.version
    }

    /// Drop the credential (logout)
    pub async fn clear(&self) -> u64 {
        let mut slot = self.slot.write().await;
        slot.credential = None;
        slot.version += 1;
        slot.version
    }
}
