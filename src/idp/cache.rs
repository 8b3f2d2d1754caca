//! Host-supplied persistence for provider credentials. The crate defines
//! what is kept and for how long; the medium is the host's choice.

use std::sync::{Mutex, PoisonError};

use secrecy::SecretString;

/// Refresh material worth keeping across process restarts.
#[derive(Debug, Clone)]
pub struct StoredTokens {
    pub refresh_token: SecretString,
    pub id_token: Option<SecretString>,
}

/// A pending authorization redirect: the state, verifier and nonce minted
/// for it, consumed exactly once when the provider calls back.
#[derive(Debug, Clone)]
pub struct PendingAuth {
    pub state: String,
    pub verifier: SecretString,
    pub nonce: String,
}

/// Storage seam for provider credentials.
pub trait TokenCache: Send + Sync {
    fn load_tokens(&self) -> Option<StoredTokens>;
    fn store_tokens(&self, tokens: StoredTokens);
    fn clear_tokens(&self);
    /// Removes and returns the pending authorization record, if any.
    fn take_pending(&self) -> Option<PendingAuth>;
    fn store_pending(&self, pending: PendingAuth);
}

/// In-memory cache; the default when the host does not persist sessions.
#[derive(Debug, Default)]
pub struct MemoryTokenCache {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    tokens: Option<StoredTokens>,
    pending: Option<PendingAuth>,
}

impl MemoryTokenCache {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TokenCache for MemoryTokenCache {
    fn load_tokens(&self) -> Option<StoredTokens> {
        self.lock().tokens.clone()
    }

    fn store_tokens(&self, tokens: StoredTokens) {
        self.lock().tokens = Some(tokens);
    }

    fn clear_tokens(&self) {
        self.lock().tokens = None;
    }

    fn take_pending(&self) -> Option<PendingAuth> {
        self.lock().pending.take()
    }

    fn store_pending(&self, pending: PendingAuth) {
        self.lock().pending = Some(pending);
    }
}
