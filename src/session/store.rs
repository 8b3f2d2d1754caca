//! Observable store around the session state machine. Clones share one
//! state; transitions commit atomically and observers are notified on every
//! commit.

use std::sync::Arc;

use tokio::sync::watch;

use super::{Identity, Session, Transition, UserPatch};

/// Shared session store. Cheap to clone; every clone reads and writes the
/// same state.
#[derive(Debug, Clone)]
pub struct SessionStore {
    tx: Arc<watch::Sender<Session>>,
}

impl SessionStore {
    /// Creates a store holding the anonymous initial state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Session::default());
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn current(&self) -> Session {
        self.tx.borrow().clone()
    }

    /// Subscribes to state changes. The receiver observes every committed
    /// transition from this point on.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.tx.subscribe()
    }

    /// Applies a transition as one non-interruptible step and notifies
    /// subscribers. `current()` reflects the new state as soon as this
    /// returns.
    pub fn dispatch(&self, transition: Transition) {
        self.tx.send_modify(|state| *state = state.apply(transition));
    }

    pub fn login_start(&self) {
        self.dispatch(Transition::LoginStart);
    }

    pub fn login_success(&self, identity: Identity) {
        self.dispatch(Transition::LoginSuccess(identity));
    }

    pub fn login_failure(&self, message: impl Into<String>) {
        self.dispatch(Transition::LoginFailure(message.into()));
    }

    pub fn logout(&self) {
        self.dispatch(Transition::Logout);
    }

    pub fn update_user(&self, patch: UserPatch) {
        self.dispatch(Transition::UpdateUser(patch));
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
