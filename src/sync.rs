//! Startup reconciliation between the external provider and the backend.
//! A provider session is only trusted once the backend has linked it to a
//! canonical user record; a backend refusal ends both sessions.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::gateway::{RequestAuth, RequestGateway};
use crate::idp::{ExternalIdentityProvider, ExternalProfile};
use crate::session::{Identity, SessionStore, User};

/// What startup reconciliation concluded.
#[derive(Debug)]
pub enum SyncOutcome {
    /// No external session exists; the store is left untouched.
    Anonymous,
    /// The external identity is linked and the session is authenticated.
    Linked(User),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest<'a> {
    keycloak_user: &'a ExternalProfile,
}

/// Runs the silent provider check and folds its outcome into the session.
pub struct SessionSynchronizer {
    provider: Arc<ExternalIdentityProvider>,
    gateway: Arc<RequestGateway>,
    store: SessionStore,
}

impl SessionSynchronizer {
    #[must_use]
    pub fn new(
        provider: Arc<ExternalIdentityProvider>,
        gateway: Arc<RequestGateway>,
        store: SessionStore,
    ) -> Self {
        Self {
            provider,
            gateway,
            store,
        }
    }

    /// One reconciliation pass. Call at startup, and again after the user
    /// agent returns from an interactive redirect.
    ///
    /// The session store stays anonymous until the backend accepts the
    /// identity; the sync request itself authenticates with the provider
    /// token directly. When the backend refuses the identity, both the
    /// local session and the provider session are ended exactly once and
    /// the returned error carries the provider's logout directive.
    pub async fn run(&self) -> Result<SyncOutcome, Error> {
        let authenticated = self.provider.init().await?;
        if !authenticated {
            debug!("no external session; nothing to reconcile");
            return Ok(SyncOutcome::Anonymous);
        }

        let Some(profile) = self.provider.user_info().await? else {
            debug!("external session vanished before reconciliation");
            return Ok(SyncOutcome::Anonymous);
        };
        let Some(token) = self.provider.token() else {
            debug!("external session vanished before reconciliation");
            return Ok(SyncOutcome::Anonymous);
        };

        match self
            .gateway
            .post_json::<_, User>(
                "/auth/keycloak-sync",
                &SyncRequest {
                    keycloak_user: &profile,
                },
                RequestAuth::Bearer(token),
            )
            .await
        {
            Ok(user) => {
                info!(user = %user.id, "external identity linked");
                self.store
                    .login_success(Identity::External(user.clone(), self.provider.claims_handle()));
                Ok(SyncOutcome::Linked(user))
            }
            Err(Error::Auth(reason)) => {
                warn!(%reason, "backend refused the external identity; ending both sessions");
                self.store.logout();
                let flow = self.provider.logout().await?;
                Err(Error::Sync {
                    reason,
                    logout: Box::new(flow),
                })
            }
            Err(err) => Err(err),
        }
    }
}
