//! # Ensaluti (Dual-Provider Session Coordination)
//!
//! `ensaluti` authenticates a client application through exactly one of two
//! identity sources: a local email/password backend, or an external
//! OIDC-style provider reached over redirect flows, and exposes a single
//! observable, role-aware session to the rest of the application.
//!
//! ## Session Model
//!
//! One process-wide [`session::SessionStore`] holds the authoritative
//! session record. It changes only through named transitions, and a user is
//! present exactly when the session is authenticated. External identities
//! carry a live claims handle, so role checks on them always see the most
//! recently refreshed token.
//!
//! ## Redirect Flows
//!
//! The crate never navigates. Interactive login, registration and logout
//! against the external provider come back as [`idp::RedirectFlow`]
//! directives the host must follow; their outcome becomes observable after
//! the user agent returns, through `complete_redirect` and the next
//! initialization.
//!
//! ## Token Freshness
//!
//! External access tokens are refreshed proactively and single-flight:
//! concurrent callers finding a stale token share one refresh-grant
//! exchange through [`idp::refresh::TokenRefreshScheduler`].

pub mod config;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod idp;
pub mod local;
pub mod session;
pub mod sync;
pub mod users;

pub use config::{BackendConfig, IdpConfig};
pub use error::Error;
pub use gateway::{RequestAuth, RequestGateway};
pub use guard::{Access, decide};
pub use idp::refresh::{Freshness, TokenRefreshScheduler};
pub use idp::{
    ClaimsHandle, ExternalIdentityProvider, ExternalProfile, FlowKind, InitPhase, RedirectFlow,
};
pub use local::LocalProvider;
pub use session::{
    AuthProvider, Identity, Role, Session, SessionStore, Transition, User, UserPatch,
};
pub use sync::{SessionSynchronizer, SyncOutcome};
pub use users::UserDirectory;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
