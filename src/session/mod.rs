//! Session state machine. One process-wide record of who, if anyone, is
//! authenticated; it changes only through the named transitions, and a user
//! is present exactly when the state is `Authenticated`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::idp::ClaimsHandle;

mod store;

pub use store::SessionStore;

/// Canonical role, ordered by privilege.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Manager,
    Admin,
}

impl Role {
    /// Wire and claim name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Manager => "manager",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "manager" => Ok(Self::Manager),
            "admin" => Ok(Self::Admin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// A role name outside the canonical set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown role: {}", self.0)
    }
}

impl std::error::Error for UnknownRole {}

/// Canonical user record as the backend returns it. A missing role resolves
/// to `user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub role: Role,
}

/// Partial user update; unset fields keep their current value.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct UserPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
}

/// Which identity source produced the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProvider {
    Local,
    External,
}

/// An authenticated identity: the canonical user plus its provenance. An
/// external identity always carries the claims handle used for live role
/// checks, so a provider tag without a claims source cannot exist.
#[derive(Debug, Clone)]
pub enum Identity {
    Local(User),
    External(User, ClaimsHandle),
}

impl Identity {
    #[must_use]
    pub const fn user(&self) -> &User {
        match self {
            Self::Local(user) | Self::External(user, _) => user,
        }
    }

    #[must_use]
    pub const fn provider(&self) -> AuthProvider {
        match self {
            Self::Local(_) => AuthProvider::Local,
            Self::External(..) => AuthProvider::External,
        }
    }

    fn user_mut(&mut self) -> &mut User {
        match self {
            Self::Local(user) | Self::External(user, _) => user,
        }
    }
}

/// A named state transition; applying one is the only way session state
/// changes.
#[derive(Debug, Clone)]
pub enum Transition {
    /// A credential exchange started; clears any prior error.
    LoginStart,
    /// A provider produced a verified identity.
    LoginSuccess(Identity),
    /// The attempt failed; the message lands in the anonymous state.
    LoginFailure(String),
    /// Reset to anonymous. Valid from every state and idempotent.
    Logout,
    /// Merge profile fields into the authenticated user. Ignored elsewhere.
    UpdateUser(UserPatch),
}

/// The session states. `Authenticated` is the only state holding a user, so
/// the "authenticated iff user present" invariant holds by construction.
#[derive(Debug, Clone)]
pub enum Session {
    Anonymous { error: Option<String> },
    Authenticating,
    Authenticated { identity: Identity },
}

impl Default for Session {
    fn default() -> Self {
        Self::Anonymous { error: None }
    }
}

impl Session {
    /// Applies a transition, returning the next state. Pure: `self` is never
    /// mutated.
    #[must_use]
    pub fn apply(&self, transition: Transition) -> Self {
        match transition {
            Transition::LoginStart => Self::Authenticating,
            Transition::LoginSuccess(identity) => Self::Authenticated { identity },
            Transition::LoginFailure(message) => Self::Anonymous {
                error: Some(message),
            },
            Transition::Logout => Self::Anonymous { error: None },
            Transition::UpdateUser(patch) => match self {
                Self::Authenticated { identity } => {
                    let mut identity = identity.clone();
                    let user = identity.user_mut();
                    if let Some(name) = patch.name {
                        user.name = name;
                    }
                    if let Some(email) = patch.email {
                        user.email = email;
                    }
                    if let Some(role) = patch.role {
                        user.role = role;
                    }
                    Self::Authenticated { identity }
                }
                other => other.clone(),
            },
        }
    }

    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    /// True while a credential exchange is in flight.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        matches!(self, Self::Authenticating)
    }

    #[must_use]
    pub const fn user(&self) -> Option<&User> {
        match self {
            Self::Authenticated { identity } => Some(identity.user()),
            _ => None,
        }
    }

    /// The active identity source; `None` exactly when unauthenticated.
    #[must_use]
    pub const fn provider(&self) -> Option<AuthProvider> {
        match self {
            Self::Authenticated { identity } => Some(identity.provider()),
            _ => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Anonymous { error } => error.as_deref(),
            _ => None,
        }
    }

    #[must_use]
    pub const fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Authenticated { identity } => Some(identity),
            _ => None,
        }
    }
}
