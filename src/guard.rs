//! Role-based access decisions for routing. Pure: the verdict is a value,
//! and navigation stays with the host.

use crate::session::{Identity, Role, Session};

/// Verdict for a navigation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    RedirectLogin,
    RedirectUnauthorized,
}

/// Decides whether the current session may enter a route requiring any of
/// `allowed_roles`. An empty list means the route only requires a session.
///
/// Local sessions are judged on the backend-assigned role carried in the
/// session; external sessions are judged on live token claims, so a role
/// granted or revoked at the provider applies on the next check.
#[must_use]
pub fn decide(session: &Session, allowed_roles: &[Role]) -> Access {
    let Some(identity) = session.identity() else {
        return Access::RedirectLogin;
    };
    if allowed_roles.is_empty() {
        return Access::Allow;
    }
    let granted = match identity {
        Identity::Local(user) => allowed_roles.contains(&user.role),
        Identity::External(_, claims) => allowed_roles
            .iter()
            .any(|role| claims.has_role(role.as_str())),
    };
    if granted {
        Access::Allow
    } else {
        Access::RedirectUnauthorized
    }
}
