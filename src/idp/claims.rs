//! Access-token claim reading. The client decodes the payload of its own
//! token for expiry and realm-role hints; signature verification stays with
//! the resource servers that accept the token.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use crate::error::Error;
use crate::session::Role;

/// Claims this client reads from its access token. Everything is optional;
/// a token missing a field simply yields weaker hints.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct AccessClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub realm_access: RealmAccess,
}

/// Realm-level role claim block.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct RealmAccess {
    #[serde(default)]
    pub roles: Vec<String>,
}

impl AccessClaims {
    /// Highest-privilege canonical role among the realm roles; `user` when
    /// none match.
    #[must_use]
    pub fn canonical_role(&self) -> Role {
        self.realm_access
            .roles
            .iter()
            .filter_map(|name| name.parse::<Role>().ok())
            .max()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_realm_role(&self, name: &str) -> bool {
        self.realm_access.roles.iter().any(|role| role == name)
    }
}

/// Decodes the payload segment of a compact JWT without verifying it.
pub(crate) fn decode(token: &str) -> Result<AccessClaims, Error> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(Error::UnexpectedResponse(
            "token is not a compact JWT".into(),
        ));
    }
    let payload = URL_SAFE_NO_PAD
        .decode(segments[1])
        .map_err(|_| Error::UnexpectedResponse("token payload is not base64url".into()))?;
    serde_json::from_slice(&payload)
        .map_err(|err| Error::UnexpectedResponse(format!("token payload is not valid JSON: {err}")))
}

#[cfg(test)]
pub(crate) fn encode_unsigned(payload: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    format!("{header}.{body}.sig")
}
