//! Email/password authentication against the backend's own user store.
//! Input is validated before any request goes out, so malformed
//! credentials never produce network traffic or session churn.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Error;
use crate::gateway::{RequestAuth, RequestGateway};
use crate::session::{Identity, SessionStore, User};

/// Backend-side session provider for locally registered accounts.
pub struct LocalProvider {
    gateway: Arc<RequestGateway>,
    store: SessionStore,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct SignupRequest<'a> {
    name: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthData {
    user: User,
    tokens: TokenEnvelope,
}

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    #[serde(rename = "accessToken")]
    access_token: String,
}

impl LocalProvider {
    #[must_use]
    pub fn new(gateway: Arc<RequestGateway>, store: SessionStore) -> Self {
        Self { gateway, store }
    }

    /// Email/password login. The store passes through the loading state
    /// while the request is in flight; failure lands back in anonymous
    /// with the reason recorded.
    pub async fn login(&self, email: &str, password: &str) -> Result<User, Error> {
        let email = normalize_email(email);
        validate_login(&email, password)?;

        self.store.login_start();
        match self.attempt_login(&email, password).await {
            Ok(user) => {
                debug!(user = %user.id, "local login succeeded");
                Ok(user)
            }
            Err(err) => {
                self.store.login_failure(err.to_string());
                Err(err)
            }
        }
    }

    /// Registers an account and signs the new user in.
    pub async fn signup(&self, name: &str, email: &str, password: &str) -> Result<User, Error> {
        let email = normalize_email(email);
        validate_signup(name, &email, password)?;

        self.store.login_start();
        match self.attempt_signup(name, &email, password).await {
            Ok(user) => {
                debug!(user = %user.id, "account registered and signed in");
                Ok(user)
            }
            Err(err) => {
                self.store.login_failure(err.to_string());
                Err(err)
            }
        }
    }

    /// Ends the local session. The server call is best-effort; local state
    /// clears regardless of its outcome.
    pub async fn logout(&self) -> Result<(), Error> {
        let outcome = self
            .gateway
            .post_unit("/auth/logout", &serde_json::json!({}), RequestAuth::Session)
            .await;
        self.gateway.set_local_token(None);
        self.store.logout();
        if let Err(err) = outcome {
            warn!(error = %err, "backend logout failed; local session cleared anyway");
        }
        Ok(())
    }

    async fn attempt_login(&self, email: &str, password: &str) -> Result<User, Error> {
        let data: AuthData = self
            .gateway
            .post_json(
                "/auth/login",
                &LoginRequest { email, password },
                RequestAuth::Anonymous,
            )
            .await?;
        self.install_session(data)
    }

    async fn attempt_signup(&self, name: &str, email: &str, password: &str) -> Result<User, Error> {
        let data: AuthData = self
            .gateway
            .post_json(
                "/auth/signup",
                &SignupRequest {
                    name,
                    email,
                    password,
                },
                RequestAuth::Anonymous,
            )
            .await?;
        self.install_session(data)
    }

    /// Token first, then the store flips to authenticated, so observers of
    /// the new state can immediately issue session-authenticated requests.
    fn install_session(&self, data: AuthData) -> Result<User, Error> {
        self.gateway
            .set_local_token(Some(SecretString::from(data.tokens.access_token)));
        self.store.login_success(Identity::Local(data.user.clone()));
        Ok(data.user)
    }
}

/// Normalize an email for login and uniqueness checks.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(crate) fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email))
}

/// Display names must not be empty or lead with a digit.
pub(crate) fn valid_name(name: &str) -> bool {
    let trimmed = name.trim();
    !trimmed.is_empty() && !trimmed.starts_with(|c: char| c.is_ascii_digit())
}

/// First unmet password rule, or `None` when the password passes.
pub(crate) fn password_strength_error(password: &str) -> Option<&'static str> {
    let length = password.chars().count();
    if !(8..=20).contains(&length) {
        return Some("Password must be 8-20 characters long");
    }
    if !password.chars().any(char::is_uppercase) {
        return Some("Password must contain an uppercase letter");
    }
    if !password.chars().any(char::is_lowercase) {
        return Some("Password must contain a lowercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Some("Password must contain a number");
    }
    if !password
        .chars()
        .any(|c| !c.is_alphanumeric() && !c.is_whitespace())
    {
        return Some("Password must contain a symbol");
    }
    None
}

fn validate_login(email: &str, password: &str) -> Result<(), Error> {
    let mut fields = HashMap::new();
    if !valid_email(email) {
        fields.insert(
            "email".to_string(),
            "Enter a valid email address".to_string(),
        );
    }
    if password.is_empty() {
        fields.insert("password".to_string(), "Password is required".to_string());
    }
    reject_if_invalid(fields)
}

fn validate_signup(name: &str, email: &str, password: &str) -> Result<(), Error> {
    let mut fields = HashMap::new();
    if !valid_name(name) {
        fields.insert(
            "name".to_string(),
            "Name must not be empty or start with a number".to_string(),
        );
    }
    if !valid_email(email) {
        fields.insert(
            "email".to_string(),
            "Enter a valid email address".to_string(),
        );
    }
    if let Some(reason) = password_strength_error(password) {
        fields.insert("password".to_string(), reason.to_string());
    }
    reject_if_invalid(fields)
}

fn reject_if_invalid(fields: HashMap<String, String>) -> Result<(), Error> {
    if fields.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation {
            message: "Validation failed".to_string(),
            fields,
        })
    }
}
