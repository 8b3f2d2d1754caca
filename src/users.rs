//! User directory and profile operations on top of the request gateway.
//! Role assignment is a backend-only concern; external role claims never
//! pass through here.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::Error;
use crate::gateway::{RequestAuth, RequestGateway};
use crate::local::{normalize_email, password_strength_error, valid_email, valid_name};
use crate::session::{Role, SessionStore, User, UserPatch};

/// Session-authenticated access to the backend's user records.
pub struct UserDirectory {
    gateway: Arc<RequestGateway>,
    store: SessionStore,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RoleUpdate<'a> {
    user_id: &'a str,
    role: Role,
}

#[derive(Debug, Serialize)]
struct ProfileUpdate<'a> {
    name: &'a str,
    email: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PasswordChange<'a> {
    current_password: &'a str,
    new_password: &'a str,
}

impl UserDirectory {
    #[must_use]
    pub fn new(gateway: Arc<RequestGateway>, store: SessionStore) -> Self {
        Self { gateway, store }
    }

    /// Every registered user. The backend enforces who may call this.
    pub async fn list(&self) -> Result<Vec<User>, Error> {
        self.gateway.get_json("/users", RequestAuth::Session).await
    }

    /// Assigns `role` to another user and returns the updated record.
    pub async fn update_role(&self, user_id: &str, role: Role) -> Result<User, Error> {
        let updated: User = self
            .gateway
            .patch_json("/users/role", &RoleUpdate { user_id, role }, RequestAuth::Session)
            .await?;
        debug!(user = %updated.id, role = %updated.role, "role assignment applied");
        Ok(updated)
    }

    /// Updates the signed-in user's display name and email, folding the
    /// change into the session.
    pub async fn update_profile(&self, name: &str, email: &str) -> Result<User, Error> {
        let email = normalize_email(email);
        let mut fields = HashMap::new();
        if !valid_name(name) {
            fields.insert(
                "name".to_string(),
                "Name must not be empty or start with a number".to_string(),
            );
        }
        if !valid_email(&email) {
            fields.insert(
                "email".to_string(),
                "Enter a valid email address".to_string(),
            );
        }
        if !fields.is_empty() {
            return Err(Error::Validation {
                message: "Validation failed".to_string(),
                fields,
            });
        }

        let updated: User = self
            .gateway
            .put_json(
                "/users/profile",
                &ProfileUpdate { name, email: &email },
                RequestAuth::Session,
            )
            .await?;
        self.store.update_user(UserPatch {
            name: Some(updated.name.clone()),
            email: Some(updated.email.clone()),
            role: None,
        });
        Ok(updated)
    }

    /// Changes the signed-in user's password. The new password passes the
    /// same strength rules as registration before anything goes out.
    pub async fn change_password(
        &self,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), Error> {
        let mut fields = HashMap::new();
        if current_password.is_empty() {
            fields.insert(
                "currentPassword".to_string(),
                "Current password is required".to_string(),
            );
        }
        if let Some(reason) = password_strength_error(new_password) {
            fields.insert("newPassword".to_string(), reason.to_string());
        }
        if !fields.is_empty() {
            return Err(Error::Validation {
                message: "Validation failed".to_string(),
                fields,
            });
        }

        self.gateway
            .put_unit(
                "/users/password",
                &PasswordChange {
                    current_password,
                    new_password,
                },
                RequestAuth::Session,
            )
            .await
    }

    /// Fetches the canonical record for the current session and reconciles
    /// the session's copy with it. A no-op on the session when anonymous.
    pub async fn profile(&self) -> Result<User, Error> {
        let user: User = self
            .gateway
            .get_json("/auth/profile", RequestAuth::Session)
            .await?;
        self.store.update_user(UserPatch {
            name: Some(user.name.clone()),
            email: Some(user.email.clone()),
            role: Some(user.role),
        });
        Ok(user)
    }
}
