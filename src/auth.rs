//! User accounts
//!
//! Signup, login and logout on top of the `_User` class. Features:
//! - Argon2 password digests (never serialized outward)
//! - Session tokens stored on the user row and reused across logins
//! - Transparent rehash when the hashing parameters changed
//! - Fixed delay before reporting a failed login

use crate::acl::{require, Acl, Actor, Operation};
use crate::error::{ParcelError, ParcelResult};
use crate::executor::Executor;
use crate::hasher::PasswordHasher;
use crate::session::generate_session_token;
use crate::types::{Attributes, Object, ObjectId, USER_CLASS};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Attributes never returned with a user
const CREDENTIAL_ATTRIBUTES: [&str; 3] = ["password", "sessionToken", "authData"];

/// A user together with its session token
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedUser {
    pub user: Object,
    pub session_token: String,
}

impl AuthenticatedUser {
    /// Public JSON of the user plus the session token
    pub fn to_json(&self) -> Value {
        let mut out = self.user.to_public_json(&CREDENTIAL_ATTRIBUTES);
        if let Value::Object(map) = &mut out {
            map.insert("sessionToken".into(), Value::String(self.session_token.clone()));
        }
        out
    }
}

/// Account operations on `_User`
pub struct AccountService {
    executor: Arc<Executor>,
    hasher: Arc<dyn PasswordHasher>,
    failure_delay: Duration,
}

impl AccountService {
    pub fn new(executor: Arc<Executor>, hasher: Arc<dyn PasswordHasher>, failure_delay: Duration) -> Self {
        AccountService {
            executor,
            hasher,
            failure_delay,
        }
    }

    /// Create a user and open a session for it
    pub async fn signup(&self, mut data: Attributes) -> ParcelResult<AuthenticatedUser> {
        non_empty_string(&data, "username")?;
        let password = non_empty_string(&data, "password")?.to_string();
        for name in ["sessionToken", "authData"] {
            if data.contains_key(name) {
                return Err(ParcelError::Validation(format!("attribute '{name}' cannot be set at signup")));
            }
        }

        let explicit_acl = data.contains_key("acl") || data.contains_key("ACL");
        let session_token = generate_session_token();
        data.insert("password".into(), Value::String(self.hasher.hash(&password)?));
        data.insert("sessionToken".into(), Value::String(session_token.clone()));

        let mut user = self.executor.insert(USER_CLASS, data).await?;
        if !explicit_acl {
            let acl = serde_json::to_value(Acl::owned_by(&user.id))
                .map_err(|e| ParcelError::Validation(format!("invalid acl: {e}")))?;
            user = self
                .executor
                .update(USER_CLASS, &user.id, attributes(json!({ "acl": acl })))
                .await?;
        }

        info!(user = %user.id, "user signed up");
        Ok(AuthenticatedUser { user, session_token })
    }

    /// Check credentials; reuse the stored session token or issue one
    pub async fn login(&self, username: &str, password: &str) -> ParcelResult<AuthenticatedUser> {
        let user = self
            .executor
            .query_one(USER_CLASS, json!({ "username": username }))
            .await?;

        let user = match user {
            Some(user)
                if user
                    .get_str("password")
                    .is_some_and(|digest| self.hasher.verify(password, digest)) =>
            {
                user
            }
            _ => {
                debug!(username, "login failed");
                tokio::time::sleep(self.failure_delay).await;
                return Err(ParcelError::InvalidCredentials);
            }
        };

        let mut changes = Attributes::new();
        let session_token = match user.get_str("sessionToken") {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => {
                let token = generate_session_token();
                changes.insert("sessionToken".into(), Value::String(token.clone()));
                token
            }
        };
        if user.get_str("password").is_some_and(|d| self.hasher.needs_rehash(d)) {
            changes.insert("password".into(), Value::String(self.hasher.hash(password)?));
        }

        let user = if changes.is_empty() {
            user
        } else {
            self.executor.update(USER_CLASS, &user.id, changes).await?
        };

        info!(user = %user.id, "user logged in");
        Ok(AuthenticatedUser { user, session_token })
    }

    /// Close the session carried by the token
    pub async fn logout(&self, token: &str) -> ParcelResult<()> {
        let user = self.current_user(token).await?;
        self.executor
            .update(
                USER_CLASS,
                &user.id,
                attributes(json!({ "sessionToken": { "__op": "Delete" } })),
            )
            .await?;
        info!(user = %user.id, "user logged out");
        Ok(())
    }

    /// User owning the session token
    pub async fn current_user(&self, token: &str) -> ParcelResult<Object> {
        if token.trim().is_empty() {
            return Err(ParcelError::InvalidSession);
        }
        match self
            .executor
            .query_one(USER_CLASS, json!({ "sessionToken": token }))
            .await
        {
            Ok(Some(user)) => Ok(user),
            Ok(None) | Err(ParcelError::ClassNotFound(_)) => Err(ParcelError::InvalidSession),
            Err(e) => Err(e),
        }
    }

    /// Update a user; a new password is hashed before it is stored
    pub async fn update_user(&self, actor: &Actor, id: &ObjectId, mut data: Attributes) -> ParcelResult<Object> {
        let handle = self.executor.registry().get(USER_CLASS).await?;
        require(handle.as_ref(), actor, Operation::Update)?;
        let user = self.executor.get_handle(&handle, id).await?;
        require(&user, actor, Operation::Write)?;

        if !actor.is_master() {
            if let Some(name) = ["sessionToken", "authData"].iter().find(|n| data.contains_key(**n)) {
                return Err(ParcelError::Unauthorized(format!("attribute '{name}' is protected")));
            }
        }
        if data.contains_key("password") {
            let password = non_empty_string(&data, "password")?.to_string();
            data.insert("password".into(), Value::String(self.hasher.hash(&password)?));
        }

        self.executor.update_handle(&handle, id, data).await
    }

    pub async fn delete_user(&self, actor: &Actor, id: &ObjectId) -> ParcelResult<()> {
        let handle = self.executor.registry().get(USER_CLASS).await?;
        require(handle.as_ref(), actor, Operation::Delete)?;
        let user = self.executor.get_handle(&handle, id).await?;
        require(&user, actor, Operation::Write)?;

        self.executor.delete_handle(&handle, id).await?;
        info!(user = %id, "user deleted");
        Ok(())
    }
}

fn non_empty_string<'a>(data: &'a Attributes, name: &str) -> ParcelResult<&'a str> {
    match data.get(name).and_then(Value::as_str) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ParcelError::Validation(format!("{name} is required"))),
    }
}

fn attributes(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        _ => Attributes::new(),
    }
}
