//! Session resolution
//!
//! A session is the `sessionToken` attribute of a `_User` object. Resolving
//! a token yields the actor a request runs as:
//! - no token (or an empty one) resolves to the anonymous actor
//! - an unknown token is an error (`InvalidSession`), never anonymous
//! - roles are the `_Role` rows listing the user, plus every role whose
//!   `roles` list contains a role already held

use crate::acl::Actor;
use crate::error::{ParcelError, ParcelResult};
use crate::executor::Executor;
use crate::query_translator::QueryOptions;
use crate::types::{ObjectId, ROLE_CLASS, USER_CLASS};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Maps session tokens to actors
pub struct SessionResolver {
    executor: Arc<Executor>,
}

impl SessionResolver {
    pub fn new(executor: Arc<Executor>) -> Self {
        SessionResolver { executor }
    }

    pub async fn resolve(&self, token: Option<&str>) -> ParcelResult<Actor> {
        let token = match token.map(str::trim) {
            None | Some("") => return Ok(Actor::anonymous()),
            Some(token) => token,
        };

        let user = match self
            .executor
            .query_one(USER_CLASS, json!({ "sessionToken": token }))
            .await
        {
            Ok(Some(user)) => user,
            Ok(None) | Err(ParcelError::ClassNotFound(_)) => return Err(ParcelError::InvalidSession),
            Err(e) => return Err(e),
        };

        let roles = self.roles_of(&user.id).await?;
        debug!(user = %user.id, roles = roles.len(), "session resolved");
        Ok(Actor::user(user.id, roles))
    }

    /// Names of the roles held by a user, direct and inherited
    pub async fn roles_of(&self, user_id: &ObjectId) -> ParcelResult<Vec<String>> {
        // role id -> role name
        let mut held: BTreeMap<String, String> = BTreeMap::new();
        let mut filter = json!({ "users": user_id.as_str() });

        loop {
            let options = QueryOptions::new().filter(filter);
            let rows = match self.executor.query(ROLE_CLASS, &options).await {
                Ok(result) => result.results,
                Err(ParcelError::ClassNotFound(_)) => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };

            let mut added = Vec::new();
            for row in rows {
                let id = row.id.to_string();
                if held.contains_key(&id) {
                    continue;
                }
                if let Some(name) = row.get_str("name") {
                    held.insert(id.clone(), name.to_string());
                    added.push(Value::String(id));
                }
            }

            if added.is_empty() {
                break;
            }
            filter = json!({ "roles": { "$in": added } });
        }

        let mut names: Vec<String> = held.into_values().collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// Fresh opaque session token (hex SHA-256 of random bytes)
pub fn generate_session_token() -> String {
    let seed: [u8; 32] = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(seed);
    format!("{:x}", hasher.finalize())
}
