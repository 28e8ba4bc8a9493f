//! Access control lists
//!
//! Every object (and every class-definition row) carries an optional ACL
//! mapping a group to per-operation grants. Groups are, from most to least
//! specific: the actor's user id, `role:<name>` for each held role, and the
//! public wildcard `*`. Evaluation returns the first grant found in that
//! order and denies when nothing matches.

use crate::error::{ParcelError, ParcelResult};
use crate::types::{Object, ObjectId, META_CLASS};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Public wildcard group
pub const PUBLIC: &str = "*";

/// Prefix for role groups
pub const ROLE_PREFIX: &str = "role:";

/// Operations governed by ACLs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Write,
    Get,
    Find,
    Create,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::Read,
        Operation::Write,
        Operation::Get,
        Operation::Find,
        Operation::Update,
        Operation::Create,
        Operation::Delete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Get => "get",
            Operation::Find => "find",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// Group -> operation -> allowed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Acl(BTreeMap<String, BTreeMap<String, bool>>);

impl Acl {
    pub fn new() -> Self {
        Acl(BTreeMap::new())
    }

    /// Set a grant (builder style).
    pub fn grant(mut self, group: impl Into<String>, op: Operation, allowed: bool) -> Self {
        self.set(group, op, allowed);
        self
    }

    pub fn set(&mut self, group: impl Into<String>, op: Operation, allowed: bool) {
        self.0
            .entry(group.into())
            .or_default()
            .insert(op.as_str().to_string(), allowed);
    }

    /// Explicit grant for a group, if any.
    pub fn get(&self, group: &str, op: Operation) -> Option<bool> {
        self.0.get(group).and_then(|ops| ops.get(op.as_str())).copied()
    }

    /// Owner read/write plus public read.
    pub fn owned_by(owner: &ObjectId) -> Self {
        Acl::new()
            .grant(owner.as_str(), Operation::Read, true)
            .grant(owner.as_str(), Operation::Write, true)
            .grant(PUBLIC, Operation::Read, true)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Identity a request runs as
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Option<ObjectId>,
    pub roles: Vec<String>,
    master: bool,
}

impl Actor {
    pub fn anonymous() -> Self {
        Actor::default()
    }

    pub fn user(user_id: ObjectId, roles: Vec<String>) -> Self {
        Actor {
            user_id: Some(user_id),
            roles,
            master: false,
        }
    }

    /// Internal system actor; bypasses every ACL.
    pub fn master() -> Self {
        Actor {
            user_id: None,
            roles: Vec::new(),
            master: true,
        }
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    /// Groups in evaluation order, most specific first.
    pub fn groups(&self) -> Vec<String> {
        let mut groups = Vec::with_capacity(self.roles.len() + 2);
        if let Some(id) = &self.user_id {
            groups.push(id.to_string());
        }
        groups.extend(self.roles.iter().map(|r| format!("{ROLE_PREFIX}{r}")));
        groups.push(PUBLIC.to_string());
        groups
    }
}

/// Anything an ACL can be evaluated against
pub trait AclSubject {
    fn acl(&self) -> Option<&Acl>;

    /// Rows describing a class fall back to the class default ACL.
    fn is_class_row(&self) -> bool {
        false
    }
}

impl AclSubject for Object {
    fn acl(&self) -> Option<&Acl> {
        self.acl.as_ref()
    }

    fn is_class_row(&self) -> bool {
        self.class_name == META_CLASS
    }
}

/// Public read only
pub fn default_acl() -> Acl {
    Acl::new().grant(PUBLIC, Operation::Read, true)
}

/// Public full access, for class rows without an explicit ACL
pub fn class_default_acl() -> Acl {
    Operation::ALL
        .iter()
        .fold(Acl::new(), |acl, op| acl.grant(PUBLIC, *op, true))
}

pub fn effective_acl<S: AclSubject + ?Sized>(subject: &S) -> Cow<'_, Acl> {
    match subject.acl() {
        Some(acl) => Cow::Borrowed(acl),
        None if subject.is_class_row() => Cow::Owned(class_default_acl()),
        None => Cow::Owned(default_acl()),
    }
}

pub fn permits<S: AclSubject + ?Sized>(subject: &S, actor: &Actor, op: Operation) -> bool {
    if actor.is_master() {
        return true;
    }
    let acl = effective_acl(subject);
    actor
        .groups()
        .iter()
        .find_map(|group| acl.get(group, op))
        .unwrap_or(false)
}

pub fn require<S: AclSubject + ?Sized>(subject: &S, actor: &Actor, op: Operation) -> ParcelResult<()> {
    if permits(subject, actor, op) {
        Ok(())
    } else {
        Err(ParcelError::Unauthorized(format!(
            "operation '{}' not permitted",
            op.as_str()
        )))
    }
}
