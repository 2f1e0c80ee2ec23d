//! Caller identity, roles and the per-request authorized id set.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Roles the assistant serves. Anything else is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    SuperAdmin,
    Parent,
}

impl Role {
    pub fn from_claim(claim: &str) -> Option<Role> {
        match claim.trim().to_uppercase().as_str() {
            "ROLE_SUPER_ADMIN" => Some(Role::SuperAdmin),
            "ROLE_PARENT" => Some(Role::Parent),
            _ => None,
        }
    }

    /// Effective role for a set of claims. Super admin wins over parent.
    pub fn effective<S: AsRef<str>>(claims: &[S]) -> Option<Role> {
        let roles: Vec<Role> = claims
            .iter()
            .filter_map(|c| Role::from_claim(c.as_ref()))
            .collect();
        if roles.contains(&Role::SuperAdmin) {
            Some(Role::SuperAdmin)
        } else if roles.contains(&Role::Parent) {
            Some(Role::Parent)
        } else {
            None
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::SuperAdmin => write!(f, "ROLE_SUPER_ADMIN"),
            Role::Parent => write!(f, "ROLE_PARENT"),
        }
    }
}

/// Verified identity of the caller, as handed over by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub user_id: u64,
    pub roles: Vec<String>,
}

impl CallerIdentity {
    pub fn new(user_id: u64, roles: Vec<String>) -> Self {
        Self { user_id, roles }
    }

    pub fn parent(user_id: u64) -> Self {
        Self::new(user_id, vec![Role::Parent.to_string()])
    }

    pub fn super_admin(user_id: u64) -> Self {
        Self::new(user_id, vec![Role::SuperAdmin.to_string()])
    }

    /// Effective role, or an access-denied error for unknown roles.
    pub fn role(&self) -> Result<Role> {
        Role::effective(&self.roles).ok_or_else(|| {
            CacheError::AccessDenied(format!(
                "user {} has no role allowed to use the assistant ({:?})",
                self.user_id, self.roles
            ))
        })
    }
}

/// Ordered, duplicate-free set of positive row identifiers the caller may
/// read. Resolved per request; never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedIds(Vec<u64>);

impl AuthorizedIds {
    /// Keeps first-seen order, drops zeros and duplicates.
    pub fn new(ids: impl IntoIterator<Item = u64>) -> Self {
        let mut out: Vec<u64> = Vec::new();
        for id in ids {
            if id > 0 && !out.contains(&id) {
                out.push(id);
            }
        }
        Self(out)
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.0.contains(&id)
    }

    /// `7012,7716`
    pub fn joined(&self) -> String {
        self.joined_with(",")
    }

    pub fn joined_with(&self, separator: &str) -> String {
        self.0
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(separator)
    }

    /// Parse `7012,7716` (spaces allowed).
    pub fn parse(raw: &str) -> Result<Self> {
        let mut ids = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let id = part
                .parse::<u64>()
                .map_err(|e| CacheError::Config(format!("Invalid id '{}': {}", part, e)))?;
            ids.push(id);
        }
        Ok(Self::new(ids))
    }
}

impl fmt::Display for AuthorizedIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.joined_with(", "))
    }
}
