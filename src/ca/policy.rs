//! Certificate Authorization Policy
//!
//! Maps a caller identity to the policy group its certificate is issued for.
//! Groups are evaluated in configured order and the first membership wins.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Serialize, Deserialize};
use tracing::{debug, warn};

use crate::errors::{GroupCaError, Result as GroupCaResult};
use super::Group;

/// Outcome of authorizing one request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub allowed: bool,
    pub group: Option<Group>,
}

impl AuthorizationDecision {
    pub fn allow(group: Group) -> Self {
        Self {
            allowed: true,
            group: Some(group),
        }
    }

    pub fn deny() -> Self {
        Self {
            allowed: false,
            group: None,
        }
    }

    /// The granted group, or `Unauthorized` for `identity`
    pub fn into_result(self, identity: &str) -> GroupCaResult<Group> {
        match (self.allowed, self.group) {
            (true, Some(group)) => Ok(group),
            _ => Err(GroupCaError::Unauthorized {
                identity: identity.to_string(),
            }),
        }
    }
}

/// Source of an identity's group memberships
pub trait MembershipDirectory: Send + Sync {
    /// Whether `identity` belongs to the group named `group`
    fn is_member(&self, identity: &str, group: &str) -> bool;
}

/// Membership table loaded from configuration. Identity and group names are
/// matched case-insensitively.
#[derive(Clone, Debug, Default)]
pub struct StaticMembershipDirectory {
    memberships: HashMap<String, Vec<String>>,
}

impl StaticMembershipDirectory {
    pub fn new(memberships: &BTreeMap<String, Vec<String>>) -> Self {
        let memberships = memberships
            .iter()
            .map(|(identity, groups)| {
                (
                    identity.to_lowercase(),
                    groups.iter().map(|g| g.to_lowercase()).collect(),
                )
            })
            .collect();
        Self { memberships }
    }

    pub fn with_member(mut self, identity: &str, group: &str) -> Self {
        self.memberships
            .entry(identity.to_lowercase())
            .or_default()
            .push(group.to_lowercase());
        self
    }
}

impl MembershipDirectory for StaticMembershipDirectory {
    fn is_member(&self, identity: &str, group: &str) -> bool {
        let group = group.to_lowercase();
        self.memberships
            .get(&identity.to_lowercase())
            .map(|groups| groups.contains(&group))
            .unwrap_or(false)
    }
}

/// Authorization policy configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Allowed groups, evaluated top-down; the first membership wins
    pub allowed_groups: Vec<Group>,
    /// Static membership table: identity -> group names
    #[serde(default)]
    pub memberships: BTreeMap<String, Vec<String>>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_groups: Group::ALL.to_vec(),
            memberships: BTreeMap::new(),
        }
    }
}

/// First-match group authorization
#[derive(Clone)]
pub struct AuthorizationResolver {
    allowed_groups: Vec<Group>,
    directory: Arc<dyn MembershipDirectory>,
}

impl AuthorizationResolver {
    pub fn new(allowed_groups: Vec<Group>, directory: Arc<dyn MembershipDirectory>) -> Self {
        Self {
            allowed_groups,
            directory,
        }
    }

    /// Resolve the group `identity` is authorized for
    pub fn resolve(&self, identity: &str) -> AuthorizationDecision {
        if identity.trim().is_empty() {
            warn!("Authorization denied: empty caller identity");
            return AuthorizationDecision::deny();
        }

        match self
            .allowed_groups
            .iter()
            .find(|group| self.directory.is_member(identity, group.as_str()))
        {
            Some(group) => {
                debug!("Authorized {} for group {}", identity, group);
                AuthorizationDecision::allow(*group)
            }
            None => {
                warn!("Authorization denied: {} is not a member of an allowed group", identity);
                AuthorizationDecision::deny()
            }
        }
    }
}
