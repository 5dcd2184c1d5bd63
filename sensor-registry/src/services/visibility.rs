//! Visibility policy.
//!
//! Read and write decisions as pure functions of a resource snapshot and a
//! principal snapshot. No lookups happen here; memberships are already
//! resolved on the principal.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::models::{Principal, ResourceSnapshot, Visibility};

/// Why an operation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DenyReason {
    /// No principal was presented.
    Unauthenticated,
    /// Authenticated, but without sufficient rights.
    Forbidden(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Unauthenticated => f.write_str("authentication required"),
            DenyReason::Forbidden(detail) => write!(f, "forbidden: {}", detail),
        }
    }
}

/// Change to a resource's permission groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupChange {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl GroupChange {
    /// Diff between the current and the requested group set.
    pub fn between(current: &BTreeSet<String>, requested: &BTreeSet<String>) -> Self {
        Self {
            added: requested.difference(current).cloned().collect(),
            removed: current.difference(requested).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// What a write does to the resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WriteIntent {
    /// Any edit that leaves `group_ids` untouched.
    #[default]
    Edit,
    /// Edit that adds and/or removes permission groups.
    ChangeGroups(GroupChange),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VisibilityPolicy;

impl VisibilityPolicy {
    pub fn can_read(resource: &ResourceSnapshot, principal: Option<&Principal>) -> bool {
        Self::check_read(resource, principal).is_ok()
    }

    pub fn can_write(
        resource: &ResourceSnapshot,
        principal: Option<&Principal>,
        intent: &WriteIntent,
    ) -> bool {
        Self::check_write(resource, principal, intent).is_ok()
    }

    /// Read check with the reason for a refusal.
    pub fn check_read(
        resource: &ResourceSnapshot,
        principal: Option<&Principal>,
    ) -> Result<(), DenyReason> {
        if resource.visibility() == Visibility::Public {
            return Ok(());
        }

        let principal = principal.ok_or(DenyReason::Unauthenticated)?;

        match resource.visibility() {
            Visibility::Public | Visibility::Internal => Ok(()),
            Visibility::Private => {
                if principal.is_superuser
                    || resource.owner_id.is_none()
                    || resource.is_owned_by(&principal.subject)
                {
                    Ok(())
                } else {
                    Err(DenyReason::Forbidden(format!(
                        "{} is private to its owner",
                        resource
                    )))
                }
            }
        }
    }

    /// Write check with the reason for a refusal.
    ///
    /// Internal visibility never grants write access by itself: with no
    /// groups only the owner or a superuser may write.
    pub fn check_write(
        resource: &ResourceSnapshot,
        principal: Option<&Principal>,
        intent: &WriteIntent,
    ) -> Result<(), DenyReason> {
        let principal = principal.ok_or(DenyReason::Unauthenticated)?;

        if principal.is_superuser {
            return Ok(());
        }

        let is_owner = resource.is_owned_by(&principal.subject);
        if !is_owner && !principal.in_any_group(&resource.group_ids) {
            return Err(DenyReason::Forbidden(format!(
                "{} is not owner or in a permission group of {}",
                principal.subject, resource
            )));
        }

        if resource.archived
            && !resource
                .group_ids
                .iter()
                .any(|group| principal.is_admin_of(group))
        {
            return Err(DenyReason::Forbidden(format!(
                "{} is archived; only group admins may change it",
                resource
            )));
        }

        if let WriteIntent::ChangeGroups(change) = intent {
            if let Some(group) = change
                .removed
                .iter()
                .find(|group| !principal.is_admin_of(group))
            {
                return Err(DenyReason::Forbidden(format!(
                    "removing group {} from {} requires admin rights in that group",
                    group, resource
                )));
            }

            if let Some(group) = change
                .added
                .iter()
                .find(|group| !principal.is_member_of(group))
            {
                return Err(DenyReason::Forbidden(format!(
                    "adding group {} to {} requires membership in that group",
                    group, resource
                )));
            }
        }

        Ok(())
    }
}
