//! Principal model - the authenticated actor behind an operation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::services::{MembershipCache, ServiceError};

/// Group memberships reported by the identity service for one subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMemberships {
    #[serde(default, rename = "administrated")]
    pub administrated_group_ids: BTreeSet<String>,
    #[serde(default, rename = "membered")]
    pub membered_group_ids: BTreeSet<String>,
}

impl GroupMemberships {
    /// Memberships of a subject the identity service does not know.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.administrated_group_ids.is_empty() && self.membered_group_ids.is_empty()
    }
}

/// Authenticated principal.
///
/// Built by the API layer from a verified token plus a membership lookup and
/// passed into the core by value; the core never mutates it. Anonymous
/// callers are modeled as `None` wherever an `Option<&Principal>` is taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
    pub is_superuser: bool,
    pub administrated_group_ids: BTreeSet<String>,
    pub membered_group_ids: BTreeSet<String>,
}

impl Principal {
    pub fn new(subject: impl Into<String>, is_superuser: bool, groups: GroupMemberships) -> Self {
        Self {
            subject: subject.into(),
            is_superuser,
            administrated_group_ids: groups.administrated_group_ids,
            membered_group_ids: groups.membered_group_ids,
        }
    }

    /// Build a principal from verified token claims plus the subject's
    /// current memberships.
    pub async fn resolve(
        subject: &str,
        is_superuser: bool,
        cache: &MembershipCache,
        force_refresh: bool,
    ) -> Result<Self, ServiceError> {
        cache.resolve_principal(subject, is_superuser, force_refresh).await
    }

    /// Principal with no group memberships.
    pub fn without_groups(subject: impl Into<String>) -> Self {
        Self::new(subject, false, GroupMemberships::empty())
    }

    pub fn is_admin_of(&self, group_id: &str) -> bool {
        self.administrated_group_ids.contains(group_id)
    }

    /// Admins count as members.
    pub fn is_member_of(&self, group_id: &str) -> bool {
        self.membered_group_ids.contains(group_id) || self.is_admin_of(group_id)
    }

    /// True if the principal is member or admin of any of `group_ids`.
    pub fn in_any_group<'a, I>(&self, group_ids: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        group_ids.into_iter().any(|group| self.is_member_of(group))
    }
}
