//! Protectable resource snapshots - visibility, groups and ownership.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::services::ServiceError;

/// Kinds of records carrying visibility flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Device,
    Platform,
    Configuration,
    Site,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Device => "device",
            ResourceKind::Platform => "platform",
            ResourceKind::Configuration => "configuration",
            ResourceKind::Site => "site",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read visibility of a resource. Exactly one applies at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Internal,
    Private,
}

impl Visibility {
    /// Build from the three stored flags.
    ///
    /// Zero or several flags set is a conflict, never silently resolved.
    pub fn from_flags(public: bool, internal: bool, private: bool) -> Result<Self, ServiceError> {
        match (public, internal, private) {
            (true, false, false) => Ok(Visibility::Public),
            (false, true, false) => Ok(Visibility::Internal),
            (false, false, true) => Ok(Visibility::Private),
            _ => Err(ServiceError::VisibilityConflict {
                public,
                internal,
                private,
            }),
        }
    }

    /// `(public, internal, private)` flags as stored by the CRUD layer.
    pub fn flags(&self) -> (bool, bool, bool) {
        match self {
            Visibility::Public => (true, false, false),
            Visibility::Internal => (false, true, false),
            Visibility::Private => (false, false, true),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Internal => "internal",
            Visibility::Private => "private",
        }
    }
}

/// Point-in-time view of a resource's access-relevant attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub kind: ResourceKind,
    pub id: i64,
    visibility: Visibility,
    pub group_ids: BTreeSet<String>,
    pub owner_id: Option<String>,
    #[serde(default)]
    pub archived: bool,
}

impl ResourceSnapshot {
    /// Build a snapshot from stored flags, validating the visibility invariant.
    pub fn from_flags(
        kind: ResourceKind,
        id: i64,
        public: bool,
        internal: bool,
        private: bool,
        group_ids: BTreeSet<String>,
        owner_id: Option<String>,
    ) -> Result<Self, ServiceError> {
        let visibility = Visibility::from_flags(public, internal, private)?;
        Ok(Self::new(kind, id, visibility, group_ids, owner_id))
    }

    pub fn new(
        kind: ResourceKind,
        id: i64,
        visibility: Visibility,
        group_ids: BTreeSet<String>,
        owner_id: Option<String>,
    ) -> Self {
        Self {
            kind,
            id,
            visibility,
            group_ids,
            owner_id,
            archived: false,
        }
    }

    pub fn with_archived(mut self, archived: bool) -> Self {
        self.archived = archived;
        self
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn is_public(&self) -> bool {
        self.visibility == Visibility::Public
    }

    pub fn is_internal(&self) -> bool {
        self.visibility == Visibility::Internal
    }

    pub fn is_private(&self) -> bool {
        self.visibility == Visibility::Private
    }

    /// Apply a flag update, rejecting it if it breaks the one-flag invariant.
    pub fn update_visibility(
        &mut self,
        public: bool,
        internal: bool,
        private: bool,
    ) -> Result<(), ServiceError> {
        self.visibility = Visibility::from_flags(public, internal, private)?;
        Ok(())
    }

    pub fn is_owned_by(&self, subject: &str) -> bool {
        self.owner_id.as_deref() == Some(subject)
    }
}

impl fmt::Display for ResourceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_flag_required() {
        assert_eq!(
            Visibility::from_flags(true, false, false).unwrap(),
            Visibility::Public
        );
        assert_eq!(
            Visibility::from_flags(false, false, true).unwrap(),
            Visibility::Private
        );
        assert!(matches!(
            Visibility::from_flags(false, false, false),
            Err(ServiceError::VisibilityConflict { .. })
        ));
        assert!(matches!(
            Visibility::from_flags(true, true, false),
            Err(ServiceError::VisibilityConflict { .. })
        ));
        assert!(Visibility::from_flags(true, true, true).is_err());
    }

    #[test]
    fn test_failed_update_keeps_previous_visibility() {
        let mut snapshot = ResourceSnapshot::from_flags(
            ResourceKind::Device,
            1,
            false,
            true,
            false,
            BTreeSet::new(),
            Some("alice".to_string()),
        )
        .unwrap();

        assert!(snapshot.update_visibility(true, false, true).is_err());
        assert!(snapshot.is_internal());

        snapshot.update_visibility(false, false, true).unwrap();
        assert!(snapshot.is_private());
        assert_eq!(snapshot.visibility().flags(), (false, false, true));
    }

    #[test]
    fn test_display() {
        let snapshot = ResourceSnapshot::new(
            ResourceKind::Platform,
            7,
            Visibility::Public,
            BTreeSet::new(),
            None,
        );
        assert_eq!(snapshot.to_string(), "platform:7");
    }
}
