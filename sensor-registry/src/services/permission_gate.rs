//! Permission gate.
//!
//! The single place authorization decisions are made. Callers describe the
//! operation; the gate picks the matching policy check and reports why a
//! request was refused, so anonymous and under-privileged callers can be told
//! apart.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::instrument;

use super::metrics;
use super::mount_timeline::MountTimeline;
use super::visibility::{DenyReason, VisibilityPolicy, WriteIntent};
use super::ServiceError;
use crate::models::{
    EquipmentKind, EquipmentRef, MountNode, MountNodeId, MountRequest, Principal, ResourceKind,
    ResourceSnapshot,
};

/// Operations the gate can authorize.
#[derive(Debug, Clone)]
pub enum Operation<'a> {
    Read,
    List,
    Update(WriteIntent),
    Delete,
    /// Mount the resource (equipment) into `configuration`.
    Mount { configuration: &'a ResourceSnapshot },
    Unmount { configuration: &'a ResourceSnapshot },
}

impl Operation<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::List => "list",
            Operation::Update(WriteIntent::Edit) => "update",
            Operation::Update(WriteIntent::ChangeGroups(_)) => "change_groups",
            Operation::Delete => "delete",
            Operation::Mount { .. } => "mount",
            Operation::Unmount { .. } => "unmount",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn into_result(self) -> Result<(), ServiceError> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny(DenyReason::Unauthenticated) => Err(ServiceError::Unauthenticated),
            Decision::Deny(DenyReason::Forbidden(detail)) => Err(ServiceError::Forbidden(detail)),
        }
    }
}

impl From<Result<(), DenyReason>> for Decision {
    fn from(result: Result<(), DenyReason>) -> Self {
        match result {
            Ok(()) => Decision::Allow,
            Err(reason) => Decision::Deny(reason),
        }
    }
}

pub struct PermissionGate {
    timeline: Arc<MountTimeline>,
}

impl PermissionGate {
    pub fn new(timeline: Arc<MountTimeline>) -> Self {
        Self { timeline }
    }

    pub fn timeline(&self) -> &Arc<MountTimeline> {
        &self.timeline
    }

    /// Decide whether `principal` (or an anonymous caller) may perform
    /// `operation` on `resource`.
    ///
    /// Mounting and unmounting need write access to both the equipment and
    /// the configuration.
    #[instrument(
        skip(operation, resource, principal),
        fields(
            operation = operation.name(),
            resource = %resource,
            subject = principal.map(|p| p.subject.as_str()).unwrap_or("anonymous")
        )
    )]
    pub fn authorize(
        operation: &Operation<'_>,
        resource: &ResourceSnapshot,
        principal: Option<&Principal>,
    ) -> Decision {
        let result = match operation {
            Operation::Read | Operation::List => VisibilityPolicy::check_read(resource, principal),
            Operation::Update(intent) => VisibilityPolicy::check_write(resource, principal, intent),
            Operation::Delete => {
                VisibilityPolicy::check_write(resource, principal, &WriteIntent::Edit)
            }
            Operation::Mount { configuration } | Operation::Unmount { configuration } => {
                VisibilityPolicy::check_write(resource, principal, &WriteIntent::Edit).and_then(
                    |()| VisibilityPolicy::check_write(configuration, principal, &WriteIntent::Edit),
                )
            }
        };

        let decision = Decision::from(result);
        match &decision {
            Decision::Allow => {
                metrics::record_decision(operation.name(), "allow");
                tracing::debug!("Access granted");
            }
            Decision::Deny(reason) => {
                let label = match reason {
                    DenyReason::Unauthenticated => "unauthenticated",
                    DenyReason::Forbidden(_) => "forbidden",
                };
                metrics::record_decision(operation.name(), label);
                tracing::info!(reason = %reason, "Access denied");
            }
        }
        decision
    }

    /// Keep only the resources the caller may read.
    pub fn filter_readable<'r, I>(resources: I, principal: Option<&Principal>) -> Vec<&'r ResourceSnapshot>
    where
        I: IntoIterator<Item = &'r ResourceSnapshot>,
    {
        resources
            .into_iter()
            .filter(|resource| VisibilityPolicy::can_read(resource, principal))
            .collect()
    }

    /// Authorize, then record a mount.
    pub async fn mount(
        &self,
        principal: Option<&Principal>,
        equipment: &ResourceSnapshot,
        configuration: &ResourceSnapshot,
        mut request: MountRequest,
    ) -> Result<MountNode, ServiceError> {
        ensure_describes(equipment, &request.equipment)?;
        ensure_configuration(configuration, request.configuration_id)?;

        Self::authorize(&Operation::Mount { configuration }, equipment, principal).into_result()?;

        // The recorded contact is always the acting principal.
        if let Some(principal) = principal {
            request.contact_id = principal.subject.clone();
        }
        self.timeline.mount(request).await
    }

    /// Authorize, then record an unmount.
    pub async fn unmount(
        &self,
        principal: Option<&Principal>,
        equipment: &ResourceSnapshot,
        configuration: &ResourceSnapshot,
        node_id: MountNodeId,
        end: DateTime<Utc>,
        description: Option<String>,
    ) -> Result<MountNode, ServiceError> {
        Self::authorize(&Operation::Unmount { configuration }, equipment, principal)
            .into_result()?;

        let node = self.timeline.node(node_id).await?;
        ensure_describes(equipment, &node.equipment)?;
        ensure_configuration(configuration, node.configuration_id)?;

        // Authorized above, so a principal is present.
        let contact_id = principal.map(|p| p.subject.as_str()).unwrap_or_default();
        self.timeline
            .unmount(node_id, end, contact_id, description)
            .await
    }
}

fn ensure_describes(snapshot: &ResourceSnapshot, equipment: &EquipmentRef) -> Result<(), ServiceError> {
    let kind = match equipment.kind {
        EquipmentKind::Device => ResourceKind::Device,
        EquipmentKind::Platform => ResourceKind::Platform,
    };
    if snapshot.kind != kind || snapshot.id != equipment.id {
        return Err(ServiceError::Internal(anyhow::anyhow!(
            "Snapshot {} does not describe {}",
            snapshot,
            equipment
        )));
    }
    Ok(())
}

fn ensure_configuration(snapshot: &ResourceSnapshot, configuration_id: i64) -> Result<(), ServiceError> {
    if snapshot.kind != ResourceKind::Configuration || snapshot.id != configuration_id {
        return Err(ServiceError::Internal(anyhow::anyhow!(
            "Snapshot {} does not describe configuration {}",
            snapshot,
            configuration_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GroupMemberships, Visibility};
    use crate::services::visibility::GroupChange;
    use std::collections::BTreeSet;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn snapshot(kind: ResourceKind, visibility: Visibility, groups: &[&str]) -> ResourceSnapshot {
        ResourceSnapshot::new(kind, 1, visibility, set(groups), Some("owner".to_string()))
    }

    fn member(subject: &str, groups: &[&str]) -> Principal {
        Principal::new(
            subject,
            false,
            GroupMemberships {
                administrated_group_ids: BTreeSet::new(),
                membered_group_ids: set(groups),
            },
        )
    }

    #[test]
    fn test_read_and_list_use_visibility() {
        let internal = snapshot(ResourceKind::Device, Visibility::Internal, &[]);
        assert_eq!(
            PermissionGate::authorize(&Operation::Read, &internal, None),
            Decision::Deny(DenyReason::Unauthenticated)
        );
        assert!(PermissionGate::authorize(&Operation::List, &internal, Some(&member("x", &[]))).is_allowed());
    }

    #[test]
    fn test_mount_needs_write_on_both_sides() {
        let device = snapshot(ResourceKind::Device, Visibility::Public, &["dev"]);
        let configuration = snapshot(ResourceKind::Configuration, Visibility::Public, &["cfg"]);
        let op = Operation::Mount { configuration: &configuration };

        let only_device = member("a", &["dev"]);
        let only_cfg = member("b", &["cfg"]);
        let both = member("c", &["dev", "cfg"]);

        assert!(matches!(
            PermissionGate::authorize(&op, &device, Some(&only_device)),
            Decision::Deny(DenyReason::Forbidden(_))
        ));
        assert!(!PermissionGate::authorize(&op, &device, Some(&only_cfg)).is_allowed());
        assert!(PermissionGate::authorize(&op, &device, Some(&both)).is_allowed());
        assert_eq!(
            PermissionGate::authorize(&op, &device, None),
            Decision::Deny(DenyReason::Unauthenticated)
        );
    }

    #[test]
    fn test_group_removal_goes_through_update() {
        let res = snapshot(ResourceKind::Platform, Visibility::Public, &["g"]);
        let removal = Operation::Update(WriteIntent::ChangeGroups(GroupChange::between(
            &res.group_ids,
            &BTreeSet::new(),
        )));
        let principal = member("m", &["g"]);

        assert!(!PermissionGate::authorize(&removal, &res, Some(&principal)).is_allowed());
        assert!(PermissionGate::authorize(&Operation::Update(WriteIntent::Edit), &res, Some(&principal)).is_allowed());
        assert!(PermissionGate::authorize(&Operation::Delete, &res, Some(&principal)).is_allowed());
    }

    #[test]
    fn test_decision_into_result() {
        assert!(Decision::Allow.into_result().is_ok());
        assert!(matches!(
            Decision::Deny(DenyReason::Unauthenticated).into_result(),
            Err(ServiceError::Unauthenticated)
        ));
        assert!(matches!(
            Decision::Deny(DenyReason::Forbidden("no".to_string())).into_result(),
            Err(ServiceError::Forbidden(_))
        ));
    }

    #[test]
    fn test_filter_readable() {
        let public = snapshot(ResourceKind::Site, Visibility::Public, &[]);
        let internal = snapshot(ResourceKind::Site, Visibility::Internal, &[]);
        let private = snapshot(ResourceKind::Site, Visibility::Private, &[]);
        let all = vec![public, internal, private];

        assert_eq!(PermissionGate::filter_readable(&all, None).len(), 1);
        assert_eq!(PermissionGate::filter_readable(&all, Some(&member("x", &[]))).len(), 2);
        assert_eq!(PermissionGate::filter_readable(&all, Some(&member("owner", &[]))).len(), 3);
    }
}
