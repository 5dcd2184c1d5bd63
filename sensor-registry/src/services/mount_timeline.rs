//! Mount timeline.
//!
//! Records mount and unmount actions as [`MountNode`]s. Nodes reference their
//! parent by id, so the configuration tree at any instant is derived from the
//! node history instead of being stored.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::instrument;

use super::metrics;
use super::timeline_store::TimelineStore;
use super::ServiceError;
use crate::models::{
    EquipmentRef, Interval, MountNode, MountNodeId, MountRequest, MountTreeNode,
};

/// Guards held for one mutation. Dropping them also removes lock entries no
/// other caller holds, so the lock map only tracks items under contention.
struct EquipmentLocks<'a> {
    locks: &'a DashMap<EquipmentRef, Arc<Mutex<()>>>,
    held: Vec<(EquipmentRef, OwnedMutexGuard<()>)>,
}

impl Drop for EquipmentLocks<'_> {
    fn drop(&mut self) {
        for (key, guard) in self.held.drain(..) {
            drop(guard);
            self.locks
                .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

/// Mount/unmount history for all equipment.
///
/// Mutations touching the same equipment item are serialized through a
/// per-item lock; unrelated items proceed in parallel. A mount under a parent
/// also takes the parent's lock so the parent cannot be unmounted meanwhile.
pub struct MountTimeline {
    store: Arc<dyn TimelineStore>,
    locks: DashMap<EquipmentRef, Arc<Mutex<()>>>,
}

impl MountTimeline {
    pub fn new(store: Arc<dyn TimelineStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    /// Acquire the locks of `keys` in a global order to rule out deadlocks.
    async fn lock_all(&self, mut keys: Vec<EquipmentRef>) -> EquipmentLocks<'_> {
        keys.sort();
        keys.dedup();
        let mut guards = EquipmentLocks {
            locks: &self.locks,
            held: Vec::with_capacity(keys.len()),
        };
        for key in keys {
            let lock = self.locks.entry(key).or_default().clone();
            guards.held.push((key, lock.lock_owned().await));
        }
        guards
    }

    /// Record a mount action.
    #[instrument(
        skip(self, request),
        fields(
            equipment = %request.equipment,
            configuration_id = request.configuration_id,
            begin = %request.begin
        )
    )]
    pub async fn mount(&self, request: MountRequest) -> Result<MountNode, ServiceError> {
        let mut keys = vec![request.equipment];
        keys.extend(request.parent_id);
        let _guards = self.lock_all(keys).await;

        let result = self.mount_locked(request).await;
        metrics::record_mount_action("mount", if result.is_ok() { "ok" } else { "rejected" });
        result
    }

    async fn mount_locked(&self, request: MountRequest) -> Result<MountNode, ServiceError> {
        let interval = Interval::open(request.begin);

        let history = self.store.nodes_for(&request.equipment).await?;
        if let Some(existing) = history.iter().find(|node| {
            node.configuration_id == request.configuration_id && node.interval.overlaps(&interval)
        }) {
            tracing::warn!(existing = %existing.id, "Equipment already mounted");
            return Err(ServiceError::ActiveMountConflict {
                equipment: request.equipment,
                configuration_id: request.configuration_id,
                existing: existing.id,
            });
        }

        let parent_node_id = match request.parent_id {
            Some(parent) => Some(
                self.covering_parent_node(&request.equipment, &parent, request.configuration_id, request.begin)
                    .await?,
            ),
            None => None,
        };

        let node = MountNode {
            id: MountNodeId::new(),
            equipment: request.equipment,
            configuration_id: request.configuration_id,
            parent_id: request.parent_id,
            parent_node_id,
            offsets: request.offsets,
            interval,
            begin_contact_id: request.contact_id,
            end_contact_id: None,
            begin_description: request.description,
            end_description: None,
        };

        self.store.insert(node.clone()).await?;

        tracing::info!(node_id = %node.id, parent = ?node.parent_id, "Equipment mounted");
        Ok(node)
    }

    /// Find the parent's open node in `configuration_id` whose interval covers
    /// `at`.
    ///
    /// Only platforms carry children, and nothing is its own parent. A child is
    /// opened without an end, so a parent that has already been unmounted
    /// cannot carry it even if the parent covered `at`.
    async fn covering_parent_node(
        &self,
        child: &EquipmentRef,
        parent: &EquipmentRef,
        configuration_id: i64,
        at: DateTime<Utc>,
    ) -> Result<MountNodeId, ServiceError> {
        let not_mounted = || ServiceError::ParentNotMounted {
            parent: *parent,
            configuration_id,
            at,
        };

        if parent == child || !parent.is_platform() {
            return Err(not_mounted());
        }

        self.store
            .nodes_for(parent)
            .await?
            .into_iter()
            .find(|node| {
                node.configuration_id == configuration_id
                    && node.interval.is_open()
                    && node.interval.covers(at)
            })
            .map(|node| node.id)
            .ok_or_else(not_mounted)
    }

    /// Record an unmount action, closing the node at `end`.
    #[instrument(skip(self, contact_id, description), fields(node_id = %node_id, end = %end))]
    pub async fn unmount(
        &self,
        node_id: MountNodeId,
        end: DateTime<Utc>,
        contact_id: &str,
        description: Option<String>,
    ) -> Result<MountNode, ServiceError> {
        let equipment = self
            .store
            .get(node_id)
            .await?
            .ok_or(ServiceError::NodeNotFound(node_id))?
            .equipment;
        let _guards = self.lock_all(vec![equipment]).await;

        let result = self.unmount_locked(node_id, end, contact_id, description).await;
        metrics::record_mount_action("unmount", if result.is_ok() { "ok" } else { "rejected" });
        result
    }

    async fn unmount_locked(
        &self,
        node_id: MountNodeId,
        end: DateTime<Utc>,
        contact_id: &str,
        description: Option<String>,
    ) -> Result<MountNode, ServiceError> {
        // Re-read under the lock; a concurrent unmount may have won.
        let node = self
            .store
            .get(node_id)
            .await?
            .ok_or(ServiceError::NodeNotFound(node_id))?;

        if !node.is_open() {
            return Err(ServiceError::AlreadyUnmounted(node_id));
        }

        let begin = node.interval.begin();
        if end < begin {
            return Err(ServiceError::EndBeforeBegin {
                node: node_id,
                begin,
                end,
            });
        }

        if node.equipment.is_platform() {
            let remaining = self
                .store
                .nodes_in_configuration(node.configuration_id)
                .await?
                .into_iter()
                .filter(|child| child.parent_node_id == Some(node_id))
                .filter(|child| child.interval.end().is_none_or(|child_end| child_end > end))
                .count();
            if remaining > 0 {
                return Err(ServiceError::ChildrenStillMounted {
                    parent: node.equipment,
                    count: remaining,
                    at: end,
                });
            }
        }

        let closed = MountNode {
            interval: Interval::new(begin, Some(end))?,
            end_contact_id: Some(contact_id.to_string()),
            end_description: description,
            ..node
        };
        self.store.replace(closed.clone()).await?;

        tracing::info!(equipment = %closed.equipment, "Equipment unmounted");
        Ok(closed)
    }

    /// Move a mounted item under a different parent at `at`.
    ///
    /// Recorded as an unmount of the current node followed by a new mount
    /// with the same configuration and offsets, so history is preserved.
    /// Returns `(closed, reopened)`.
    #[instrument(skip(self, contact_id), fields(node_id = %node_id, at = %at))]
    pub async fn reparent(
        &self,
        node_id: MountNodeId,
        new_parent: Option<EquipmentRef>,
        at: DateTime<Utc>,
        contact_id: &str,
    ) -> Result<(MountNode, MountNode), ServiceError> {
        let current = self
            .store
            .get(node_id)
            .await?
            .ok_or(ServiceError::NodeNotFound(node_id))?;

        let mut keys = vec![current.equipment];
        keys.extend(new_parent);
        let _guards = self.lock_all(keys).await;

        // Validate the target before closing anything.
        if let Some(parent) = new_parent {
            self.covering_parent_node(&current.equipment, &parent, current.configuration_id, at)
                .await?;
        }

        let closed = self.unmount_locked(node_id, at, contact_id, None).await?;
        let request = MountRequest {
            equipment: closed.equipment,
            configuration_id: closed.configuration_id,
            parent_id: new_parent,
            offsets: closed.offsets,
            begin: at,
            contact_id: contact_id.to_string(),
            description: None,
        };
        let reopened = self.mount_locked(request).await?;
        metrics::record_mount_action("reparent", "ok");

        Ok((closed, reopened))
    }

    /// Full mount history of one item, ordered by begin.
    pub async fn nodes_for(&self, equipment: &EquipmentRef) -> Result<Vec<MountNode>, ServiceError> {
        Ok(self.store.nodes_for(equipment).await?)
    }

    pub async fn node(&self, node_id: MountNodeId) -> Result<MountNode, ServiceError> {
        self.store
            .get(node_id)
            .await?
            .ok_or(ServiceError::NodeNotFound(node_id))
    }

    /// Nodes mounted directly under `parent` in a configuration at `at`.
    pub async fn children_of(
        &self,
        configuration_id: i64,
        parent: &EquipmentRef,
        at: DateTime<Utc>,
    ) -> Result<Vec<MountNode>, ServiceError> {
        Ok(self
            .store
            .nodes_in_configuration(configuration_id)
            .await?
            .into_iter()
            .filter(|node| node.parent_id.as_ref() == Some(parent) && node.is_mounted_at(at))
            .collect())
    }

    /// The mounted tree of a configuration at `at`.
    pub async fn tree_at(
        &self,
        configuration_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Vec<MountTreeNode>, ServiceError> {
        let mounted: Vec<MountNode> = self
            .store
            .nodes_in_configuration(configuration_id)
            .await?
            .into_iter()
            .filter(|node| node.is_mounted_at(at))
            .collect();

        let mounted_ids: Vec<MountNodeId> = mounted.iter().map(|node| node.id).collect();
        let mut children: HashMap<MountNodeId, Vec<MountNode>> = HashMap::new();
        let mut roots = Vec::new();
        for node in mounted {
            match node.parent_node_id {
                Some(parent) if mounted_ids.contains(&parent) => {
                    children.entry(parent).or_default().push(node)
                }
                _ => roots.push(node),
            }
        }

        Ok(roots
            .into_iter()
            .map(|root| build_tree(root, &mut children))
            .collect())
    }
}

fn build_tree(node: MountNode, children: &mut HashMap<MountNodeId, Vec<MountNode>>) -> MountTreeNode {
    let kids = children.remove(&node.id).unwrap_or_default();
    MountTreeNode {
        children: kids
            .into_iter()
            .map(|child| build_tree(child, children))
            .collect(),
        node,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::timeline_store::InMemoryTimelineStore;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, day, 0, 0, 0).unwrap()
    }

    fn timeline() -> MountTimeline {
        MountTimeline::new(Arc::new(InMemoryTimelineStore::new()))
    }

    #[tokio::test]
    async fn test_double_mount_conflicts() {
        let timeline = timeline();
        let device = EquipmentRef::device(1);

        timeline
            .mount(MountRequest::new(device, 10, at(1), "c1"))
            .await
            .unwrap();
        let second = timeline.mount(MountRequest::new(device, 10, at(5), "c1")).await;

        assert!(matches!(
            second,
            Err(ServiceError::ActiveMountConflict { configuration_id: 10, .. })
        ));
    }

    #[tokio::test]
    async fn test_mount_in_other_configuration_is_independent() {
        let timeline = timeline();
        let device = EquipmentRef::device(1);

        timeline.mount(MountRequest::new(device, 10, at(1), "c1")).await.unwrap();
        assert!(timeline.mount(MountRequest::new(device, 11, at(2), "c1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_remount_after_unmount_at_same_instant() {
        let timeline = timeline();
        let device = EquipmentRef::device(1);

        let first = timeline.mount(MountRequest::new(device, 10, at(1), "c1")).await.unwrap();
        timeline.unmount(first.id, at(5), "c2", None).await.unwrap();
        let second = timeline.mount(MountRequest::new(device, 10, at(5), "c1")).await.unwrap();

        let history = timeline.nodes_for(&device).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, first.id);
        assert_eq!(history[1].id, second.id);
        assert_eq!(history[0].end_contact_id.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn test_backdated_mount_overlapping_closed_node_conflicts() {
        let timeline = timeline();
        let device = EquipmentRef::device(1);

        let node = timeline.mount(MountRequest::new(device, 10, at(10), "c1")).await.unwrap();
        timeline.unmount(node.id, at(20), "c1", None).await.unwrap();

        let backdated = timeline.mount(MountRequest::new(device, 10, at(5), "c1")).await;
        assert!(matches!(backdated, Err(ServiceError::ActiveMountConflict { .. })));
    }

    #[tokio::test]
    async fn test_unmount_rules() {
        let timeline = timeline();
        let device = EquipmentRef::device(1);
        let node = timeline.mount(MountRequest::new(device, 10, at(5), "c1")).await.unwrap();

        assert!(matches!(
            timeline.unmount(node.id, at(4), "c1", None).await,
            Err(ServiceError::EndBeforeBegin { .. })
        ));

        let closed = timeline
            .unmount(node.id, at(6), "c1", Some("done".to_string()))
            .await
            .unwrap();
        assert_eq!(closed.interval.end(), Some(at(6)));
        assert_eq!(closed.end_description.as_deref(), Some("done"));

        assert!(matches!(
            timeline.unmount(node.id, at(7), "c1", None).await,
            Err(ServiceError::AlreadyUnmounted(_))
        ));
        assert!(matches!(
            timeline.unmount(MountNodeId::new(), at(7), "c1", None).await,
            Err(ServiceError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_parent_must_cover_child_begin() {
        let timeline = timeline();
        let platform = EquipmentRef::platform(100);
        let device = EquipmentRef::device(1);

        let orphan = timeline
            .mount(MountRequest::new(device, 10, at(2), "c1").under(platform))
            .await;
        assert!(matches!(orphan, Err(ServiceError::ParentNotMounted { .. })));

        let parent = timeline.mount(MountRequest::new(platform, 10, at(3), "c1")).await.unwrap();
        let too_early = timeline
            .mount(MountRequest::new(device, 10, at(2), "c1").under(platform))
            .await;
        assert!(matches!(too_early, Err(ServiceError::ParentNotMounted { .. })));

        let child = timeline
            .mount(MountRequest::new(device, 10, at(4), "c1").under(platform))
            .await
            .unwrap();
        assert_eq!(child.parent_node_id, Some(parent.id));

        // Parent mounted elsewhere does not count
        let other_cfg = timeline
            .mount(MountRequest::new(EquipmentRef::device(2), 11, at(4), "c1").under(platform))
            .await;
        assert!(matches!(other_cfg, Err(ServiceError::ParentNotMounted { .. })));
    }

    #[tokio::test]
    async fn test_backdated_child_under_closed_parent_is_rejected() {
        let timeline = timeline();
        let platform = EquipmentRef::platform(100);
        let device = EquipmentRef::device(1);

        let parent = timeline.mount(MountRequest::new(platform, 10, at(1), "c1")).await.unwrap();
        timeline.unmount(parent.id, at(10), "c1", None).await.unwrap();

        let backdated = timeline
            .mount(MountRequest::new(device, 10, at(5), "c1").under(platform))
            .await;
        assert!(matches!(backdated, Err(ServiceError::ParentNotMounted { .. })));
        assert!(timeline.nodes_for(&device).await.unwrap().is_empty());
        assert!(timeline.tree_at(10, at(12)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idle_equipment_locks_are_released() {
        let timeline = timeline();
        let platform = EquipmentRef::platform(100);

        let parent = timeline.mount(MountRequest::new(platform, 10, at(1), "c1")).await.unwrap();
        for id in 0..5 {
            let child = timeline
                .mount(MountRequest::new(EquipmentRef::device(id), 10, at(2), "c1").under(platform))
                .await
                .unwrap();
            timeline.unmount(child.id, at(3), "c1", None).await.unwrap();
        }
        let rejected = timeline.mount(MountRequest::new(platform, 10, at(4), "c1")).await;
        assert!(rejected.is_err());
        timeline.unmount(parent.id, at(5), "c1", None).await.unwrap();

        assert!(timeline.locks.is_empty());
    }

    #[tokio::test]
    async fn test_devices_and_self_are_not_parents() {
        let timeline = timeline();
        let device = EquipmentRef::device(1);
        let platform = EquipmentRef::platform(1);

        timeline.mount(MountRequest::new(device, 10, at(1), "c1")).await.unwrap();
        let under_device = timeline
            .mount(MountRequest::new(EquipmentRef::device(2), 10, at(2), "c1").under(device))
            .await;
        assert!(matches!(under_device, Err(ServiceError::ParentNotMounted { .. })));

        let under_self = timeline
            .mount(MountRequest::new(platform, 10, at(2), "c1").under(platform))
            .await;
        assert!(matches!(under_self, Err(ServiceError::ParentNotMounted { .. })));
    }

    #[tokio::test]
    async fn test_parent_cannot_leave_mounted_children() {
        let timeline = timeline();
        let platform = EquipmentRef::platform(100);
        let device = EquipmentRef::device(1);

        let parent = timeline.mount(MountRequest::new(platform, 10, at(1), "c1")).await.unwrap();
        let child = timeline
            .mount(MountRequest::new(device, 10, at(2), "c1").under(platform))
            .await
            .unwrap();

        assert!(matches!(
            timeline.unmount(parent.id, at(5), "c1", None).await,
            Err(ServiceError::ChildrenStillMounted { count: 1, .. })
        ));

        timeline.unmount(child.id, at(5), "c1", None).await.unwrap();
        assert!(timeline.unmount(parent.id, at(5), "c1", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_reparent_preserves_history() {
        let timeline = timeline();
        let p1 = EquipmentRef::platform(100);
        let p2 = EquipmentRef::platform(200);
        let device = EquipmentRef::device(1);

        timeline.mount(MountRequest::new(p1, 10, at(1), "c1")).await.unwrap();
        let p2_node = timeline.mount(MountRequest::new(p2, 10, at(1), "c1")).await.unwrap();
        let node = timeline
            .mount(
                MountRequest::new(device, 10, at(2), "c1")
                    .under(p1)
                    .with_offsets(crate::models::Offsets::new(1.0, 2.0, 3.0)),
            )
            .await
            .unwrap();

        let (closed, reopened) = timeline.reparent(node.id, Some(p2), at(6), "c2").await.unwrap();
        assert_eq!(closed.interval.end(), Some(at(6)));
        assert_eq!(reopened.interval.begin(), at(6));
        assert_eq!(reopened.parent_id, Some(p2));
        assert_eq!(reopened.parent_node_id, Some(p2_node.id));
        assert_eq!(reopened.offsets, closed.offsets);

        assert_eq!(timeline.nodes_for(&device).await.unwrap().len(), 2);
        assert_eq!(timeline.children_of(10, &p1, at(7)).await.unwrap().len(), 0);
        assert_eq!(timeline.children_of(10, &p2, at(7)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reparent_to_unmounted_parent_changes_nothing() {
        let timeline = timeline();
        let device = EquipmentRef::device(1);
        let node = timeline.mount(MountRequest::new(device, 10, at(1), "c1")).await.unwrap();

        let result = timeline
            .reparent(node.id, Some(EquipmentRef::platform(9)), at(3), "c1")
            .await;
        assert!(matches!(result, Err(ServiceError::ParentNotMounted { .. })));
        assert!(timeline.node(node.id).await.unwrap().is_open());
    }

    #[tokio::test]
    async fn test_tree_at_instant() {
        let timeline = timeline();
        let platform = EquipmentRef::platform(100);

        timeline.mount(MountRequest::new(platform, 10, at(1), "c1")).await.unwrap();
        timeline
            .mount(MountRequest::new(EquipmentRef::device(1), 10, at(2), "c1").under(platform))
            .await
            .unwrap();
        timeline
            .mount(MountRequest::new(EquipmentRef::device(2), 10, at(3), "c1"))
            .await
            .unwrap();

        let tree = timeline.tree_at(10, at(4)).await.unwrap();
        assert_eq!(tree.len(), 2);
        let platform_root = tree
            .iter()
            .find(|root| root.node.equipment == platform)
            .unwrap();
        assert_eq!(platform_root.children.len(), 1);

        let early = timeline.tree_at(10, at(2)).await.unwrap();
        assert_eq!(early.len(), 1);
        assert_eq!(early[0].children.len(), 1);
    }
}
