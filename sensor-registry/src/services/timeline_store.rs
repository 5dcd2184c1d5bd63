use async_trait::async_trait;
use dashmap::DashMap;

use crate::models::{EquipmentRef, MountNode, MountNodeId};

/// Storage for mount nodes.
///
/// The relational store lives in the surrounding CRUD layer; the timeline only
/// needs these operations. Invariants are enforced by `MountTimeline`, not by
/// implementations of this trait.
#[async_trait]
pub trait TimelineStore: Send + Sync {
    /// Full history of one equipment item, ordered by begin ascending.
    async fn nodes_for(&self, equipment: &EquipmentRef) -> Result<Vec<MountNode>, anyhow::Error>;

    /// Every node recorded in a configuration, ordered by begin ascending.
    async fn nodes_in_configuration(
        &self,
        configuration_id: i64,
    ) -> Result<Vec<MountNode>, anyhow::Error>;

    async fn get(&self, id: MountNodeId) -> Result<Option<MountNode>, anyhow::Error>;

    async fn insert(&self, node: MountNode) -> Result<(), anyhow::Error>;

    /// Overwrite an existing node (used to record its unmount).
    async fn replace(&self, node: MountNode) -> Result<(), anyhow::Error>;
}

/// Process-local store, used by tests and single-instance deployments.
#[derive(Default)]
pub struct InMemoryTimelineStore {
    nodes: DashMap<MountNodeId, MountNode>,
    by_equipment: DashMap<EquipmentRef, Vec<MountNodeId>>,
    by_configuration: DashMap<i64, Vec<MountNodeId>>,
}

impl InMemoryTimelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(&self, ids: Vec<MountNodeId>) -> Vec<MountNode> {
        let mut nodes: Vec<MountNode> = ids
            .into_iter()
            .filter_map(|id| self.nodes.get(&id).map(|node| node.clone()))
            .collect();
        nodes.sort_by_key(|node| node.interval.begin());
        nodes
    }
}

#[async_trait]
impl TimelineStore for InMemoryTimelineStore {
    async fn nodes_for(&self, equipment: &EquipmentRef) -> Result<Vec<MountNode>, anyhow::Error> {
        let ids = self
            .by_equipment
            .get(equipment)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        Ok(self.collect(ids))
    }

    async fn nodes_in_configuration(
        &self,
        configuration_id: i64,
    ) -> Result<Vec<MountNode>, anyhow::Error> {
        let ids = self
            .by_configuration
            .get(&configuration_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        Ok(self.collect(ids))
    }

    async fn get(&self, id: MountNodeId) -> Result<Option<MountNode>, anyhow::Error> {
        Ok(self.nodes.get(&id).map(|node| node.clone()))
    }

    async fn insert(&self, node: MountNode) -> Result<(), anyhow::Error> {
        if self.nodes.contains_key(&node.id) {
            return Err(anyhow::anyhow!("Mount node {} already stored", node.id));
        }
        let (id, equipment, configuration_id) = (node.id, node.equipment, node.configuration_id);
        self.nodes.insert(id, node);
        self.by_equipment.entry(equipment).or_default().push(id);
        self.by_configuration
            .entry(configuration_id)
            .or_default()
            .push(id);
        Ok(())
    }

    async fn replace(&self, node: MountNode) -> Result<(), anyhow::Error> {
        match self.nodes.get_mut(&node.id) {
            Some(mut existing) => {
                *existing = node;
                Ok(())
            }
            None => Err(anyhow::anyhow!("Mount node {} not stored", node.id)),
        }
    }
}
