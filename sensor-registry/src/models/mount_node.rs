//! Mount node model - one equipment item's occupancy of a configuration slot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::Interval;

/// Arena-style identifier of a mount node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MountNodeId(pub Uuid);

impl MountNodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MountNodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MountNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kinds of equipment that can be mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquipmentKind {
    Device,
    Platform,
}

/// Typed reference to a device or platform record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EquipmentRef {
    pub kind: EquipmentKind,
    pub id: i64,
}

impl EquipmentRef {
    pub fn device(id: i64) -> Self {
        Self {
            kind: EquipmentKind::Device,
            id,
        }
    }

    pub fn platform(id: i64) -> Self {
        Self {
            kind: EquipmentKind::Platform,
            id,
        }
    }

    pub fn is_platform(&self) -> bool {
        self.kind == EquipmentKind::Platform
    }
}

impl fmt::Display for EquipmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EquipmentKind::Device => write!(f, "device:{}", self.id),
            EquipmentKind::Platform => write!(f, "platform:{}", self.id),
        }
    }
}

/// Positional offsets relative to the parent (or configuration origin).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Offsets {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Offsets {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Mount node entity.
///
/// Created by a mount action and closed exactly once by the matching unmount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountNode {
    pub id: MountNodeId,
    pub equipment: EquipmentRef,
    pub configuration_id: i64,
    /// Parent platform; `None` means the configuration root.
    pub parent_id: Option<EquipmentRef>,
    /// The parent's node that covered this node's begin when it was mounted.
    pub parent_node_id: Option<MountNodeId>,
    pub offsets: Offsets,
    pub interval: Interval,
    pub begin_contact_id: String,
    pub end_contact_id: Option<String>,
    pub begin_description: Option<String>,
    pub end_description: Option<String>,
}

impl MountNode {
    pub fn is_open(&self) -> bool {
        self.interval.is_open()
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Whether the node is mounted at `instant`.
    pub fn is_mounted_at(&self, instant: DateTime<Utc>) -> bool {
        self.interval.covers(instant)
    }
}

/// Request to record a mount action.
#[derive(Debug, Clone, Deserialize)]
pub struct MountRequest {
    pub equipment: EquipmentRef,
    pub configuration_id: i64,
    pub parent_id: Option<EquipmentRef>,
    #[serde(default)]
    pub offsets: Offsets,
    pub begin: DateTime<Utc>,
    pub contact_id: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl MountRequest {
    pub fn new(
        equipment: EquipmentRef,
        configuration_id: i64,
        begin: DateTime<Utc>,
        contact_id: impl Into<String>,
    ) -> Self {
        Self {
            equipment,
            configuration_id,
            parent_id: None,
            offsets: Offsets::default(),
            begin,
            contact_id: contact_id.into(),
            description: None,
        }
    }

    pub fn under(mut self, parent: EquipmentRef) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn with_offsets(mut self, offsets: Offsets) -> Self {
        self.offsets = offsets;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Tree node with children for a mounted-tree snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MountTreeNode {
    #[serde(flatten)]
    pub node: MountNode,
    pub children: Vec<MountTreeNode>,
}
