pub mod interval;
pub mod mount_node;
pub mod principal;
pub mod resource;

pub use interval::Interval;
pub use mount_node::{
    EquipmentKind, EquipmentRef, MountNode, MountNodeId, MountRequest, MountTreeNode, Offsets,
};
pub use principal::{GroupMemberships, Principal};
pub use resource::{ResourceKind, ResourceSnapshot, Visibility};
