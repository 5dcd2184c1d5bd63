//! Services layer for sensor-registry.
//!
//! Membership lookups, visibility rules, the mount timeline and the
//! permission gate composing them.

mod availability;
pub mod error;
mod identity;
mod membership_cache;
pub mod metrics;
mod mount_timeline;
mod permission_gate;
mod timeline_store;
mod visibility;

pub use availability::{Availability, AvailabilityIter, AvailabilityResolver, AvailabilitySegment};
pub use error::ServiceError;
pub use identity::{HttpIdentityClient, IdentityError, IdentityProvider, MockIdentityProvider};
pub use membership_cache::{MembershipCache, MembershipResult};
pub use metrics::{get_metrics, init_metrics};
pub use mount_timeline::MountTimeline;
pub use permission_gate::{Decision, Operation, PermissionGate};
pub use timeline_store::{InMemoryTimelineStore, TimelineStore};
pub use visibility::{DenyReason, GroupChange, VisibilityPolicy, WriteIntent};
