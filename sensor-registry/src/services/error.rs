use chrono::{DateTime, Utc};
use service_core::error::AppError;
use thiserror::Error;

use crate::models::{EquipmentRef, MountNodeId};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid range: end {end} precedes begin {begin}")]
    InvalidRange {
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error(
        "Exactly one of public/internal/private must be set (public={public}, internal={internal}, private={private})"
    )]
    VisibilityConflict {
        public: bool,
        internal: bool,
        private: bool,
    },

    #[error("{equipment} is already mounted in configuration {configuration_id} (node {existing})")]
    ActiveMountConflict {
        equipment: EquipmentRef,
        configuration_id: i64,
        existing: MountNodeId,
    },

    #[error("Parent {parent} is not mounted in configuration {configuration_id} at {at}")]
    ParentNotMounted {
        parent: EquipmentRef,
        configuration_id: i64,
        at: DateTime<Utc>,
    },

    #[error("Mount node {0} is already unmounted")]
    AlreadyUnmounted(MountNodeId),

    #[error("Unmount at {end} precedes mount at {begin} for node {node}")]
    EndBeforeBegin {
        node: MountNodeId,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("{parent} still carries {count} mounted children after {at}")]
    ChildrenStillMounted {
        parent: EquipmentRef,
        count: usize,
        at: DateTime<Utc>,
    },

    #[error("Mount node not found: {0}")]
    NodeNotFound(MountNodeId),

    #[error("Identity service unavailable: {0}")]
    IdentityServiceUnavailable(String),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// True for the mount-timeline invariant violations.
    pub fn is_timeline_conflict(&self) -> bool {
        matches!(
            self,
            ServiceError::ActiveMountConflict { .. }
                | ServiceError::ParentNotMounted { .. }
                | ServiceError::AlreadyUnmounted(_)
                | ServiceError::EndBeforeBegin { .. }
                | ServiceError::ChildrenStillMounted { .. }
        )
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidRange { .. } => AppError::BadRequest(anyhow::anyhow!(err)),
            ServiceError::NodeNotFound(_) => AppError::NotFound(anyhow::anyhow!(err)),
            ServiceError::VisibilityConflict { .. }
            | ServiceError::ActiveMountConflict { .. }
            | ServiceError::ParentNotMounted { .. }
            | ServiceError::AlreadyUnmounted(_)
            | ServiceError::EndBeforeBegin { .. }
            | ServiceError::ChildrenStillMounted { .. } => {
                AppError::Conflict(anyhow::anyhow!(err))
            }
            ServiceError::IdentityServiceUnavailable(_) => AppError::ServiceUnavailable,
            ServiceError::Unauthenticated => AppError::Unauthorized(anyhow::anyhow!(err)),
            ServiceError::Forbidden(_) => AppError::Forbidden(anyhow::anyhow!(err)),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}
