//! Component wiring and lifecycle.

use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::sync::Arc;

use crate::config::{MembershipCacheConfig, RegistryConfig};
use crate::services::{
    init_metrics, AvailabilityResolver, HttpIdentityClient, IdentityProvider,
    InMemoryTimelineStore, MembershipCache, MountTimeline, PermissionGate, TimelineStore,
};

/// Shared state handed to whatever serves requests.
///
/// One instance per process; every component is constructed here and shared
/// by `Arc`, never through module-level state.
#[derive(Clone)]
pub struct RegistryCore {
    pub membership_cache: Arc<MembershipCache>,
    pub timeline: Arc<MountTimeline>,
    pub availability: Arc<AvailabilityResolver>,
    pub gate: Arc<PermissionGate>,
}

impl RegistryCore {
    /// Assemble the core from already-built adapters.
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn TimelineStore>,
        cache_config: &MembershipCacheConfig,
    ) -> Self {
        let membership_cache = Arc::new(MembershipCache::with_config(provider, cache_config));
        let timeline = Arc::new(MountTimeline::new(store));
        let availability = Arc::new(AvailabilityResolver::new(timeline.clone()));
        let gate = Arc::new(PermissionGate::new(timeline.clone()));

        Self {
            membership_cache,
            timeline,
            availability,
            gate,
        }
    }

    /// Build the core from configuration, using the HTTP identity client and
    /// an in-process timeline store.
    pub fn build(config: &RegistryConfig) -> Result<Self, AppError> {
        init_metrics().map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;

        let provider = HttpIdentityClient::new(&config.identity).map_err(AppError::ConfigError)?;
        let store = Arc::new(InMemoryTimelineStore::new());

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            environment = ?config.environment,
            cache_ttl_seconds = config.membership_cache.ttl_seconds,
            "Sensor registry core initialized"
        );

        Ok(Self::new(Arc::new(provider), store, &config.membership_cache))
    }
}

/// Load configuration, install tracing and build the core.
pub fn init() -> Result<(RegistryConfig, RegistryCore), AppError> {
    let config = RegistryConfig::from_env()?;
    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )?;

    let core = RegistryCore::build(&config)?;
    Ok((config, core))
}
