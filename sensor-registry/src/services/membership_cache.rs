//! Membership cache.
//!
//! Memoizes identity-service group lookups per subject with TTL expiry.
//! Each subject owns a slot guarded by its own async mutex: concurrent misses
//! for one subject queue on that mutex and reuse the first caller's outcome,
//! success or failure, while lookups for other subjects never wait on it.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::instrument;

use super::identity::IdentityProvider;
use super::metrics;
use super::ServiceError;
use crate::config::MembershipCacheConfig;
use crate::models::{GroupMemberships, Principal};

/// Result of a membership lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipResult {
    pub groups: GroupMemberships,
    pub fetched_at: Instant,
    /// True when served without calling the identity service.
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
struct CachedMembership {
    groups: GroupMemberships,
    fetched_at: Instant,
}

#[derive(Debug, Default)]
struct SlotState {
    entry: Option<CachedMembership>,
    /// Error of the most recent attempt; cleared by a successful fetch.
    last_failure: Option<String>,
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
    /// Finished upstream attempts, successful or not.
    completed_attempts: AtomicU64,
}

/// Per-service-instance membership cache.
///
/// Construct once and share by `Arc`; instances are fully independent.
/// Expired entries stay in memory until [`MembershipCache::purge_expired`]
/// runs, so long-lived instances should call it periodically.
pub struct MembershipCache {
    provider: Arc<dyn IdentityProvider>,
    slots: DashMap<String, Arc<Slot>>,
    ttl: Duration,
    lookup_timeout: Duration,
}

impl MembershipCache {
    pub fn new(provider: Arc<dyn IdentityProvider>, ttl: Duration, lookup_timeout: Duration) -> Self {
        Self {
            provider,
            slots: DashMap::new(),
            ttl,
            lookup_timeout,
        }
    }

    pub fn with_config(provider: Arc<dyn IdentityProvider>, config: &MembershipCacheConfig) -> Self {
        Self::new(provider, config.ttl(), config.lookup_timeout())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn slot(&self, subject: &str) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(subject) {
            return slot.clone();
        }
        self.slots
            .entry(subject.to_string())
            .or_default()
            .clone()
    }

    fn is_fresh(&self, entry: &CachedMembership) -> bool {
        entry.fetched_at.elapsed() < self.ttl
    }

    /// Look up memberships for `subject`.
    ///
    /// Served from cache when an unexpired entry exists and `force_refresh`
    /// is false. A forced refresh still reuses a result fetched after the
    /// forced request arrived, so a burst of forced requests costs one call.
    #[instrument(skip(self), fields(subject = %subject))]
    pub async fn lookup(
        &self,
        subject: &str,
        force_refresh: bool,
    ) -> Result<MembershipResult, ServiceError> {
        let slot = self.slot(subject);
        let attempts_seen = slot.completed_attempts.load(Ordering::Acquire);

        let mut guard = timeout(self.lookup_timeout, slot.state.lock())
            .await
            .map_err(|_| {
                metrics::record_membership_lookup("timeout");
                tracing::warn!("Timed out waiting for in-flight membership lookup");
                ServiceError::IdentityServiceUnavailable(format!(
                    "lookup for {} did not complete within {:?}",
                    subject, self.lookup_timeout
                ))
            })?;

        // An attempt finished while this caller was queued: share its outcome.
        let attempted_while_queued =
            slot.completed_attempts.load(Ordering::Acquire) > attempts_seen;
        if attempted_while_queued {
            if let Some(message) = &guard.last_failure {
                metrics::record_membership_lookup("coalesced_error");
                return Err(ServiceError::IdentityServiceUnavailable(message.clone()));
            }
        }

        if let Some(entry) = guard.entry.as_ref() {
            if self.is_fresh(entry) && (!force_refresh || attempted_while_queued) {
                metrics::record_membership_lookup("hit");
                return Ok(MembershipResult {
                    groups: entry.groups.clone(),
                    fetched_at: entry.fetched_at,
                    from_cache: true,
                });
            }
        }

        metrics::record_membership_lookup("miss");
        let outcome = match timeout(self.lookup_timeout, self.provider.fetch_groups(subject)).await
        {
            Err(_) => {
                metrics::record_membership_lookup("timeout");
                tracing::warn!(
                    timeout_ms = self.lookup_timeout.as_millis() as u64,
                    "Identity service lookup timed out"
                );
                Err(format!(
                    "identity lookup timed out after {:?}",
                    self.lookup_timeout
                ))
            }
            Ok(Err(e)) => {
                metrics::record_membership_lookup("error");
                tracing::warn!(error = %e, "Identity service lookup failed");
                Err(e.to_string())
            }
            Ok(Ok(None)) => {
                tracing::debug!("Unknown subject, caching empty membership");
                Ok(GroupMemberships::empty())
            }
            Ok(Ok(Some(groups))) => Ok(groups),
        };

        let groups = match outcome {
            Ok(groups) => groups,
            Err(message) => {
                guard.last_failure = Some(message.clone());
                slot.completed_attempts.fetch_add(1, Ordering::AcqRel);
                if guard.entry.is_none() {
                    // Queued callers keep their own handle on the slot.
                    self.slots
                        .remove_if(subject, |_, current| Arc::ptr_eq(current, &slot));
                }
                return Err(ServiceError::IdentityServiceUnavailable(message));
            }
        };

        let entry = CachedMembership {
            groups,
            fetched_at: Instant::now(),
        };
        guard.entry = Some(entry.clone());
        guard.last_failure = None;
        slot.completed_attempts.fetch_add(1, Ordering::AcqRel);

        tracing::debug!(
            administrated = entry.groups.administrated_group_ids.len(),
            membered = entry.groups.membered_group_ids.len(),
            "Membership cached"
        );

        Ok(MembershipResult {
            groups: entry.groups,
            fetched_at: entry.fetched_at,
            from_cache: false,
        })
    }

    /// Drop the cached entry for exactly one subject.
    ///
    /// Returns whether an entry existed.
    pub fn invalidate(&self, subject: &str) -> bool {
        let removed = self.slots.remove(subject).is_some();
        tracing::debug!(subject = %subject, removed, "Membership cache entry invalidated");
        removed
    }

    /// Remove expired entries. Slots with a lookup in flight are kept.
    pub fn purge_expired(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot.state.try_lock() {
            Ok(state) => state.entry.as_ref().is_some_and(|e| self.is_fresh(e)),
            Err(_) => true,
        });
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Build a principal from verified token claims plus current memberships.
    pub async fn resolve_principal(
        &self,
        subject: &str,
        is_superuser: bool,
        force_refresh: bool,
    ) -> Result<Principal, ServiceError> {
        let result = self.lookup(subject, force_refresh).await?;
        Ok(Principal::new(subject, is_superuser, result.groups))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::identity::MockIdentityProvider;
    use std::collections::BTreeSet;

    fn groups(admin: &[&str], member: &[&str]) -> GroupMemberships {
        GroupMemberships {
            administrated_group_ids: admin.iter().map(|s| s.to_string()).collect(),
            membered_group_ids: member.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        }
    }

    fn cache_with(provider: Arc<MockIdentityProvider>) -> MembershipCache {
        MembershipCache::new(provider, Duration::from_secs(60), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_lookup_served_from_cache() {
        let provider = Arc::new(MockIdentityProvider::new().with_groups("alice", groups(&["a"], &[])));
        let cache = cache_with(provider.clone());

        let first = cache.lookup("alice", false).await.unwrap();
        let second = cache.lookup("alice", false).await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.groups, second.groups);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let provider = Arc::new(MockIdentityProvider::new().with_groups("alice", groups(&[], &["m"])));
        let cache = cache_with(provider.clone());

        cache.lookup("alice", false).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let refreshed = cache.lookup("alice", false).await.unwrap();

        assert!(!refreshed.from_cache);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_bypasses_fresh_entry() {
        let provider = Arc::new(MockIdentityProvider::new().with_groups("alice", groups(&[], &["old"])));
        let cache = cache_with(provider.clone());

        cache.lookup("alice", false).await.unwrap();
        provider.set_groups("alice", groups(&[], &["new"]));

        let stale = cache.lookup("alice", false).await.unwrap();
        assert!(stale.groups.membered_group_ids.contains("old"));

        let forced = cache.lookup("alice", true).await.unwrap();
        assert!(!forced.from_cache);
        assert!(forced.groups.membered_group_ids.contains("new"));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_subject_yields_empty_membership() {
        let provider = Arc::new(MockIdentityProvider::new());
        let cache = cache_with(provider.clone());

        let result = cache.lookup("ghost", false).await.unwrap();
        assert!(result.groups.is_empty());

        // Cached like any other answer
        cache.lookup("ghost", false).await.unwrap();
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_closed() {
        let provider = Arc::new(
            MockIdentityProvider::new()
                .with_groups("alice", groups(&["a"], &[]))
                .with_delay(Duration::from_secs(5)),
        );
        let cache = cache_with(provider.clone());

        let result = cache.lookup("alice", false).await;
        assert!(matches!(
            result,
            Err(ServiceError::IdentityServiceUnavailable(_))
        ));

        // Nothing was cached
        provider.set_delay(None);
        let retry = cache.lookup("alice", false).await.unwrap();
        assert!(!retry.from_cache);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_error_is_not_cached_as_empty() {
        let provider = Arc::new(MockIdentityProvider::new().with_groups("alice", groups(&["a"], &[])));
        provider.set_failing(true);
        let cache = cache_with(provider.clone());

        assert!(matches!(
            cache.lookup("alice", false).await,
            Err(ServiceError::IdentityServiceUnavailable(_))
        ));

        provider.set_failing(false);
        let result = cache.lookup("alice", false).await.unwrap();
        assert!(result.groups.administrated_group_ids.contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_lookup_leaves_no_slot_behind() {
        let provider = Arc::new(MockIdentityProvider::new());
        provider.set_failing(true);
        let cache = cache_with(provider.clone());

        assert!(cache.lookup("alice", false).await.is_err());
        assert!(cache.is_empty());

        // A later caller tries again instead of reusing the old failure
        assert!(cache.lookup("alice", false).await.is_err());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_cached_entry_keeps_entry() {
        let provider = Arc::new(MockIdentityProvider::new().with_groups("alice", groups(&["a"], &[])));
        let cache = cache_with(provider.clone());

        cache.lookup("alice", false).await.unwrap();
        provider.set_failing(true);
        assert!(cache.lookup("alice", true).await.is_err());
        assert_eq!(cache.len(), 1);

        // Fresh entry still serves non-forced callers
        let cached = cache.lookup("alice", false).await.unwrap();
        assert!(cached.from_cache);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_keeps_fresh_entries() {
        let provider = Arc::new(MockIdentityProvider::new());
        let cache = cache_with(provider);

        cache.lookup("old", false).await.unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        cache.lookup("young", false).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_principal() {
        let provider = Arc::new(
            MockIdentityProvider::new().with_groups("alice", groups(&["lab"], &["field"])),
        );
        let cache = cache_with(provider);

        let principal = cache.resolve_principal("alice", false, false).await.unwrap();
        assert_eq!(principal.subject, "alice");
        assert!(principal.is_admin_of("lab"));
        assert!(principal.is_member_of("field"));
        assert!(!principal.is_superuser);
    }
}
