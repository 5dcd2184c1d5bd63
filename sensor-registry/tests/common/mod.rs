//! Common test utilities for sensor-registry integration tests.
#![allow(dead_code)]

use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use sensor_registry::config::MembershipCacheConfig;
use sensor_registry::models::{GroupMemberships, Principal, ResourceKind, ResourceSnapshot, Visibility};
use sensor_registry::services::{InMemoryTimelineStore, MockIdentityProvider};
use sensor_registry::startup::RegistryCore;
use std::collections::BTreeSet;
use std::sync::{Arc, Once};
use tokio::net::TcpListener;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,sensor_registry=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn date(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

pub fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn groups(admin: &[&str], member: &[&str]) -> GroupMemberships {
    GroupMemberships {
        administrated_group_ids: set(admin),
        membered_group_ids: set(member),
    }
}

pub fn principal(subject: &str, admin: &[&str], member: &[&str]) -> Principal {
    Principal::new(subject, false, groups(admin, member))
}

pub fn snapshot(
    kind: ResourceKind,
    id: i64,
    visibility: Visibility,
    group_ids: &[&str],
    owner: Option<&str>,
) -> ResourceSnapshot {
    ResourceSnapshot::new(kind, id, visibility, set(group_ids), owner.map(str::to_string))
}

/// Core wired to a mock identity provider and an in-memory store.
pub fn spawn_core(provider: Arc<MockIdentityProvider>) -> RegistryCore {
    init_tracing();
    RegistryCore::new(
        provider,
        Arc::new(InMemoryTimelineStore::new()),
        &MembershipCacheConfig::default(),
    )
}

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn spawn_http(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("Failed to read local addr");

    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    format!("http://{}", addr)
}
