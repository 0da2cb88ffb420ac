//! Shared fixtures for the controller integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cfgwatch_core::mem::MemStore;
use cfgwatch_core::{ConfigContent, ResourceRef, WatchConfig, WorkloadKind, DEFAULT_ANNOTATION};

pub const OPT_IN: (&str, &str) = ("watcher.ibm.com/opt-in", "true");

pub fn r(s: &str) -> ResourceRef { ResourceRef::parse(s) }

pub fn content(v: &str) -> ConfigContent { ConfigContent::from_pairs([("app.conf", v)]) }

pub fn cfg(clean_every: u64) -> WatchConfig {
    WatchConfig {
        gather_every: Duration::from_millis(20),
        diff_every: Duration::from_millis(20),
        clean_every,
        ..WatchConfig::default()
    }
}

/// Opted-in workload pointing at `cm`.
pub fn opted_in(store: &MemStore, kind: WorkloadKind, id: &str, cm: &str) {
    store.put_workload(kind, r(id), &[OPT_IN], &[(DEFAULT_ANNOTATION, cm)]);
}

pub fn seeded() -> Arc<MemStore> {
    let store = Arc::new(MemStore::new());
    store.put_config(r("default/cm"), content("v1"));
    opted_in(&store, WorkloadKind::Deployment, "default/web", "default/cm");
    store
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Give spawned listeners a chance to run before asserting that nothing happened.
pub async fn settle() { tokio::time::sleep(Duration::from_millis(60)).await; }
