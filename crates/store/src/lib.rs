//! cfgwatch store: the in-RAM dependency index.
//!
//! Maps each watched configuration object to the workloads depending on it.
//! Every operation takes the index lock once, touches the map, and releases it
//! before anything that may block; subscriptions are always dropped outside
//! the lock.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use cfgwatch_core::{ConfigContent, Dependent, Generation, ResourceRef};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod reaper;

pub use reaper::{CycleClock, SweepReport};

/// Lifetime of one push listener. Cancelled on `cancel()` or drop.
#[derive(Debug)]
pub struct Subscription {
    id: ResourceRef,
    token: CancellationToken,
}

impl Subscription {
    pub fn new(id: ResourceRef, token: CancellationToken) -> Self { Self { id, token } }

    pub fn is_cancelled(&self) -> bool { self.token.is_cancelled() }

    /// Stop the listener. Safe to call more than once.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!(configmap = %self.id, "subscription cancelled");
            self.token.cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) { self.cancel(); }
}

/// How changes to a tracked object are detected. Exactly one per entry.
#[derive(Debug)]
pub enum Detection {
    Push(Subscription),
    /// Last observed content.
    Diff(ConfigContent),
}

impl Detection {
    fn label(&self) -> &'static str {
        match self {
            Detection::Push(_) => "push",
            Detection::Diff(_) => "diff",
        }
    }
}

#[derive(Debug)]
struct TrackedConfig {
    dependents: FxHashMap<Dependent, Generation>,
    generation: Generation,
    detection: Detection,
}

/// Outcome of [`DependencyIndex::track`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracked {
    Created,
    /// Entry already existed; the offered detection was released.
    Merged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentView {
    pub dependent: Dependent,
    pub mark: Generation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedView {
    pub id: ResourceRef,
    pub generation: Generation,
    pub detection: String,
    pub dependents: Vec<DependentView>,
}

/// Serializable dump of the index, ordered by configuration object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexView {
    pub configs: Vec<TrackedView>,
}

#[derive(Default)]
pub struct DependencyIndex {
    map: Mutex<FxHashMap<ResourceRef, TrackedConfig>>,
}

impl DependencyIndex {
    pub fn new() -> Self { Self::default() }

    // Critical sections never leave the map half-updated, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, FxHashMap<ResourceRef, TrackedConfig>> {
        self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    pub fn contains(&self, id: &ResourceRef) -> bool { self.lock().contains_key(id) }

    pub fn generation(&self, id: &ResourceRef) -> Option<Generation> {
        self.lock().get(id).map(|t| t.generation)
    }

    /// Mark of one dependent, if present.
    pub fn mark(&self, id: &ResourceRef, dependent: &Dependent) -> Option<Generation> {
        self.lock().get(id).and_then(|t| t.dependents.get(dependent).copied())
    }

    /// Re-assert `dependent` on an existing entry. Returns false when `config` is not tracked.
    pub fn reassert(&self, config: &ResourceRef, dependent: &Dependent, cycle: Generation) -> bool {
        let mut map = self.lock();
        match map.get_mut(config) {
            Some(entry) => {
                entry.dependents.insert(dependent.clone(), cycle);
                entry.generation = cycle;
                true
            }
            None => false,
        }
    }

    /// Insert a new entry seeded with `dependent`. If another caller created it
    /// first, the dependent is merged and `detection` is released.
    pub fn track(&self, config: ResourceRef, dependent: Dependent, cycle: Generation, detection: Detection) -> Tracked {
        let mut map = self.lock();
        let (outcome, leftover) = match map.get_mut(&config) {
            Some(entry) => {
                entry.dependents.insert(dependent, cycle);
                entry.generation = cycle;
                (Tracked::Merged, Some(detection))
            }
            None => {
                info!(configmap = %config, dependent = %dependent, cycle, mode = detection.label(), "tracking configmap");
                let mut dependents = FxHashMap::default();
                dependents.insert(dependent, cycle);
                map.insert(config, TrackedConfig { dependents, generation: cycle, detection });
                (Tracked::Created, None)
            }
        };
        let len = map.len();
        drop(map);
        drop(leftover);
        gauge!("cfgwatch_tracked_configs", len as f64);
        outcome
    }

    /// Dependents of `id`, sorted. `None` when the object is not tracked.
    pub fn dependents(&self, id: &ResourceRef) -> Option<Vec<Dependent>> {
        let map = self.lock();
        let entry = map.get(id)?;
        let mut out: Vec<Dependent> = entry.dependents.keys().cloned().collect();
        drop(map);
        out.sort();
        Some(out)
    }

    /// Snapshots of every diff-tracked entry.
    pub fn diff_snapshots(&self) -> Vec<(ResourceRef, ConfigContent)> {
        let mut out: Vec<(ResourceRef, ConfigContent)> = self
            .lock()
            .iter()
            .filter_map(|(id, t)| match &t.detection {
                Detection::Diff(snap) => Some((id.clone(), snap.clone())),
                Detection::Push(_) => None,
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Overwrite the snapshot of a diff-tracked entry. False if it is gone or push-tracked.
    pub fn refresh_snapshot(&self, id: &ResourceRef, content: ConfigContent) -> bool {
        match self.lock().get_mut(id).map(|t| &mut t.detection) {
            Some(Detection::Diff(snap)) => {
                *snap = content;
                true
            }
            _ => false,
        }
    }

    /// Two-level mark-and-sweep against `cycle`.
    pub fn sweep(&self, cycle: Generation) -> SweepReport {
        let mut report = SweepReport { cycle, ..SweepReport::default() };
        let mut released: Vec<TrackedConfig> = Vec::new();
        let mut map = self.lock();
        let stale: Vec<ResourceRef> = map.iter().filter(|(_, t)| t.generation != cycle).map(|(id, _)| id.clone()).collect();
        for id in stale {
            if let Some(entry) = map.remove(&id) {
                info!(configmap = %id, generation = entry.generation, cycle, "removing stale configmap");
                report.removed_configs.push(id);
                released.push(entry);
            }
        }
        for (id, entry) in map.iter_mut() {
            entry.dependents.retain(|dep, mark| {
                let keep = *mark == cycle;
                if !keep {
                    info!(configmap = %id, dependent = %dep, mark = *mark, cycle, "removing stale dependent");
                    report.removed_dependents.push((id.clone(), dep.clone()));
                }
                keep
            });
        }
        let len = map.len();
        drop(map);

        for entry in released {
            if let Detection::Push(sub) = &entry.detection {
                sub.cancel();
                report.released += 1;
            }
        }
        report.removed_configs.sort();
        report.removed_dependents.sort();
        gauge!("cfgwatch_tracked_configs", len as f64);
        counter!("cfgwatch_swept_total", (report.removed_configs.len() + report.removed_dependents.len()) as u64);
        report
    }

    /// Drop every entry, releasing all subscriptions. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let drained: Vec<TrackedConfig> = self.lock().drain().map(|(_, t)| t).collect();
        let n = drained.len();
        drop(drained);
        gauge!("cfgwatch_tracked_configs", 0.0);
        n
    }

    pub fn view(&self) -> IndexView {
        let map = self.lock();
        let mut configs: Vec<TrackedView> = map
            .iter()
            .map(|(id, t)| {
                let mut dependents: Vec<DependentView> =
                    t.dependents.iter().map(|(d, m)| DependentView { dependent: d.clone(), mark: *m }).collect();
                dependents.sort_by(|a, b| a.dependent.cmp(&b.dependent));
                TrackedView { id: id.clone(), generation: t.generation, detection: t.detection.label().to_string(), dependents }
            })
            .collect();
        drop(map);
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        IndexView { configs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfgwatch_core::WorkloadKind;

    fn r(s: &str) -> ResourceRef { ResourceRef::parse(s) }
    fn dep(s: &str) -> Dependent { Dependent::new(WorkloadKind::Deployment, r(s)) }

    #[test]
    fn reassert_requires_existing_entry() {
        let idx = DependencyIndex::new();
        assert!(!idx.reassert(&r("default/cm"), &dep("default/web"), 1));
        assert!(idx.is_empty());
        idx.track(r("default/cm"), dep("default/web"), 1, Detection::Diff(ConfigContent::default()));
        assert!(idx.reassert(&r("default/cm"), &dep("default/api"), 2));
        assert_eq!(idx.generation(&r("default/cm")), Some(2));
        assert_eq!(idx.mark(&r("default/cm"), &dep("default/web")), Some(1));
        assert_eq!(idx.mark(&r("default/cm"), &dep("default/api")), Some(2));
    }

    #[test]
    fn track_twice_merges_and_releases_offered_subscription() {
        let idx = DependencyIndex::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        let out = idx.track(r("default/cm"), dep("default/a"), 1, Detection::Push(Subscription::new(r("default/cm"), first.clone())));
        assert_eq!(out, Tracked::Created);
        let out = idx.track(r("default/cm"), dep("default/b"), 1, Detection::Push(Subscription::new(r("default/cm"), second.clone())));
        assert_eq!(out, Tracked::Merged);
        assert!(!first.is_cancelled());
        assert!(second.is_cancelled());
        assert_eq!(idx.dependents(&r("default/cm")).unwrap(), vec![dep("default/a"), dep("default/b")]);
    }

    #[test]
    fn snapshots_only_for_diff_entries() {
        let idx = DependencyIndex::new();
        idx.track(r("a/one"), dep("a/w"), 1, Detection::Diff(ConfigContent::from_pairs([("k", "v")])));
        idx.track(r("a/two"), dep("a/w"), 1, Detection::Push(Subscription::new(r("a/two"), CancellationToken::new())));
        let snaps = idx.diff_snapshots();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].0, r("a/one"));
        assert!(idx.refresh_snapshot(&r("a/one"), ConfigContent::from_pairs([("k", "w")])));
        assert!(!idx.refresh_snapshot(&r("a/two"), ConfigContent::default()));
        assert!(!idx.refresh_snapshot(&r("a/gone"), ConfigContent::default()));
        assert_eq!(idx.diff_snapshots()[0].1.data["k"], "w");
    }

    #[test]
    fn clear_cancels_everything() {
        let idx = DependencyIndex::new();
        let t = CancellationToken::new();
        idx.track(r("a/one"), dep("a/w"), 1, Detection::Push(Subscription::new(r("a/one"), t.clone())));
        assert_eq!(idx.clear(), 1);
        assert!(t.is_cancelled());
        assert!(idx.is_empty());
    }

    #[test]
    fn view_is_sorted_and_labelled() {
        let idx = DependencyIndex::new();
        idx.track(r("b/cm"), dep("b/w"), 3, Detection::Diff(ConfigContent::default()));
        idx.track(r("a/cm"), dep("a/w2"), 3, Detection::Diff(ConfigContent::default()));
        idx.reassert(&r("a/cm"), &dep("a/w1"), 3);
        let v = idx.view();
        assert_eq!(v.configs.len(), 2);
        assert_eq!(v.configs[0].id, r("a/cm"));
        assert_eq!(v.configs[0].detection, "diff");
        assert_eq!(v.configs[0].dependents[0].dependent, dep("a/w1"));
        assert_eq!(v.configs[0].dependents[1].mark, 3);
    }
}
