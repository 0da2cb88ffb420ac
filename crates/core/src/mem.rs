//! In-memory [`ResourceStore`] used by tests and local dry runs.
//!
//! Workloads are kept as raw JSON shaped like their Kubernetes counterparts
//! (`metadata` plus `spec.template.metadata`), configuration objects as
//! [`ConfigContent`]. Watches fan out every `put_config`/`touch_config` to the
//! open streams of that object. Faults can be injected per object.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::{ConfigContent, ConfigStream, ResourceRef, ResourceStore, StoreError, Workload, WorkloadKind, WorkloadSummary};

type WatchTx = mpsc::UnboundedSender<Result<ConfigContent, StoreError>>;

#[derive(Default)]
struct MemState {
    workloads: BTreeMap<(WorkloadKind, ResourceRef), Value>,
    configs: BTreeMap<ResourceRef, ConfigContent>,
    watches: Vec<(ResourceRef, WatchTx)>,
    watches_opened: BTreeMap<ResourceRef, usize>,
    failing_config_reads: BTreeSet<ResourceRef>,
    failing_updates: BTreeSet<(WorkloadKind, ResourceRef)>,
    failing_lists: BTreeSet<WorkloadKind>,
    updates: Vec<(WorkloadKind, ResourceRef)>,
}

#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemState>,
}

fn pairs_to_json(pairs: &[(&str, &str)]) -> Value {
    let map: serde_json::Map<String, Value> = pairs.iter().map(|(k, v)| ((*k).to_string(), Value::String((*v).to_string()))).collect();
    Value::Object(map)
}

fn json_to_map(v: Option<&Value>) -> BTreeMap<String, String> {
    v.and_then(Value::as_object)
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

/// Match a simple equality label selector (`k=v`, `k==v`, `k!=v`, `k`, `!k`, comma separated).
fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| {
        if let Some((k, v)) = term.split_once("!=") {
            labels.get(k.trim()).map(|x| x != v.trim()).unwrap_or(true)
        } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
            labels.get(k.trim()).map(|x| x == v.trim()).unwrap_or(false)
        } else if let Some(k) = term.strip_prefix('!') {
            !labels.contains_key(k.trim())
        } else {
            labels.contains_key(term)
        }
    })
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn put_workload(&self, kind: WorkloadKind, id: ResourceRef, labels: &[(&str, &str)], annotations: &[(&str, &str)]) {
        let raw = json!({
            "kind": kind.as_str(),
            "metadata": {
                "name": id.name,
                "namespace": id.namespace,
                "labels": pairs_to_json(labels),
                "annotations": pairs_to_json(annotations),
            },
            "spec": { "template": { "metadata": { "labels": {} } } },
        });
        self.state().workloads.insert((kind, id), raw);
    }

    /// Set or clear one annotation on an existing workload.
    pub fn set_annotation(&self, kind: WorkloadKind, id: &ResourceRef, key: &str, value: Option<&str>) {
        let mut st = self.state();
        let Some(raw) = st.workloads.get_mut(&(kind, id.clone())) else { return };
        let annos = &mut raw["metadata"]["annotations"];
        if !annos.is_object() {
            *annos = json!({});
        }
        if let Some(map) = annos.as_object_mut() {
            match value {
                Some(v) => { map.insert(key.to_string(), Value::String(v.to_string())); }
                None => { map.remove(key); }
            }
        }
    }

    pub fn remove_workload(&self, kind: WorkloadKind, id: &ResourceRef) {
        self.state().workloads.remove(&(kind, id.clone()));
    }

    pub fn workload(&self, kind: WorkloadKind, id: &ResourceRef) -> Option<Workload> {
        self.state().workloads.get(&(kind, id.clone())).map(|raw| Workload { kind, id: id.clone(), raw: raw.clone() })
    }

    /// Create or replace a configuration object and notify its watches.
    pub fn put_config(&self, id: ResourceRef, content: ConfigContent) {
        let mut st = self.state();
        st.configs.insert(id.clone(), content.clone());
        Self::notify(&mut st, &id, content);
    }

    /// Re-deliver the current state without changing it (metadata-only edit, re-list).
    pub fn touch_config(&self, id: &ResourceRef) {
        let mut st = self.state();
        if let Some(content) = st.configs.get(id).cloned() {
            Self::notify(&mut st, id, content);
        }
    }

    pub fn remove_config(&self, id: &ResourceRef) {
        self.state().configs.remove(id);
    }

    fn notify(st: &mut MemState, id: &ResourceRef, content: ConfigContent) {
        st.watches.retain(|(_, tx)| !tx.is_closed());
        for (watched, tx) in st.watches.iter() {
            if watched == id {
                let _ = tx.send(Ok(content.clone()));
            }
        }
    }

    /// Push a transient error into every open watch of `id`.
    pub fn break_watches(&self, id: &ResourceRef) {
        let st = self.state();
        for (watched, tx) in st.watches.iter() {
            if watched == id {
                let _ = tx.send(Err(StoreError::Transient("watch interrupted".into())));
            }
        }
    }

    pub fn fail_config_reads(&self, id: &ResourceRef, on: bool) {
        let mut st = self.state();
        if on { st.failing_config_reads.insert(id.clone()); } else { st.failing_config_reads.remove(id); }
    }

    pub fn fail_updates(&self, kind: WorkloadKind, id: &ResourceRef, on: bool) {
        let mut st = self.state();
        let key = (kind, id.clone());
        if on { st.failing_updates.insert(key); } else { st.failing_updates.remove(&key); }
    }

    pub fn fail_lists(&self, kind: WorkloadKind, on: bool) {
        let mut st = self.state();
        if on { st.failing_lists.insert(kind); } else { st.failing_lists.remove(&kind); }
    }

    /// Watches on `id` whose stream is still held by someone.
    pub fn active_watches(&self, id: &ResourceRef) -> usize {
        self.state().watches.iter().filter(|(w, tx)| w == id && !tx.is_closed()).count()
    }

    /// Total watches ever opened on `id`.
    pub fn watches_opened(&self, id: &ResourceRef) -> usize {
        self.state().watches_opened.get(id).copied().unwrap_or(0)
    }

    /// Successful workload updates, in order.
    pub fn updates(&self) -> Vec<(WorkloadKind, ResourceRef)> {
        self.state().updates.clone()
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemStore {
    async fn list_workloads(&self, kind: WorkloadKind, namespace: Option<&str>, selector: &str) -> Result<Vec<WorkloadSummary>, StoreError> {
        let st = self.state();
        if st.failing_lists.contains(&kind) {
            return Err(StoreError::Transient(format!("list {} refused", kind)));
        }
        let out = st
            .workloads
            .iter()
            .filter(|((k, id), _)| *k == kind && namespace.map(|ns| id.namespace == ns).unwrap_or(true))
            .map(|((_, id), raw)| WorkloadSummary {
                id: id.clone(),
                labels: json_to_map(raw["metadata"].get("labels")),
                annotations: json_to_map(raw["metadata"].get("annotations")),
            })
            .filter(|s| selector_matches(selector, &s.labels))
            .collect();
        Ok(out)
    }

    async fn get_workload(&self, kind: WorkloadKind, id: &ResourceRef) -> Result<Workload, StoreError> {
        self.workload(kind, id).ok_or_else(|| StoreError::NotFound(format!("{} {}", kind, id)))
    }

    async fn update_workload(&self, workload: &Workload) -> Result<(), StoreError> {
        let mut st = self.state();
        let key = (workload.kind, workload.id.clone());
        if st.failing_updates.contains(&key) {
            return Err(StoreError::Transient(format!("update {} {} refused", workload.kind, workload.id)));
        }
        match st.workloads.get_mut(&key) {
            Some(raw) => {
                *raw = workload.raw.clone();
                st.updates.push(key);
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("{} {}", workload.kind, workload.id))),
        }
    }

    async fn get_config(&self, id: &ResourceRef) -> Result<ConfigContent, StoreError> {
        let st = self.state();
        if st.failing_config_reads.contains(id) {
            return Err(StoreError::Transient(format!("get configmap {} refused", id)));
        }
        st.configs.get(id).cloned().ok_or_else(|| StoreError::NotFound(format!("configmap {}", id)))
    }

    async fn watch_config(&self, id: &ResourceRef) -> Result<ConfigStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut st = self.state();
        if let Some(current) = st.configs.get(id).cloned() {
            // a fresh watch starts with the current state, like a list+watch
            let _ = tx.send(Ok(current));
        }
        st.watches.push((id.clone(), tx));
        *st.watches_opened.entry(id.clone()).or_insert(0) += 1;
        let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        Ok(stream.boxed())
    }
}
