//! cfgwatch ops: rolling restarts of workloads that depend on a changed configmap.

#![forbid(unsafe_code)]

use std::sync::Arc;

use cfgwatch_core::{CoreError, Dependent, ResourceRef, ResourceStore, StoreError, WorkloadKind};
use cfgwatch_store::DependencyIndex;
use futures::future::join_all;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Object(#[from] CoreError),
}

/// Restart action, dispatched on the workload kind.
#[async_trait::async_trait]
pub trait Restarter: Send + Sync {
    async fn restart(&self, kind: WorkloadKind, workload: &ResourceRef) -> Result<(), RestartError>;
}

/// Default restarter: stamps a timestamp label on the workload and its pod
/// template, so the template hash changes and the controller rolls the pods.
pub struct MarkerRestarter {
    store: Arc<dyn ResourceStore>,
    label: String,
}

impl MarkerRestarter {
    pub fn new(store: Arc<dyn ResourceStore>, label: impl Into<String>) -> Self {
        Self { store, label: label.into() }
    }
}

#[async_trait::async_trait]
impl Restarter for MarkerRestarter {
    async fn restart(&self, kind: WorkloadKind, workload: &ResourceRef) -> Result<(), RestartError> {
        let stamp = restart_stamp(chrono::Utc::now());
        info!(kind = %kind, workload = %workload, stamp = %stamp, "restarting workload");
        let mut obj = self.store.get_workload(kind, workload).await?;
        stamp_restart_marker(&mut obj.raw, &self.label, &stamp)?;
        self.store.update_workload(&obj).await?;
        Ok(())
    }
}

/// Label-safe timestamp (label values cannot carry `:`).
pub fn restart_stamp(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%Y-%-m-%-d.%H%M%S").to_string()
}

fn ensure_map<'a>(parent: &'a mut Map<String, Value>, key: &str) -> Result<&'a mut Map<String, Value>, CoreError> {
    let slot = parent.entry(key.to_string()).or_insert_with(|| Value::Object(Map::new()));
    if slot.is_null() {
        *slot = Value::Object(Map::new());
    }
    slot.as_object_mut().ok_or_else(|| CoreError::MalformedObject(format!("{} is not an object", key)))
}

/// Write `label=stamp` into `metadata.labels` and `spec.template.metadata.labels`.
pub fn stamp_restart_marker(raw: &mut Value, label: &str, stamp: &str) -> Result<(), CoreError> {
    let root = raw.as_object_mut().ok_or_else(|| CoreError::MalformedObject("workload is not an object".into()))?;
    let meta = ensure_map(root, "metadata")?;
    ensure_map(meta, "labels")?.insert(label.to_string(), Value::String(stamp.to_string()));
    let template = root
        .get_mut("spec")
        .and_then(|s| s.get_mut("template"))
        .and_then(Value::as_object_mut)
        .ok_or_else(|| CoreError::MalformedObject("missing spec.template".into()))?;
    let tmeta = ensure_map(template, "metadata")?;
    ensure_map(tmeta, "labels")?.insert(label.to_string(), Value::String(stamp.to_string()));
    Ok(())
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartReport {
    pub config: ResourceRef,
    pub restarted: Vec<Dependent>,
    pub failed: Vec<Dependent>,
}

impl RestartReport {
    pub fn attempted(&self) -> usize { self.restarted.len() + self.failed.len() }
}

/// Looks up dependents in the index and restarts each one independently.
pub struct Dispatcher {
    index: Arc<DependencyIndex>,
    restarter: Arc<dyn Restarter>,
}

impl Dispatcher {
    pub fn new(index: Arc<DependencyIndex>, restarter: Arc<dyn Restarter>) -> Self {
        Self { index, restarter }
    }

    pub async fn restart_dependents(&self, id: &ResourceRef) -> RestartReport {
        let mut report = RestartReport { config: id.clone(), ..RestartReport::default() };
        // An entry reaped between detection and dispatch is expected.
        let Some(dependents) = self.index.dependents(id) else {
            debug!(configmap = %id, "change for untracked configmap; nothing to restart");
            return report;
        };
        info!(configmap = %id, dependents = dependents.len(), "configmap changed; restarting dependents");
        let restarter = &self.restarter;
        let results = join_all(dependents.into_iter().map(|dep| async move {
            let res = restarter.restart(dep.kind, &dep.workload).await;
            (dep, res)
        }))
        .await;
        for (dep, res) in results {
            match res {
                Ok(()) => {
                    counter!("cfgwatch_restarts_total", 1, "kind" => dep.kind.as_str());
                    report.restarted.push(dep);
                }
                Err(e) => {
                    counter!("cfgwatch_restart_failures_total", 1, "kind" => dep.kind.as_str());
                    warn!(configmap = %id, kind = %dep.kind, workload = %dep.workload, error = %e, "unable to restart workload");
                    report.failed.push(dep);
                }
            }
        }
        report
    }
}
