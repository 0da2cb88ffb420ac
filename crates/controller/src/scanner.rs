//! Discovery: fold workload dependency annotations into the index.

use std::sync::Arc;
use std::time::Instant;

use cfgwatch_core::{Dependent, Generation, ResourceRef, ResourceStore, WatchConfig, WorkloadKind, WorkloadSummary};
use cfgwatch_store::{DependencyIndex, Tracked};
use metrics::histogram;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::ChangeDetector;

/// Counters for one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub cycle: Generation,
    /// Opted-in workloads returned by the store.
    pub listed: usize,
    /// Dropped by the namespace allow-list.
    pub filtered: usize,
    /// Dependencies (re)asserted this cycle, including new entries.
    pub asserted: usize,
    /// Configmaps newly tracked.
    pub created: usize,
    /// Malformed references, unreadable configmaps, failed detection setup.
    pub skipped: usize,
}

pub struct Scanner {
    store: Arc<dyn ResourceStore>,
    index: Arc<DependencyIndex>,
    detector: Arc<dyn ChangeDetector>,
    cfg: Arc<WatchConfig>,
}

impl Scanner {
    pub fn new(store: Arc<dyn ResourceStore>, index: Arc<DependencyIndex>, detector: Arc<dyn ChangeDetector>, cfg: Arc<WatchConfig>) -> Self {
        Self { store, index, detector, cfg }
    }

    pub async fn scan(&self, cycle: Generation) -> ScanReport {
        let t0 = Instant::now();
        let mut report = ScanReport { cycle, ..ScanReport::default() };
        for kind in WorkloadKind::ALL {
            let items = match self.store.list_workloads(kind, None, &self.cfg.opt_in_selector).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "unable to list workloads; retrying next cycle");
                    continue;
                }
            };
            debug!(kind = %kind, count = items.len(), cycle, "opted-in workloads");
            report.listed += items.len();
            for w in items {
                self.fold(kind, w, cycle, &mut report).await;
            }
        }
        histogram!("cfgwatch_scan_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            cycle,
            listed = report.listed,
            asserted = report.asserted,
            created = report.created,
            skipped = report.skipped,
            took_ms = %t0.elapsed().as_millis(),
            "discovery pass done"
        );
        report
    }

    async fn fold(&self, kind: WorkloadKind, w: WorkloadSummary, cycle: Generation, report: &mut ScanReport) {
        if !self.cfg.namespace_allowed(&w.id.namespace) {
            debug!(kind = %kind, workload = %w.id, "namespace not allowed; ignoring");
            report.filtered += 1;
            return;
        }
        let Some(value) = w.annotations.get(&self.cfg.annotation_key) else {
            debug!(kind = %kind, workload = %w.id, "opted in without a configmap annotation");
            return;
        };
        let config = match ResourceRef::from_annotation(value) {
            Ok(r) => r,
            Err(e) => {
                warn!(kind = %kind, workload = %w.id, error = %e, "ignoring malformed configmap annotation");
                report.skipped += 1;
                return;
            }
        };
        let content = match self.store.get_config(&config).await {
            Ok(c) => c,
            Err(e) => {
                warn!(kind = %kind, workload = %w.id, configmap = %config, error = %e, "unable to get configmap; skipping workload this cycle");
                report.skipped += 1;
                return;
            }
        };
        let dependent = Dependent::new(kind, w.id);
        if self.index.reassert(&config, &dependent, cycle) {
            report.asserted += 1;
            return;
        }
        match self.detector.establish(&config, content).await {
            Ok(detection) => {
                if self.index.track(config, dependent, cycle, detection) == Tracked::Created {
                    report.created += 1;
                }
                report.asserted += 1;
            }
            Err(e) => {
                warn!(configmap = %config, dependent = %dependent, error = %e, "unable to start change detection");
                report.skipped += 1;
            }
        }
    }
}
