//! cfgwatch controller: discovery, change detection and reaping loops.
//!
//! [`Controller::run`] drives three independent loops until the shutdown
//! token fires:
//! - discovery: advance the cycle clock, scan, sweep when due;
//! - dispatch (push): drain the change channel into the restart dispatcher;
//! - diff polling (diff): compare every snapshot on its own interval.

#![forbid(unsafe_code)]

use std::sync::Arc;

use cfgwatch_core::{Generation, ResourceRef, ResourceStore, Strategy, WatchConfig};
use cfgwatch_ops::{Dispatcher, Restarter};
use cfgwatch_store::{CycleClock, DependencyIndex, SweepReport};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod detect;
pub mod scanner;

pub use detect::{ChangeDetector, ChangeSink, CheckReport, DiffDetector, PushDetector};
pub use scanner::{ScanReport, Scanner};

/// Scan plus optional sweep for one discovery cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub scan: ScanReport,
    pub sweep: Option<SweepReport>,
    /// The cycle counter wrapped after this cycle's sweep.
    pub reset: bool,
}

fn change_queue_cap() -> usize {
    std::env::var("CFGWATCH_CHANGE_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(1024)
}

pub struct Controller {
    cfg: Arc<WatchConfig>,
    index: Arc<DependencyIndex>,
    dispatcher: Arc<Dispatcher>,
    scanner: Scanner,
    diff: Option<Arc<DiffDetector>>,
    changes: Option<mpsc::Receiver<ResourceRef>>,
    clock: CycleClock,
    shutdown: CancellationToken,
}

impl Controller {
    pub fn new(cfg: WatchConfig, store: Arc<dyn ResourceStore>, restarter: Arc<dyn Restarter>, shutdown: CancellationToken) -> Self {
        let cfg = Arc::new(cfg);
        let index = Arc::new(DependencyIndex::new());
        let dispatcher = Arc::new(Dispatcher::new(index.clone(), restarter));
        let mut diff = None;
        let mut changes = None;
        let detector: Arc<dyn ChangeDetector> = match cfg.strategy {
            Strategy::Push => {
                let (tx, rx) = mpsc::channel(change_queue_cap());
                changes = Some(rx);
                Arc::new(PushDetector::new(store.clone(), tx, shutdown.clone()))
            }
            Strategy::Diff => {
                let d = Arc::new(DiffDetector::new(store.clone(), index.clone(), dispatcher.clone()));
                diff = Some(d.clone());
                d
            }
        };
        let scanner = Scanner::new(store, index.clone(), detector, cfg.clone());
        let clock = CycleClock::new(cfg.clean_every);
        Self { cfg, index, dispatcher, scanner, diff, changes, clock, shutdown }
    }

    pub fn index(&self) -> Arc<DependencyIndex> { self.index.clone() }

    pub fn dispatcher(&self) -> Arc<Dispatcher> { self.dispatcher.clone() }

    /// Diff detector, when running the diff strategy.
    pub fn diff_detector(&self) -> Option<Arc<DiffDetector>> { self.diff.clone() }

    pub fn current_cycle(&self) -> Generation { self.clock.current() }

    /// Take the push change channel to drain it elsewhere; `run` then skips its dispatch loop.
    pub fn take_changes(&mut self) -> Option<mpsc::Receiver<ResourceRef>> { self.changes.take() }

    /// One discovery cycle: advance, scan, and sweep if this cycle is a sweep boundary.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let cycle = self.clock.advance();
        let scan = self.scanner.scan(cycle).await;
        let mut report = CycleReport { scan, sweep: None, reset: false };
        if self.clock.sweep_due() {
            info!(cycle, "cycle reached clean count; removing stale resources");
            let sweep = self.index.sweep(cycle);
            debug!(view = ?self.index.view(), "index after sweep");
            report.sweep = Some(sweep);
            if self.clock.after_sweep() {
                debug!("cycle counter reset");
                report.reset = true;
            }
        }
        report
    }

    /// Run every loop until the shutdown token is cancelled, then release all subscriptions.
    pub async fn run(mut self) {
        info!(strategy = ?self.cfg.strategy, gather_every = ?self.cfg.gather_every, clean_every = self.cfg.clean_every, "controller starting");
        let mut tasks = Vec::new();
        if let Some(rx) = self.changes.take() {
            tasks.push(tokio::spawn(dispatch_changes(rx, self.dispatcher.clone(), self.shutdown.clone())));
        }
        if let Some(diff) = self.diff.clone() {
            tasks.push(tokio::spawn(poll_diffs(diff, self.cfg.clone(), self.shutdown.clone())));
        }

        let mut ticker = tokio::time::interval(self.cfg.gather_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.run_cycle().await;
        }

        let released = self.index.clear();
        info!(released, "controller stopping; subscriptions released");
        for t in tasks {
            let _ = t.await;
        }
        info!("controller stopped");
    }
}

/// Drain configmap change notifications into the restart dispatcher.
pub async fn dispatch_changes(mut rx: mpsc::Receiver<ResourceRef>, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => None,
            next = rx.recv() => next,
        };
        let Some(id) = next else { break };
        dispatcher.restart_dependents(&id).await;
    }
    debug!("dispatch loop stopped");
}

async fn poll_diffs(diff: Arc<DiffDetector>, cfg: Arc<WatchConfig>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(cfg.diff_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let report = diff.check_all().await;
        debug!(checked = report.checked, changed = report.changed.len(), failed = report.failed, "diff pass done");
    }
    debug!("diff loop stopped");
}
