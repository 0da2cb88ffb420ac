//! Discovery, detection, restart and reaping wired together over the in-memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cfgwatch_controller::{dispatch_changes, Controller};
use cfgwatch_core::{Strategy, WatchConfig, WorkloadKind, DEFAULT_ANNOTATION, DEFAULT_RESTART_LABEL};
use cfgwatch_ops::MarkerRestarter;
use common::*;
use tokio_util::sync::CancellationToken;

fn controller(store: &Arc<cfgwatch_core::mem::MemStore>, cfg: WatchConfig, shutdown: &CancellationToken) -> Controller {
    let restarter = Arc::new(MarkerRestarter::new(store.clone(), cfg.restart_label.clone()));
    Controller::new(cfg, store.clone(), restarter, shutdown.clone())
}

#[tokio::test]
async fn push_change_restarts_dependent_then_removal_is_reaped() {
    let store = seeded();
    let shutdown = CancellationToken::new();
    let mut ctl = controller(&store, cfg(2), &shutdown);
    let rx = ctl.take_changes().unwrap();
    let dispatch = tokio::spawn(dispatch_changes(rx, ctl.dispatcher(), shutdown.clone()));
    let cm = r("default/cm");

    let first = ctl.run_cycle().await;
    assert_eq!(first.scan.created, 1);
    assert!(first.sweep.is_none());
    assert_eq!(store.active_watches(&cm), 1);

    store.put_config(cm.clone(), content("v2"));
    eventually("restart", || store.updates().len() == 1).await;
    settle().await;
    assert_eq!(store.updates(), vec![(WorkloadKind::Deployment, r("default/web"))]);
    let w = store.workload(WorkloadKind::Deployment, &r("default/web")).unwrap();
    assert!(w.raw["spec"]["template"]["metadata"]["labels"][DEFAULT_RESTART_LABEL].is_string());

    // opt-out: the annotation goes away before the sweep boundary
    store.set_annotation(WorkloadKind::Deployment, &r("default/web"), DEFAULT_ANNOTATION, None);
    let second = ctl.run_cycle().await;
    let sweep = second.sweep.unwrap();
    assert_eq!(sweep.removed_configs, vec![cm.clone()]);
    assert_eq!(sweep.released, 1);
    assert!(ctl.index().is_empty());
    eventually("watch released", || store.active_watches(&cm) == 0).await;

    store.put_config(cm.clone(), content("v3"));
    settle().await;
    assert_eq!(store.updates().len(), 1);

    shutdown.cancel();
    dispatch.await.unwrap();
}

#[tokio::test]
async fn diff_change_restarts_every_dependent() {
    let store = seeded();
    store.put_workload(WorkloadKind::StatefulSet, r("default/db"), &[OPT_IN], &[(DEFAULT_ANNOTATION, "default/cm")]);
    let shutdown = CancellationToken::new();
    let mut ctl = controller(&store, WatchConfig { strategy: Strategy::Diff, ..cfg(100) }, &shutdown);
    assert!(ctl.take_changes().is_none());

    ctl.run_cycle().await;
    assert_eq!(store.active_watches(&r("default/cm")), 0);
    let diff = ctl.diff_detector().unwrap();
    assert!(diff.check_all().await.changed.is_empty());

    store.put_config(r("default/cm"), content("v2"));
    let report = diff.check_all().await;
    assert_eq!(report.changed, vec![r("default/cm")]);
    let mut updated = store.updates();
    updated.sort();
    assert_eq!(updated, vec![(WorkloadKind::Deployment, r("default/web")), (WorkloadKind::StatefulSet, r("default/db"))]);
}

#[tokio::test]
async fn failed_restart_is_not_retried_and_keeps_tracking() {
    let store = seeded();
    store.fail_updates(WorkloadKind::Deployment, &r("default/web"), true);
    let shutdown = CancellationToken::new();
    let mut ctl = controller(&store, WatchConfig { strategy: Strategy::Diff, ..cfg(100) }, &shutdown);
    ctl.run_cycle().await;

    store.put_config(r("default/cm"), content("v2"));
    let diff = ctl.diff_detector().unwrap();
    assert_eq!(diff.check_all().await.changed.len(), 1);
    assert!(store.updates().is_empty());
    // snapshot moved on, so the same content is not a second change
    assert!(diff.check_all().await.changed.is_empty());
    assert!(ctl.index().contains(&r("default/cm")));
}

#[tokio::test]
async fn dependent_dropped_from_shared_config_is_pruned_alone() {
    let store = seeded();
    opted_in(&store, WorkloadKind::DaemonSet, "default/agent", "default/cm");
    let shutdown = CancellationToken::new();
    let mut ctl = controller(&store, WatchConfig { strategy: Strategy::Diff, ..cfg(2) }, &shutdown);

    ctl.run_cycle().await;
    store.remove_workload(WorkloadKind::DaemonSet, &r("default/agent"));
    let sweep = ctl.run_cycle().await.sweep.unwrap();
    assert!(sweep.removed_configs.is_empty());
    assert_eq!(sweep.removed_dependents.len(), 1);
    assert_eq!(ctl.index().dependents(&r("default/cm")).unwrap().len(), 1);
}

#[tokio::test]
async fn counter_resets_after_two_sweep_intervals() {
    let store = seeded();
    let shutdown = CancellationToken::new();
    let mut ctl = controller(&store, WatchConfig { strategy: Strategy::Diff, ..cfg(2) }, &shutdown);
    let mut swept = Vec::new();
    for _ in 0..6 {
        let report = ctl.run_cycle().await;
        if report.sweep.is_some() {
            swept.push((report.scan.cycle, report.reset));
        }
        assert!(ctl.index().contains(&r("default/cm")));
    }
    assert_eq!(swept, vec![(2, false), (4, true), (2, false)]);
    assert_eq!(ctl.current_cycle(), 2);
}

#[tokio::test]
async fn run_stops_on_shutdown_and_releases_subscriptions() {
    let store = seeded();
    let shutdown = CancellationToken::new();
    let ctl = controller(&store, cfg(100), &shutdown);
    let index = ctl.index();
    let handle = tokio::spawn(ctl.run());

    eventually("configmap tracked", || index.contains(&r("default/cm"))).await;
    store.put_config(r("default/cm"), content("v2"));
    eventually("restart", || store.updates().len() == 1).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert!(index.is_empty());
    eventually("watch released", || store.active_watches(&r("default/cm")) == 0).await;
}
