use cfgwatch_core::{ConfigContent, Dependent, ResourceRef, WorkloadKind};
use cfgwatch_store::{Detection, DependencyIndex, Subscription};
use tokio_util::sync::CancellationToken;

fn r(s: &str) -> ResourceRef { ResourceRef::parse(s) }
fn deploy(s: &str) -> Dependent { Dependent::new(WorkloadKind::Deployment, r(s)) }
fn sts(s: &str) -> Dependent { Dependent::new(WorkloadKind::StatefulSet, r(s)) }

fn push(id: &str, token: &CancellationToken) -> Detection {
    Detection::Push(Subscription::new(r(id), token.clone()))
}

#[test]
fn untouched_entry_is_removed_and_its_subscription_released_once() {
    let idx = DependencyIndex::new();
    let stale = CancellationToken::new();
    let fresh = CancellationToken::new();
    idx.track(r("default/old"), deploy("default/a"), 1, push("default/old", &stale));
    idx.track(r("default/new"), deploy("default/b"), 1, push("default/new", &fresh));
    idx.reassert(&r("default/new"), &deploy("default/b"), 2);

    let report = idx.sweep(2);
    assert_eq!(report.removed_configs, vec![r("default/old")]);
    assert_eq!(report.released, 1);
    assert!(stale.is_cancelled());
    assert!(!fresh.is_cancelled());
    assert!(!idx.contains(&r("default/old")));

    // a second sweep of the same cycle finds nothing left to release
    let again = idx.sweep(2);
    assert!(again.is_empty());
    assert_eq!(again.released, 0);
}

#[test]
fn dependents_are_pruned_inside_a_surviving_entry() {
    let idx = DependencyIndex::new();
    let cm = r("default/cm");
    idx.track(cm.clone(), deploy("default/a"), 1, Detection::Diff(ConfigContent::default()));
    idx.reassert(&cm, &sts("default/b"), 1);
    idx.reassert(&cm, &deploy("default/c"), 1);
    // cycle 2 only re-asserts two of them
    idx.reassert(&cm, &deploy("default/a"), 2);
    idx.reassert(&cm, &sts("default/b"), 2);

    let report = idx.sweep(2);
    assert!(report.removed_configs.is_empty());
    assert_eq!(report.removed_dependents, vec![(cm.clone(), deploy("default/c"))]);
    assert_eq!(idx.dependents(&cm).unwrap(), vec![deploy("default/a"), sts("default/b")]);
    assert_eq!(idx.generation(&cm), Some(2));
}

#[test]
fn same_name_different_kind_are_distinct_dependents() {
    let idx = DependencyIndex::new();
    let cm = r("default/cm");
    idx.track(cm.clone(), deploy("default/x"), 4, Detection::Diff(ConfigContent::default()));
    idx.reassert(&cm, &sts("default/x"), 4);
    idx.reassert(&cm, &deploy("default/x"), 4);
    assert_eq!(idx.dependents(&cm).unwrap().len(), 2);
}

#[test]
fn sweep_of_a_cycle_nobody_touched_empties_the_index() {
    let idx = DependencyIndex::new();
    let t1 = CancellationToken::new();
    let t2 = CancellationToken::new();
    idx.track(r("a/one"), deploy("a/w"), 5, push("a/one", &t1));
    idx.track(r("b/two"), deploy("b/w"), 5, push("b/two", &t2));
    let report = idx.sweep(6);
    assert_eq!(report.removed_configs, vec![r("a/one"), r("b/two")]);
    assert_eq!(report.released, 2);
    assert!(idx.is_empty());
    assert!(t1.is_cancelled() && t2.is_cancelled());
}
