//! Clock and index driven together the way the discovery loop drives them.

use cfgwatch_core::{ConfigContent, Dependent, ResourceRef, WorkloadKind};
use cfgwatch_store::{CycleClock, Detection, DependencyIndex};

fn r(s: &str) -> ResourceRef { ResourceRef::parse(s) }
fn deploy(s: &str) -> Dependent { Dependent::new(WorkloadKind::Deployment, r(s)) }

/// One discovery cycle: assert every `(config, workload)` pair, sweep when due.
fn cycle(clock: &mut CycleClock, idx: &DependencyIndex, asserted: &[(&str, &str)]) -> bool {
    let now = clock.advance();
    for (cm, w) in asserted {
        if !idx.reassert(&r(cm), &deploy(w), now) {
            idx.track(r(cm), deploy(w), now, Detection::Diff(ConfigContent::default()));
        }
    }
    if clock.sweep_due() {
        idx.sweep(now);
        clock.after_sweep();
        return true;
    }
    false
}

#[test]
fn continuously_asserted_entry_survives_every_sweep_across_resets() {
    let mut clock = CycleClock::new(2);
    let idx = DependencyIndex::new();
    let mut sweeps = 0;
    for _ in 0..12 {
        if cycle(&mut clock, &idx, &[("default/cm", "default/web")]) { sweeps += 1; }
        assert!(idx.contains(&r("default/cm")));
    }
    assert_eq!(sweeps, 6);
}

#[test]
fn entry_dropped_right_after_a_boundary_is_pruned_at_the_next_sweep() {
    let mut clock = CycleClock::new(3);
    let idx = DependencyIndex::new();
    // cycles 1..3, sweep at 3 keeps it
    for _ in 0..3 { cycle(&mut clock, &idx, &[("default/cm", "default/web")]); }
    assert!(idx.contains(&r("default/cm")));
    // workload stops asserting; cycles 4, 5 leave it alone, sweep at 6 removes it
    cycle(&mut clock, &idx, &[]);
    cycle(&mut clock, &idx, &[]);
    assert!(idx.contains(&r("default/cm")));
    assert!(cycle(&mut clock, &idx, &[]));
    assert!(!idx.contains(&r("default/cm")));
}

#[test]
fn stale_mark_from_previous_lap_cannot_alias_the_next_sweep() {
    let mut clock = CycleClock::new(3);
    let idx = DependencyIndex::new();
    // last assertion lands exactly on the sweep at 3
    for _ in 0..3 { cycle(&mut clock, &idx, &[("default/cm", "default/web")]); }
    // a second config asserted only on cycle 6, the reset boundary
    for _ in 0..2 { cycle(&mut clock, &idx, &[]); }
    assert!(cycle(&mut clock, &idx, &[("default/other", "default/api")]));
    assert!(!idx.contains(&r("default/cm")));
    assert!(idx.contains(&r("default/other")));
    assert_eq!(clock.current(), 0);
    // next lap: nothing is asserted; the mark 6 must not survive the sweep at 3
    for _ in 0..3 { cycle(&mut clock, &idx, &[]); }
    assert!(idx.is_empty());
}

#[test]
fn dependent_missing_from_the_sweep_cycle_is_pruned() {
    let mut clock = CycleClock::new(2);
    let idx = DependencyIndex::new();
    cycle(&mut clock, &idx, &[("default/cm", "default/a"), ("default/cm", "default/b")]);
    // cycle 2 (sweep): only `a` re-asserts
    assert!(cycle(&mut clock, &idx, &[("default/cm", "default/a")]));
    assert_eq!(idx.dependents(&r("default/cm")).unwrap(), vec![deploy("default/a")]);
}
