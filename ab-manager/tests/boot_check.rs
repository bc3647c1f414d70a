use orb_ab_manager::{
    BootOutcome, Error, Slot, SystemState,
    health::{DiskHealth, FsVerdict},
    test_utils::Fixture,
};

#[test]
fn healthy_boot_is_confirmed() {
    let fx = Fixture::builder().build();

    let outcome = fx.manager.boot_check().unwrap();

    // One unconfirmed boot costs 10 points.
    assert_eq!(outcome, BootOutcome::HealthyContinue { score: 90 });
    assert!(outcome.proceed());
    let state = fx.state();
    assert_eq!(state.active, Slot::A);
    assert_eq!(state.boot_failure_count, 0);
    assert_eq!(state.partition_a.health, 100);
    assert!(state.last_successful_boot.is_some());
    assert_eq!(state.partition_a.version.as_deref(), Some("1.0"));
    assert!(state.partition_a.checksum.is_some());
    assert_eq!(fx.bootloader.confirmed(), vec![Slot::A]);
    assert!(fx.bootloader.set_calls().is_empty());
}

#[test]
fn first_run_follows_the_bootloader() {
    let fx = Fixture::builder().boot_target(Slot::B).build();

    fx.manager.boot_check().unwrap();

    let state = fx.state();
    assert_eq!(state.active, Slot::B);
    assert_eq!(state.standby, Slot::A);
    assert_eq!(fx.bootloader.confirmed(), vec![Slot::B]);
}

#[test]
fn mid_band_health_schedules_a_repair_of_the_active_slot() {
    let fx = Fixture::builder().build();
    fx.fs.set(Slot::A, FsVerdict::Damaged("orphaned inodes".into()));

    let outcome = fx.manager.boot_check().unwrap();

    assert_eq!(outcome, BootOutcome::ScheduleRepair { score: 60 });
    assert!(outcome.proceed());
    let state = fx.state();
    assert_eq!(state.active, Slot::A);
    assert_eq!(state.boot_failure_count, 1);
    assert_eq!(state.partition_a.health, 60);
    let job = fx.manager.repairs().get(Slot::A).unwrap().unwrap();
    assert_eq!(job.target, Slot::A);
    assert!(fx.bootloader.confirmed().is_empty());
}

#[test]
fn mid_band_health_without_auto_repair_is_degraded() {
    let fx = Fixture::builder().build();
    fx.manager.set_policy(Some(false), None).unwrap();
    fx.fs.set(Slot::A, FsVerdict::Damaged("orphaned inodes".into()));

    let outcome = fx.manager.boot_check().unwrap();

    assert!(matches!(
        outcome,
        BootOutcome::Degraded { score: Some(60), .. }
    ));
    assert!(fx.manager.repairs().pending().is_empty());
}

#[test]
fn degrading_boots_end_in_failover() {
    let fx = Fixture::builder().build();
    // 70 before the boot-loop penalty.
    fx.fs.set(Slot::A, FsVerdict::Damaged("journal replay failed".into()));

    let first = fx.manager.boot_check().unwrap();
    assert_eq!(first, BootOutcome::ScheduleRepair { score: 60 });
    assert_eq!(fx.state().boot_failure_count, 1);

    let second = fx.manager.boot_check().unwrap();
    assert_eq!(second, BootOutcome::ScheduleRepair { score: 50 });
    assert_eq!(fx.state().boot_failure_count, 2);

    let third = fx.manager.boot_check().unwrap();
    assert!(
        matches!(third, BootOutcome::Failover { from: Slot::A, to: Slot::B, .. }),
        "{third:?}"
    );
    assert!(!third.proceed());

    let state = fx.state();
    assert_eq!(state.active, Slot::B);
    assert_eq!(state.standby, Slot::A);
    assert_eq!(state.boot_failure_count, 0);
    assert!(state.rollback_available);
    assert_eq!(fx.bootloader.target(), Slot::B);
    let job = fx.manager.repairs().get(Slot::A).unwrap().unwrap();
    assert_eq!(job.reason, "demoted by failover");
}

#[test]
fn exceeding_max_boot_attempts_fails_over_regardless_of_health() {
    let fx = Fixture::builder()
        .state(SystemState {
            boot_failure_count: 3,
            ..SystemState::first_run(Slot::A)
        })
        .build();

    let outcome = fx.manager.boot_check().unwrap();

    match outcome {
        BootOutcome::Failover { from, to, reason } => {
            assert_eq!((from, to), (Slot::A, Slot::B));
            assert!(reason.contains("4 unconfirmed boots"), "{reason}");
        }
        other => panic!("expected failover, got {other:?}"),
    }
    let state = fx.state();
    assert_eq!(state.active, Slot::B);
    assert_eq!(state.boot_failure_count, 0);
    assert!(fx.manager.repairs().get(Slot::A).unwrap().is_some());
    assert_eq!(fx.bootloader.set_calls(), vec![Slot::B]);
}

#[test]
fn max_boot_attempts_is_configurable() {
    let fx = Fixture::builder()
        .max_boot_attempts(1)
        .state(SystemState {
            boot_failure_count: 1,
            ..SystemState::first_run(Slot::A)
        })
        .build();

    let outcome = fx.manager.boot_check().unwrap();

    assert!(!outcome.proceed());
    assert_eq!(fx.state().active, Slot::B);
}

#[test]
fn unhealthy_active_fails_over_immediately() {
    let fx = Fixture::builder().build();
    fx.corrupt(Slot::A);

    let outcome = fx.manager.boot_check().unwrap();

    assert!(matches!(outcome, BootOutcome::Failover { to: Slot::B, .. }));
    let state = fx.state();
    assert_eq!(state.active, Slot::B);
    assert_eq!(state.partition_a.health, 10);
    assert_eq!(state.partition_b.health, 100);
}

#[test]
fn both_partitions_unhealthy_is_fatal_and_keeps_the_active_slot() {
    let fx = Fixture::builder().build();
    fx.corrupt(Slot::A);
    fx.corrupt(Slot::B);

    let err = fx.manager.boot_check().unwrap_err();

    assert!(
        matches!(
            err,
            Error::InsufficientStandbyHealth { slot: Slot::B, score: 20, required: 50 }
        ),
        "{err:?}"
    );
    let state = fx.state();
    assert_eq!(state.active, Slot::A);
    assert_eq!(state.standby, Slot::B);
    assert_eq!(state.boot_failure_count, 1);
    // Only the counter moved; the low score was not recorded.
    assert_eq!(state.partition_a, SystemState::first_run(Slot::A).partition_a);
    assert!(fx.bootloader.set_calls().is_empty());
    assert!(fx.manager.repairs().get(Slot::A).unwrap().is_none());
}

#[test]
fn disabled_failover_degrades_instead() {
    let fx = Fixture::builder().build();
    fx.manager.set_policy(None, Some(false)).unwrap();
    fx.corrupt(Slot::A);

    let outcome = fx.manager.boot_check().unwrap();

    match outcome {
        BootOutcome::Degraded { score, reason } => {
            assert_eq!(score, Some(10));
            assert!(reason.starts_with("failover disabled"), "{reason}");
        }
        other => panic!("expected degraded, got {other:?}"),
    }
    assert_eq!(fx.state().active, Slot::A);
    assert!(fx.bootloader.set_calls().is_empty());
}

#[test]
fn transient_check_failures_are_retried_once() {
    let fx = Fixture::builder().build();
    fx.fs.fail(Slot::A, 1);

    let outcome = fx.manager.boot_check().unwrap();

    assert_eq!(outcome, BootOutcome::HealthyContinue { score: 90 });
}

#[test]
fn persistent_check_failures_score_worst_case() {
    let fx = Fixture::builder().build();
    fx.fs.fail(Slot::A, u32::MAX);
    fx.set_disk(Slot::A, DiskHealth::Degraded);

    let report = fx.manager.inspect(Slot::A).unwrap();

    assert_eq!(report.sub_scores.filesystem, 0);
    assert_eq!(report.sub_scores.disk, 50);
    assert_eq!(report.score, 60);
    assert_eq!(report.anomalies.len(), 2, "{:?}", report.anomalies);
}

#[test]
fn inspect_scores_missing_and_tampered_files() {
    let fx = Fixture::builder().build();
    fx.remove(Slot::B, "sbin/init");
    fx.tamper(Slot::B, "usr/lib/libfoo.so");

    let report = fx.manager.inspect(Slot::B).unwrap();

    assert_eq!(report.sub_scores.critical_files, 80);
    assert_eq!(report.sub_scores.checksum, 0);
    assert_eq!(report.score, 74);
    assert_eq!(report.manifest_version.as_deref(), Some("1.0"));
    // Inspecting never writes.
    assert!(fx.manager.store().read_strict().unwrap().is_none());
}
