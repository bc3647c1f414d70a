use std::{fs, os::unix::fs::symlink};

use orb_ab_manager::{
    Error, Slot,
    health::FsVerdict,
    repair::job::RepairJob,
    test_utils::Fixture,
};

#[test]
fn repair_restores_the_standby_from_the_active_slot() {
    let fx = Fixture::builder().build();
    let a = fx.partition_root(Slot::A);
    let b = fx.partition_root(Slot::B);
    fx.remove(Slot::B, "boot/Image");
    fx.tamper(Slot::B, "etc/fstab");
    fs::write(b.join("usr/lib/stray.so"), b"leftover").unwrap();
    fs::write(b.join("tmp/keep-me"), b"scratch").unwrap();
    symlink("libfoo.so", a.join("usr/lib/libfoo.so.1")).unwrap();
    assert!(fx.manager.inspect(Slot::B).unwrap().score < 90);

    let outcome = fx.manager.request_repair(Slot::B).unwrap();

    assert_eq!((outcome.target, outcome.source), (Slot::B, Slot::A));
    assert_eq!(outcome.score, 100);
    assert!(outcome.stats.copied >= 3, "{:?}", outcome.stats);
    assert_eq!(outcome.stats.removed, 1);
    assert_eq!(
        fs::read(b.join("boot/Image")).unwrap(),
        fs::read(a.join("boot/Image")).unwrap()
    );
    assert!(!b.join("usr/lib/stray.so").exists());
    assert_eq!(
        fs::read_link(b.join("usr/lib/libfoo.so.1")).unwrap(),
        std::path::Path::new("libfoo.so")
    );
    // Excluded trees are left alone.
    assert_eq!(fs::read(b.join("tmp/keep-me")).unwrap(), b"scratch");

    let state = fx.state();
    assert_eq!(state.partition_b.health, 100);
    assert_eq!(state.partition_b.version.as_deref(), Some("1.0"));
    assert_eq!(
        state.partition_b.checksum,
        fx.manager.inspect(Slot::A).unwrap().manifest_digest
    );
    assert!(state.partition_b.last_verified.is_some());
    assert!(fx.manager.repairs().get(Slot::B).unwrap().is_none());
}

#[test]
fn repair_of_the_active_slot_is_refused() {
    let fx = Fixture::builder().build();

    let err = fx.manager.request_repair(Slot::A).unwrap_err();

    assert!(matches!(err, Error::RepairTargetActive(Slot::A)), "{err:?}");
    assert!(fx.manager.repairs().pending().is_empty());
}

#[test]
fn repair_from_an_unhealthy_source_leaves_the_target_alone() {
    let fx = Fixture::builder().build();
    fx.manager.set_policy(None, None).unwrap();
    fx.fs.set(Slot::A, FsVerdict::Damaged("bad blocks".into()));
    fx.remove(Slot::B, "bin/sh");
    let health_before = fx.state().partition_b.clone();

    let err = fx.manager.request_repair(Slot::B).unwrap_err();

    assert!(
        matches!(
            err,
            Error::InsufficientStandbyHealth { slot: Slot::A, score: 70, required: 80 }
        ),
        "{err:?}"
    );
    assert_eq!(fx.state().partition_b, health_before);
    assert!(!fx.partition_root(Slot::B).join("bin/sh").exists());
    // The marker stays so the repair service tries again later.
    assert!(fx.manager.repairs().get(Slot::B).unwrap().is_some());
}

#[test]
fn unverifiable_repair_keeps_the_marker() {
    let fx = Fixture::builder().build();
    // The target's filesystem stays damaged no matter what is copied onto it.
    fx.fs.set(Slot::B, FsVerdict::Damaged("bad superblock".into()));

    let err = fx.manager.request_repair(Slot::B).unwrap_err();

    assert!(
        matches!(err, Error::RepairVerificationFailed { slot: Slot::B, score: 70 }),
        "{err:?}"
    );
    assert_eq!(fx.state().partition_b.health, 70);
    assert!(fx.manager.repairs().get(Slot::B).unwrap().is_some());
}

#[test]
fn pending_repairs_skip_the_active_slot() {
    let fx = Fixture::builder().build();
    fx.manager.set_policy(None, None).unwrap();
    fx.remove(Slot::B, "etc/fstab");
    let repairs = fx.manager.repairs();
    repairs.schedule(&RepairJob::new(Slot::A, "test")).unwrap();
    repairs.schedule(&RepairJob::new(Slot::B, "test")).unwrap();

    let results = fx.manager.run_pending_repairs().unwrap();

    assert_eq!(results.len(), 1);
    let (slot, result) = &results[0];
    assert_eq!(*slot, Slot::B);
    assert_eq!(result.as_ref().unwrap().score, 100);
    assert!(fx.partition_root(Slot::B).join("etc/fstab").exists());
    assert!(repairs.get(Slot::A).unwrap().is_some());
    assert!(repairs.get(Slot::B).unwrap().is_none());
}

#[test]
fn demoted_slot_is_repaired_after_failover() {
    let fx = Fixture::builder().build();
    fx.manager.set_policy(None, None).unwrap();
    fx.remove(Slot::A, "sbin/init");
    fx.manager.failover().unwrap();

    let results = fx.manager.run_pending_repairs().unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, Slot::A);
    assert!(results[0].1.is_ok());
    assert!(fx.partition_root(Slot::A).join("sbin/init").exists());
    assert_eq!(fx.state().partition_a.health, 100);
}

#[test]
fn repairing_the_standby_discards_a_staged_update() {
    let fx = Fixture::builder().build();
    fx.manager.apply_update(&fx.image("2.0"), "2.0").unwrap();

    fx.manager.request_repair(Slot::B).unwrap();

    let state = fx.state();
    assert!(!state.update_pending);
    assert_eq!(state.partition_b.version.as_deref(), Some("1.0"));
    assert_eq!(
        fs::read_to_string(fx.partition_root(Slot::B).join("sbin/init")).unwrap(),
        "sbin/init 1.0\n"
    );
    assert!(matches!(
        fx.manager.activate_update().unwrap_err(),
        Error::NoPendingUpdate
    ));
}
