use orb_ab_manager::{
    Slot,
    health::FsVerdict,
    program::Exit,
    test_utils::Fixture,
};

#[test]
fn boot_check_exits_with_reboot_request_after_failover() {
    let fx = Fixture::builder().build();
    fx.corrupt(Slot::A);

    let (exit, out) = fx.run("boot-check").unwrap();

    assert_eq!(exit, Exit::FailedOver);
    let outcome: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(outcome["outcome"], "failover");
    assert_eq!(outcome["to"], "b");
}

#[test]
fn healthy_boot_check_succeeds() {
    let fx = Fixture::builder().build();

    let (exit, out) = fx.run("boot-check").unwrap();

    assert_eq!(exit, Exit::Success);
    assert!(out.contains("healthy_continue"), "{out}");
}

#[test]
fn status_prints_state_and_pending_repairs() {
    let fx = Fixture::builder().build();
    fx.fs.set(Slot::A, FsVerdict::Damaged("scripted".into()));
    fx.run("boot-check").unwrap();

    let (_, out) = fx.run("status").unwrap();

    let status: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(status["state"]["active"], "a");
    assert_eq!(status["state"]["boot_failure_count"], 1);
    assert_eq!(status["pending_repairs"][0]["target"], "a");
}

#[test]
fn policy_toggles() {
    let fx = Fixture::builder().build();

    let (_, out) = fx.run("policy --auto-repair off").unwrap();
    assert_eq!(out.trim(), "auto repair: off, failover: on");

    let (_, out) = fx.run("policy --failover off --auto-repair on").unwrap();
    assert_eq!(out.trim(), "auto repair: on, failover: off");

    let (_, out) = fx.run("policy").unwrap();
    assert_eq!(out.trim(), "auto repair: on, failover: off");
}

#[test]
fn repair_of_active_slot_fails() {
    let fx = Fixture::builder().build();

    let err = fx.run("repair a").unwrap_err();

    assert!(err.to_string().contains("active slot"), "{err}");
}

#[test]
fn update_through_the_cli() {
    let fx = Fixture::builder().build();
    let image = fx.image("2.0");

    fx.run(&format!("apply-update {} --version 2.0", image.display()))
        .unwrap();
    fx.run("activate-update").unwrap();
    assert_eq!(fx.state().active, Slot::B);

    fx.run("rollback").unwrap();
    assert_eq!(fx.state().active, Slot::A);
    assert!(fx.run("rollback").is_err());
}

#[test]
fn repair_pending_reports_failures() {
    let fx = Fixture::builder().build();
    fx.run("failover").unwrap();
    fx.fs.set(Slot::A, FsVerdict::Damaged("scripted".into()));

    let err = fx.run("repair-pending").unwrap_err();

    assert!(err.to_string().contains("1 repair(s) failed"), "{err}");
}

#[test]
fn ack_clears_attention() {
    let fx = Fixture::builder().build();

    let (_, out) = fx.run("ack").unwrap();

    assert_eq!(out.trim(), "nothing to acknowledge");
}

#[test]
fn slots_are_parsed_case_insensitively() {
    let fx = Fixture::builder().build();

    let (_, out) = fx.run("inspect B").unwrap();

    let report: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(report["slot"], "b");
    assert_eq!(report["score"], 100);
}
