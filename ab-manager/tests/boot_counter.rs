use orb_ab_manager::{
    BootOutcome, Slot,
    health::{DiskHealth, FsVerdict},
    test_utils::Fixture,
};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Condition {
    /// Scores 100.
    Healthy,
    /// Scores 70.
    Degraded,
    /// Scores 50.
    Failing,
}

fn apply(fx: &Fixture, slot: Slot, condition: Condition) {
    let (fs, disk) = match condition {
        Condition::Healthy => (FsVerdict::Clean, DiskHealth::Healthy),
        Condition::Degraded => (FsVerdict::Damaged("scripted".into()), DiskHealth::Healthy),
        Condition::Failing => {
            (FsVerdict::Damaged("scripted".into()), DiskHealth::Unreadable)
        }
    };
    fx.fs.set(slot, fs);
    fx.set_disk(slot, disk);
}

fn condition() -> impl Strategy<Value = Condition> {
    prop_oneof![
        Just(Condition::Healthy),
        Just(Condition::Degraded),
        Just(Condition::Failing),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn boot_failure_count_only_grows_until_reset(
        boots in prop::collection::vec((condition(), condition()), 1..12),
    ) {
        let fx = Fixture::builder().build();

        for (a, b) in boots {
            apply(&fx, Slot::A, a);
            apply(&fx, Slot::B, b);
            let before = fx.manager.get_status().unwrap().state;

            let result = fx.manager.boot_check();

            let after = fx.state();
            prop_assert_ne!(after.active, after.standby);
            match result {
                Ok(BootOutcome::HealthyContinue { .. } | BootOutcome::Failover { .. }) => {
                    prop_assert_eq!(after.boot_failure_count, 0);
                }
                // Repairs scheduled, or a failover refused.
                Ok(_) | Err(_) => {
                    prop_assert_eq!(after.boot_failure_count, before.boot_failure_count + 1);
                    prop_assert_eq!(after.active, before.active);
                }
            }
        }
    }
}
