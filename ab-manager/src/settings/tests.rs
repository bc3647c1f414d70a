// NOTE: each test uses its own env var prefix so that tests running concurrently
// can't observe each other's environment.

use std::{path::Path, time::Duration};

use clap::Parser;
use figment::Jail;

use crate::{
    Error, Slot,
    settings::{Args, BootloaderKind, MounterKind, Settings},
};

const CFG_FILE_CONTENTS: &str = r#"
    state_path = "/config/state.json"
    repair_dir = "/config/repair"
    mounter = "passthrough"
    bootloader = "grub"
    grubenv = "/config/grubenv"
    max_boot_attempts = 5
    fsck_timeout = 3000

    [partition_a]
    device = "/dev/config_a"
    fstype = "ext4"
    disk = "/dev/config_disk"
    boot_entry = "entry-a"

    [partition_b]
    device = "/dev/config_b"
    fstype = "ext4"
    disk = "/dev/config_disk"
    boot_entry = "entry-b"
"#;

#[derive(Debug, Parser)]
struct TestCli {
    #[command(flatten)]
    args: Args,
}

fn make_args(args: &str) -> Result<Args, clap::Error> {
    TestCli::try_parse_from(str::split_ascii_whitespace(args)).map(|cli| cli.args)
}

#[test]
fn defaults_apply_without_any_source() {
    Jail::expect_with(|_jail| {
        let args = make_args("orb-ab-manager").unwrap();
        let settings = Settings::get(&args, "missing.toml", "ab_defaults_")?;
        assert_eq!(settings, Settings::default());
        assert!(settings.validate().is_ok());
        Ok(())
    })
}

#[test]
fn config_file_overrides_defaults() {
    Jail::expect_with(|jail| {
        jail.create_file("config.toml", CFG_FILE_CONTENTS)?;
        let args = make_args("orb-ab-manager").unwrap();
        let settings = Settings::get(&args, "config.toml", "ab_config_")?;

        assert_eq!(settings.state_path, Path::new("/config/state.json"));
        assert_eq!(settings.repair_dir, Path::new("/config/repair"));
        assert_eq!(settings.mounter, MounterKind::Passthrough);
        assert_eq!(settings.bootloader, BootloaderKind::Grub);
        assert_eq!(settings.max_boot_attempts, 5);
        assert_eq!(settings.fsck_timeout, Duration::from_millis(3000));
        assert_eq!(settings.partition(Slot::B).device, Path::new("/dev/config_b"));
        assert_eq!(settings.partition(Slot::A).boot_entry, "entry-a");
        // Untouched keys keep their defaults.
        assert_eq!(settings.bootloader_retries, 3);
        assert_eq!(settings.excludes, Settings::default().excludes);
        Ok(())
    })
}

#[test]
fn env_overrides_config_file() {
    Jail::expect_with(|jail| {
        jail.create_file("config.toml", CFG_FILE_CONTENTS)?;
        jail.set_env("ab_env_state_path", "/env/state.json");
        jail.set_env("ab_env_max_boot_attempts", "7");
        jail.set_env("ab_env_partition_b__device", "/dev/env_b");
        let args = make_args("orb-ab-manager").unwrap();
        let settings = Settings::get(&args, "config.toml", "ab_env_")?;

        assert_eq!(settings.state_path, Path::new("/env/state.json"));
        assert_eq!(settings.max_boot_attempts, 7);
        assert_eq!(settings.partition_b.device, Path::new("/dev/env_b"));
        assert_eq!(settings.partition_b.boot_entry, "entry-b");
        assert_eq!(settings.repair_dir, Path::new("/config/repair"));
        Ok(())
    })
}

#[test]
fn cli_args_override_config_file_and_env_vars() {
    const CLI_ARGS: &str = r#"
    orb-ab-manager
        --state-path /args/state.json
        --repair-dir /args/repair
        --mounter system
        --bootloader efi
        --max-boot-attempts 2
        --fsck-timeout 1500
    "#;

    Jail::expect_with(|jail| {
        jail.create_file("config.toml", CFG_FILE_CONTENTS)?;
        jail.set_env("ab_args_state_path", "/env/state.json");
        jail.set_env("ab_args_max_boot_attempts", "7");
        let args = make_args(CLI_ARGS).unwrap();
        let settings = Settings::get(&args, "config.toml", "ab_args_")?;

        assert_eq!(settings.state_path, Path::new("/args/state.json"));
        assert_eq!(settings.repair_dir, Path::new("/args/repair"));
        assert_eq!(settings.mounter, MounterKind::System);
        assert_eq!(settings.bootloader, BootloaderKind::Efi);
        assert_eq!(settings.max_boot_attempts, 2);
        assert_eq!(settings.fsck_timeout, Duration::from_millis(1500));
        assert_eq!(settings.grubenv, Path::new("/config/grubenv"));
        Ok(())
    })
}

#[test]
fn validation_rejects_shared_device() {
    let mut settings = Settings::default();
    settings.partition_b.device = settings.partition_a.device.clone();
    assert!(matches!(settings.validate(), Err(Error::InvalidSettings(_))));
}

#[test]
fn validation_rejects_zero_attempts_and_absolute_manifest() {
    let settings = Settings {
        max_boot_attempts: 0,
        ..Settings::default()
    };
    assert!(matches!(settings.validate(), Err(Error::InvalidSettings(_))));

    let settings = Settings {
        manifest_path: "/etc/manifest.json".into(),
        ..Settings::default()
    };
    assert!(matches!(settings.validate(), Err(Error::InvalidSettings(_))));
}

#[test]
fn grub_requires_distinct_boot_entries() {
    let mut settings = Settings {
        bootloader: BootloaderKind::Grub,
        ..Settings::default()
    };
    assert!(settings.validate().is_ok());
    settings.partition_b.boot_entry = settings.partition_a.boot_entry.clone();
    assert!(matches!(settings.validate(), Err(Error::InvalidSettings(_))));
}
