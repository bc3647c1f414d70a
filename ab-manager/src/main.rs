use std::{borrow::Cow, path::Path, process::ExitCode, sync::Arc};

use clap::Parser as _;
use color_eyre::eyre::WrapErr as _;
use orb_ab_manager::{
    AbManager, Args, Settings,
    program::{self, Cli, Exit},
    telemetry,
};
use tracing::{error, info};

const CFG_DEFAULT_PATH: &str = "/etc/orb-ab-manager.conf";
const ENV_VAR_PREFIX: &str = "ORB_AB_MANAGER_";
const CFG_ENV_VAR: &str = "ORB_AB_MANAGER_CONFIG";

fn main() -> ExitCode {
    if let Err(e) = telemetry::try_init(telemetry::SYSLOG_IDENTIFIER) {
        eprintln!("failed to initialize logging: {e}");
    }
    if let Err(e) = color_eyre::install() {
        error!("failed to install error report handler: {e}");
    }

    let cli = Cli::parse();
    match run(cli) {
        Ok(exit) => exit.into(),
        Err(err) => {
            error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> color_eyre::Result<Exit> {
    let config = get_config_source(&cli.args);
    let settings = Settings::get(&cli.args, &config, ENV_VAR_PREFIX)
        .wrap_err("failed reading settings")?;
    let manager = AbManager::from_settings(settings)
        .wrap_err("failed to initialize the partition manager")?;

    program::run(Arc::new(manager), cli.cmd, &mut std::io::stdout().lock())
}

fn get_config_source(args: &Args) -> Cow<'_, Path> {
    if let Some(config) = &args.config {
        info!("using config provided by command line argument: `{config}`");
        Cow::Borrowed(config.as_ref())
    } else if let Some(config) = figment::providers::Env::var(CFG_ENV_VAR) {
        info!("using config set in environment variable `{CFG_ENV_VAR}={config}`");
        Cow::Owned(std::path::PathBuf::from(config))
    } else {
        info!("using default config at `{CFG_DEFAULT_PATH}`");
        Cow::Borrowed(CFG_DEFAULT_PATH.as_ref())
    }
}
