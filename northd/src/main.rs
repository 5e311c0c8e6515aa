#![cfg_attr(test, allow(clippy::unwrap_used))]

//! `ovn-northd`: translates the northbound network intent into the
//! southbound state consumed by the per-hypervisor controllers.

use crate::control::Control;
use crate::eventloop::Eventloop;
use crate::store::Store;
use anyhow::{Context as _, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::layer;

mod control;
mod eventloop;
mod store;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");

    match runtime.block_on(try_main(cli)) {
        Ok(()) => {
            tracing::info!("Goodbye!");

            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");

            ExitCode::FAILURE
        }
    }
}

async fn try_main(cli: Cli) -> Result<()> {
    logging::setup_global_subscriber(cli.log, layer::Identity::default())
        .context("Failed to set up logging")?;

    let control = Control::bind(&cli.unixctl)?;
    let store = Store::new(cli.nb_db, cli.sb_db);

    Eventloop::new(store, Duration::from_millis(cli.poll_interval_ms))
        .run(control)
        .await
}

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path of the northbound database document.
    #[arg(long, env = "OVN_NB_DB", default_value = "ovnnb.json")]
    nb_db: PathBuf,

    /// Path of the southbound database document.
    #[arg(long, env = "OVN_SB_DB", default_value = "ovnsb.json")]
    sb_db: PathBuf,

    /// Path of the control socket answering exit/pause/resume/is-paused.
    #[arg(long, env = "OVN_NORTHD_UNIXCTL", default_value = "ovn-northd.ctl")]
    unixctl: PathBuf,

    /// How often to poll the databases for changes, in milliseconds.
    #[arg(long, default_value_t = 500)]
    poll_interval_ms: u64,

    /// Log directives, same syntax as RUST_LOG.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory as _;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }
}
