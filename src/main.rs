mod common;
mod config;
mod logging;
mod selfupdate;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use serde::Serialize;

use crate::common::{PROJECT_NAME, PROJECT_VERSION};
use crate::config::AgentConfig;
use crate::logging::Logging;
use crate::selfupdate::cancel::Cancellation;
use crate::selfupdate::checker::UpdateChecker;
use crate::selfupdate::job::SelfUpdateJob;
use crate::selfupdate::lock::LockManager;
use crate::selfupdate::orchestrator::{UpgradeParams, Upgrader};
use crate::selfupdate::preflight::PreflightChecker;
use crate::selfupdate::service::SystemdController;
use crate::selfupdate::signing::EnvSigner;
use crate::selfupdate::staging::StagingManager;
use crate::selfupdate::state::StateWriter;

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct UserArgs {
    #[command(subcommand)]
    command: Command,

    /// Verbose
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent stand-in and register the periodic self-update job.
    Run,

    /// Drive the upgrade state machine directly (invoked by the spawned
    /// staged binary, or manually by an operator).
    Upgrade(UpgradeArgs),
}

#[derive(clap::Args)]
pub struct UpgradeArgs {
    /// Path the binary should be installed to.
    #[arg(long)]
    install_path: PathBuf,

    /// Identifier generated by the periodic pipeline for this attempt.
    #[arg(long)]
    update_id: String,

    /// Version of the binary being replaced, used for rollback health
    /// verification.
    #[arg(long)]
    source_version: String,

    /// Preempt any existing lock, even one held by a live owner.
    #[arg(long)]
    force: bool,
}

fn init_logging(verbose: bool) -> Result<()> {
    if verbose {
        Logging::new().start()
    } else {
        let file_name = format!("{PROJECT_NAME}.log");
        Logging::new().with_file(file_name).start()
    }
}

fn main() -> Result<()> {
    let args = UserArgs::parse();
    init_logging(args.verbose)?;

    match args.command {
        Command::Run => run(),
        Command::Upgrade(args) => upgrade(&args),
    }
}

fn run() -> Result<()> {
    let config = AgentConfig::load().context("unable to load agent configuration")?;
    common::print_header();
    info!("starting {PROJECT_NAME} {PROJECT_VERSION}, service={}", config.service_name);

    let updates_dir = common::updates_dir()?;
    let staging = StagingManager::new(updates_dir.join("staging"));
    let preflight = PreflightChecker::new(PathBuf::from(&config.install_path), updates_dir.clone());
    let lock = LockManager::new(updates_dir.join("update.lock"));
    let state = StateWriter::new(updates_dir.join("state.json"));
    let signer = Arc::new(EnvSigner);
    let checker = UpdateChecker::new(config.control_plane_url.clone(), config.agent_id.clone(), signer)
        .context("invalid update checker configuration")?;

    let job = SelfUpdateJob::new(
        checker,
        preflight,
        lock,
        state,
        staging,
        PathBuf::from(&config.install_path),
        PROJECT_VERSION.to_string(),
        updates_dir.join("poll_state.json"),
    )
    .with_interval(config.poll_interval());

    let root_cancel = Cancellation::new();
    let handle = job.register(&root_cancel);

    wait_for_shutdown_signal();
    info!("shutdown requested, stopping self-update job");
    handle.shutdown();
    Ok(())
}

#[cfg(unix)]
fn wait_for_shutdown_signal() {
    use std::sync::atomic::{AtomicBool, Ordering};

    static SHUTDOWN: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_signal(_sig: libc::c_int) {
        SHUTDOWN.store(true, Ordering::SeqCst);
    }

    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }

    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(250));
    }
}

#[cfg(not(unix))]
fn wait_for_shutdown_signal() {
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

#[derive(Serialize)]
struct UpgradeOutcome<'a> {
    update_id: &'a str,
    state: &'static str,
    error: Option<String>,
}

fn upgrade(args: &UpgradeArgs) -> Result<()> {
    let config = AgentConfig::load().context("unable to load agent configuration")?;
    let updates_dir = common::updates_dir()?;

    let lock = LockManager::new(updates_dir.join("update.lock"));
    let state = StateWriter::new(updates_dir.join("state.json"));
    let service = SystemdController::new(config.service_name.clone());
    let health = crate::selfupdate::health::HealthChecker::new(config.health_url.clone());

    if args.force {
        lock.force_lock(Duration::from_secs(5 * 60))
            .context("unable to force-acquire update lock")?;
        lock.unlock().ok();
    }

    let params = UpgradeParams {
        install_path: args.install_path.clone(),
        backup_dir: updates_dir.join("backup"),
        update_id: args.update_id.clone(),
        source_version: args.source_version.clone(),
        target_version: PROJECT_VERSION.to_string(),
    };

    let cancel = Cancellation::new();
    let upgrader = Upgrader::new(params, lock, state, &service, &health);

    let result = upgrader.run(&cancel);

    let outcome = match &result {
        Ok(()) => UpgradeOutcome {
            update_id: &args.update_id,
            state: "Completed",
            error: None,
        },
        Err(e) => UpgradeOutcome {
            update_id: &args.update_id,
            state: "RolledBack",
            error: Some(e.to_string()),
        },
    };

    let line = serde_json::to_string(&outcome).unwrap_or_default();
    match &result {
        Ok(()) => info!("{line}"),
        Err(_) => error!("{line}"),
    }

    result
}
