mod activity;
mod config;
mod evict;
mod mounts;
mod orchestrator;
mod signals;
mod state_dir;
mod status;
mod timer;
mod unmount;

use activity::InotifyMonitor;
use clap::Parser;
use config::{DaemonConfig, Settings};
use evict::ProcFs;
use orchestrator::Orchestrator;
use signals::SignalHandler;
use state_dir::{InstanceLock, StateDir};
use status::{StatusFile, StatusTracker};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Watch a mounted filesystem for activity; once it has been idle for the
/// timeout, kill the processes holding it and unmount it. Then wait for the
/// next mount and start over.
#[derive(Parser, Debug)]
#[command(name = "idle-unmountd", version, about)]
pub struct Cli {
    /// Mountpoint to watch (absolute path)
    #[arg(short, long)]
    mountpoint: Option<PathBuf>,

    /// Seconds without activity before unmounting
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Unmount command; the mountpoint is passed as its last argument
    #[arg(short, long)]
    unmount_command: Option<String>,

    /// Also kill processes whose arguments name a path under the mountpoint
    #[arg(long)]
    match_cmdline: bool,

    /// Mount table to consult (default: /proc/self/mounts)
    #[arg(long)]
    mount_table: Option<PathBuf>,

    /// Config file path (TOML); command-line flags take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the status and lock files
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Append log output to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Stay in the foreground instead of detaching
    #[arg(short, long)]
    foreground: bool,

    /// Debug-level logging
    #[arg(short, long)]
    debug: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Print the status of the running instance and exit
    #[arg(long)]
    status: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match merged_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("idle-unmountd: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.status {
        return print_status(&config);
    }

    let mut settings = match config.into_settings() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("idle-unmountd: {e}");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = settings.resolve_paths() {
        eprintln!("idle-unmountd: cannot resolve paths: {e}");
        return ExitCode::FAILURE;
    }

    if cli.dry_run {
        println!("{settings:#?}");
        return ExitCode::SUCCESS;
    }

    if let Err(e) = init_logging(settings.log_file.as_deref(), cli.debug) {
        eprintln!("idle-unmountd: cannot open log file: {e}");
        return ExitCode::FAILURE;
    }
    tracing::debug!(?cli, "parsed CLI arguments");

    let (status_path, mut lock) = match claim_state_dir(&settings) {
        Ok(claimed) => claimed,
        Err(e) => {
            tracing::error!(error = %e, "cannot claim state directory");
            eprintln!("idle-unmountd: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.foreground {
        // A working directory inside the mount would keep it busy.
        if let Err(e) = std::env::set_current_dir("/") {
            tracing::warn!(error = %e, "cannot change to /");
        }
    } else {
        if let Some(warning) = detached_log_warning(settings.log_file.as_deref()) {
            tracing::warn!("{warning}");
        }
        if let Err(e) = nix::unistd::daemon(false, false) {
            tracing::error!(error = %e, "failed to detach");
            eprintln!("idle-unmountd: failed to detach: {e}");
            return ExitCode::FAILURE;
        }
        if let Some(lock) = lock.as_mut() {
            if let Err(e) = lock.record_pid() {
                tracing::warn!(error = %e, "cannot record pid in lock file");
            }
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };
    let code = runtime.block_on(serve(settings, status_path));
    runtime.shutdown_timeout(Duration::from_millis(100));
    code
}

/// Load the optional config file and lay the CLI flags over it.
fn merged_config(cli: &Cli) -> Result<DaemonConfig, config::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(mp) = &cli.mountpoint {
        config.mountpoint = Some(mp.clone());
    }
    if let Some(t) = cli.timeout {
        config.timeout_secs = Some(t);
    }
    if let Some(cmd) = &cli.unmount_command {
        config.unmount_command = Some(cmd.clone());
    }
    if cli.match_cmdline {
        config.match_cmdline = true;
    }
    if let Some(table) = &cli.mount_table {
        config.mount_table = table.clone();
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir = Some(dir.clone());
    }
    if let Some(file) = &cli.log_file {
        config.log_file = Some(file.clone());
    }
    Ok(config)
}

fn init_logging(log_file: Option<&Path>, debug: bool) -> std::io::Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

/// Detaching points stderr at /dev/null, so without a log file nothing the
/// daemon logs afterwards is kept.
fn detached_log_warning(log_file: Option<&Path>) -> Option<&'static str> {
    match log_file {
        Some(_) => None,
        None => Some("no --log-file given; log output is discarded once detached"),
    }
}

/// Create the state directory and take the per-mountpoint lock. Without a
/// state directory there is neither a status file nor a lock.
fn claim_state_dir(
    settings: &Settings,
) -> Result<(Option<PathBuf>, Option<InstanceLock>), Box<dyn std::error::Error>> {
    let Some(root) = &settings.state_dir else {
        return Ok((None, None));
    };
    let dir = StateDir::new(root, &settings.mountpoint);
    dir.init()
        .map_err(|e| format!("cannot create {}: {e}", dir.root().display()))?;
    let lock = dir.acquire_lock()?;
    Ok((Some(dir.status()), Some(lock)))
}

fn print_status(config: &DaemonConfig) -> ExitCode {
    let (Some(root), Some(mountpoint)) = (&config.state_dir, &config.mountpoint) else {
        eprintln!("idle-unmountd: --status needs --state-dir and --mountpoint");
        return ExitCode::from(2);
    };
    match StatusFile::new(StateDir::new(root, mountpoint).status()).read() {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("idle-unmountd: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(settings: Settings, status_path: Option<PathBuf>) -> ExitCode {
    let mut shutdown = match SignalHandler::install() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let status = StatusTracker::new(
        status_path,
        &settings.mountpoint,
        settings.timeout.as_secs(),
    );
    let mut orchestrator = Orchestrator::new(&settings, InotifyMonitor, ProcFs, status);

    let signal = tokio::select! {
        () = orchestrator.run() => return ExitCode::SUCCESS,
        signal = shutdown.recv() => signal,
    };

    tracing::info!(
        %signal,
        state = ?orchestrator.state(),
        cycles = orchestrator.status().cycles(),
        "shutting down"
    );
    orchestrator.status().remove();
    ExitCode::from(signals::exit_status(signal))
}
