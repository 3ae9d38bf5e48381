//! Whack CLI - hosts XMPP external components from a home directory.
//!
//! ```text
//! whack <home>
//! ```
//!
//! Loads `<home>/whack.json`, deploys every bundle found in
//! `<home>/components`, then runs until SIGINT, SIGTERM or SIGHUP.
//!
//! Exit codes: 0 on clean shutdown, 1 when configuration cannot be loaded
//! or no component could be bound.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use whack::{ComponentLoader, ComponentRegistry, Config};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// How long startup waits for the first scan pass.
const FIRST_SCAN_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "whack")]
#[command(version)]
#[command(about = "XMPP external component host")]
struct Cli {
    /// Home directory holding whack.json and the components directory.
    home: PathBuf,
}

fn init_logging() -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Ok(path) = std::env::var("WHACK_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

fn register_signals() -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;
    Ok(())
}

/// Run until a shutdown signal; `Ok(false)` means nothing could be bound.
fn run(cli: &Cli) -> Result<bool> {
    let config = Config::load(&cli.home).context("Failed to load configuration")?;
    let manager = config
        .build_manager()
        .context("Failed to start connection runtime")?;
    log::info!(
        "Whack v{} connecting to {}:{} as *.{}",
        env!("CARGO_PKG_VERSION"),
        config.server.host,
        config.server.port,
        config.server.domain()
    );

    let loader = ComponentLoader::new(
        Config::components_dir(&cli.home),
        Arc::clone(&manager),
        ComponentRegistry::new(),
        config.loader_options(),
    );
    loader.start().context("Failed to start component loader")?;

    if !loader.wait_for_first_scan(FIRST_SCAN_TIMEOUT) {
        log::warn!("First scan did not finish within {FIRST_SCAN_TIMEOUT:?}");
    }
    if manager.subdomains().is_empty() {
        log::error!("No components loaded. Exiting.");
        loader.shutdown();
        manager.shutdown_all();
        return Ok(false);
    }
    log::info!("Serving {}", manager.subdomains().join(", "));

    while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("Shutting down...");
    loader.shutdown();
    manager.shutdown_all();
    Ok(true)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging() {
        eprintln!("Error: {e:#}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = register_signals() {
        log::error!("Failed to register signal handlers: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
