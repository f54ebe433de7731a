use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use apollo::{
    cli::{Cli, parse_args},
    config::load_config,
    daemon::{Apollo, PidGuard},
    scheduler::Scheduler,
};

fn main() {
    let args = parse_args();
    init_logging(&args);

    if let Err(err) = run(args) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

fn run(args: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = load_config(&args.config)?;
    if let Some(pid_file) = &args.pid_file {
        config.pid_file = PathBuf::from(pid_file);
    }

    info!(
        "Starting apollo for service '{}' on '{}' ({})",
        config.service_name, config.hostname, config.colo
    );

    let pid_guard = PidGuard::acquire(&config.pid_file)?;

    let apollo = Arc::new(Apollo::new(config)?);
    if let Err(err) = apollo.register_services() {
        // Registration failures are not fatal: the agent may still be
        // coming up, and re-registration is idempotent on the next start.
        error!("Service registration failed: {err}");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })?;

    let mut scheduler = Scheduler::new(Arc::clone(&apollo), shutdown)?;
    scheduler.run();

    pid_guard.release();
    info!("apollo stopped");
    Ok(())
}

fn init_logging(args: &Cli) {
    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
