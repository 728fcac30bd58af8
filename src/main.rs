use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use natcache::cli::{CacheArgs, Cli, Command, LookupArgs, SnapshotArgs};
use natcache::error::NatcacheError;
use natcache::model::ConnTuple;
use natcache::{Conntracker, output};

/// Global shutdown flag, set by signal handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGTERM,
            signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            signal_handler as *const () as libc::sighandler_t,
        );
    }
}

fn exit_code(err: &NatcacheError) -> i32 {
    match err {
        NatcacheError::InitTimeout(_) => 1,
        NatcacheError::EventSource(_) | NatcacheError::Io(_) => 2,
        _ => 4,
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code(&e));
        }
    }
}

fn run(cli: Cli) -> Result<(), NatcacheError> {
    install_signal_handlers();

    match cli.command {
        Command::Snapshot(args) => run_snapshot(&args),
        Command::Lookup(args) => run_lookup(&args),
    }
}

fn open_cache(args: &CacheArgs) -> Result<Conntracker, NatcacheError> {
    if args.all_namespaces && unsafe { libc::geteuid() } != 0 {
        log::warn!("--all-namespaces without root: other namespaces' tables may be unreadable");
    }
    Conntracker::new(args.to_config())
}

/// Follow live updates for the requested duration, then print stats.
fn run_snapshot(args: &SnapshotArgs) -> Result<(), NatcacheError> {
    let ct = open_cache(&args.cache)?;

    let duration = Duration::from_secs_f64(args.duration);
    let start = Instant::now();
    while start.elapsed() < duration {
        if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    let stats = ct.get_stats();
    let entries = args.entries.then(|| ct.entries());
    ct.close();

    log::info!(
        "snapshot after {:.1}s: {} entries",
        start.elapsed().as_secs_f64(),
        stats.get("state_size").copied().unwrap_or(0)
    );

    output::write_snapshot(
        &stats,
        entries.as_deref(),
        args.format,
        &mut io::stdout().lock(),
    )
}

fn run_lookup(args: &LookupArgs) -> Result<(), NatcacheError> {
    let ct = open_cache(&args.cache)?;

    let conn = ConnTuple::new(
        args.src.ip(),
        args.src.port(),
        args.dst.ip(),
        args.dst.port(),
        args.proto.into(),
    );
    let translation = ct.get_translation_for_conn(&conn);
    ct.close();

    output::write_lookup(
        &conn,
        translation.as_ref(),
        args.format,
        &mut io::stdout().lock(),
    )
}
