//! `wdcap`: parallel, lossless packet-capture and merge pipeline.
//!
//! One executable plays both the supervisor and worker roles, splitting at a
//! `fork()` near the top of `main` before any threads exist. The supervisor keeps
//! a stable PID for process managers and restarts the worker on `SIGHUP`; the
//! worker owns the packet source, the processing threads, and the merge thread.

mod config_file;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use clap::Parser;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use wdcap_core::config::Config;
use wdcap_core::filter::AcceptAll;
use wdcap_core::message::ControlMessage;
use wdcap_core::processing::FirstPacketSync;
use wdcap_core::run_state::RunState;
use wdcap_core::source::{LivePacketSource, PacketSource};

/// Parallel, lossless packet-capture and merge pipeline.
#[derive(Parser, Debug)]
#[command(name = "wdcap", version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    config: std::path::PathBuf,

    /// Logging destination: terminal/stderr, file, syslog, or disabled/off/none.
    #[arg(short = 'l', long = "logmode", default_value = "terminal")]
    logmode: String,

    /// Increase log verbosity. Repeatable (-v, -vv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

fn init_logging(args: &Args) {
    match args.logmode.as_str() {
        "disabled" | "off" | "none" => return,
        "file" | "syslog" => {
            eprintln!(
                "logmode '{}' is not wired to a dedicated backend in this build; logging to stderr instead",
                args.logmode
            );
        }
        _ => {}
    }

    let level = if args.quiet {
        tracing::Level::ERROR
    } else {
        match args.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    };

    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

// --- Supervisor signal handling -------------------------------------------------

static SUPERVISOR_HALT: AtomicBool = AtomicBool::new(false);
static SUPERVISOR_RESTART: AtomicBool = AtomicBool::new(false);

extern "C" fn supervisor_handle_term(_: libc::c_int) {
    SUPERVISOR_HALT.store(true, Ordering::SeqCst);
}

extern "C" fn supervisor_handle_hup(_: libc::c_int) {
    SUPERVISOR_RESTART.store(true, Ordering::SeqCst);
}

fn install_supervisor_signal_handlers() {
    unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::Handler(supervisor_handle_term));
        let _ = signal::signal(Signal::SIGTERM, SigHandler::Handler(supervisor_handle_term));
        let _ = signal::signal(Signal::SIGHUP, SigHandler::Handler(supervisor_handle_hup));
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

// --- Worker signal handling ------------------------------------------------------

static WORKER_RUN_STATE: OnceLock<Arc<RunState>> = OnceLock::new();

extern "C" fn worker_handle_term(_: libc::c_int) {
    if let Some(rs) = WORKER_RUN_STATE.get() {
        rs.set_halted();
    }
}

extern "C" fn worker_handle_hup(_: libc::c_int) {
    if let Some(rs) = WORKER_RUN_STATE.get() {
        rs.set_restart_requested();
    }
}

fn install_worker_signal_handlers(run_state: Arc<RunState>) {
    let _ = WORKER_RUN_STATE.set(run_state);
    unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::Handler(worker_handle_term));
        let _ = signal::signal(Signal::SIGTERM, SigHandler::Handler(worker_handle_term));
        let _ = signal::signal(Signal::SIGHUP, SigHandler::Handler(worker_handle_hup));
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

/// Runs the worker body. Called only from the child side of `fork()`; never
/// returns to the caller's stack on the child path in practice, since `main`
/// exits the process immediately afterward.
fn run_worker(config: Arc<Config>) {
    let run_state = Arc::new(RunState::new());
    install_worker_signal_handlers(Arc::clone(&run_state));

    // SAFETY: set before any other thread exists in this freshly-forked process.
    unsafe {
        std::env::set_var("LIBTRACEIO", "nothreads");
    }

    if let Err(e) = wdcap_core::pidfile::write_pid(&config.pidfile_path, std::process::id()) {
        tracing::error!(error = %e, "failed to write pidfile");
    }

    let (tx, rx) = crossbeam_channel::unbounded();
    let main_tx = tx.clone();

    let merge_handle = {
        let config = Arc::clone(&config);
        std::thread::spawn(move || {
            if let Err(e) = wdcap_core::merge::run_merge_thread(config, rx) {
                tracing::error!(error = %e, "merge thread exited with error");
            }
        })
    };

    // Every processing thread rendezvous-aligns on the first packet via
    // `FirstPacketSync`, which blocks until exactly `thread_count` threads have
    // proposed a value. Opening all sources before spawning any thread means that
    // if one fails, no thread is started at all — a partially-spawned fleet would
    // otherwise deadlock forever waiting on proposals that can never arrive.
    let mut processing_handles = Vec::with_capacity(config.thread_count);
    let mut sources: Vec<Box<dyn PacketSource>> = Vec::with_capacity(config.thread_count);
    for thread_id in 0..config.thread_count {
        match LivePacketSource::open(&config.input_uri, 0) {
            Ok(s) => sources.push(Box::new(s)),
            Err(e) => {
                tracing::error!(error = %e, thread_id, "failed to open packet source");
                run_state.set_halted();
                break;
            }
        }
    }

    if sources.len() == config.thread_count {
        let first_sync = Arc::new(FirstPacketSync::new(config.thread_count));
        for (thread_id, source) in sources.into_iter().enumerate() {
            let config = Arc::clone(&config);
            let run_state = Arc::clone(&run_state);
            let first_sync = Arc::clone(&first_sync);
            let tx = tx.clone();
            let filter: Arc<dyn wdcap_core::filter::PacketFilter> = Arc::new(AcceptAll);
            processing_handles.push(std::thread::spawn(move || {
                if let Err(e) = wdcap_core::processing::run_processing_thread(
                    thread_id, config, source, filter, first_sync, tx, run_state,
                ) {
                    tracing::error!(error = %e, thread_id, "processing thread exited with error");
                }
            }));
        }
    }
    drop(tx);

    while !run_state.is_halted() {
        std::thread::sleep(Duration::from_millis(100));
    }

    for handle in processing_handles {
        let _ = handle.join();
    }
    let _ = main_tx.send(ControlMessage::Stop);
    let _ = merge_handle.join();
}

/// Forks a fresh worker for `config`. The child runs [`run_worker`] and exits the
/// process directly; only the parent's branch returns.
fn fork_worker(config: Arc<Config>) -> nix::Result<Pid> {
    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            run_worker(config);
            std::process::exit(0);
        }
    }
}

fn run_supervisor(args: &Args, mut config: Arc<Config>) -> ExitCode {
    install_supervisor_signal_handlers();

    let mut worker_pid = match fork_worker(Arc::clone(&config)) {
        Ok(pid) => pid,
        Err(e) => {
            tracing::error!(error = %e, "failed to fork initial worker");
            return ExitCode::FAILURE;
        }
    };
    let mut expecting_exit: Option<Pid> = None;

    loop {
        if SUPERVISOR_HALT.load(Ordering::SeqCst) {
            let _ = signal::kill(worker_pid, Signal::SIGTERM);
            let _ = waitpid(worker_pid, None);
            break;
        }

        if SUPERVISOR_RESTART.swap(false, Ordering::SeqCst) {
            tracing::info!("reconfiguring: restarting worker");
            let _ = signal::kill(worker_pid, Signal::SIGHUP);
            expecting_exit = Some(worker_pid);

            match config_file::load(&args.config) {
                Ok(new_config) => config = Arc::new(new_config),
                Err(e) => {
                    tracing::error!(error = %e, "failed to reload configuration; keeping previous config");
                }
            }

            match fork_worker(Arc::clone(&config)) {
                Ok(pid) => worker_pid = pid,
                Err(e) => {
                    tracing::error!(error = %e, "failed to fork replacement worker");
                    return ExitCode::FAILURE;
                }
            }
        }

        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                if Some(pid) == expecting_exit {
                    expecting_exit = None;
                } else if pid == worker_pid {
                    tracing::error!(%pid, "worker exited unexpectedly");
                    return ExitCode::FAILURE;
                }
            }
            _ => {}
        }

        std::thread::sleep(Duration::from_millis(100));
    }

    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    let config = match config_file::load(&args.config) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    run_supervisor(&args, config)
}
