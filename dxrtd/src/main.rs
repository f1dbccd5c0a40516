//! `dxrtd` — the NPU-multiplexing scheduler daemon's entry point.
//!
//! Parses CLI args, loads the service config, wires the device pool into a
//! `ServiceFacade`, spawns the per-device reader threads and the liveness
//! watchdog, and drives the IPC receive loop on the main thread (§5: one
//! IPC thread, `ReaderThreads::num_dma_ch` reader threads per device, one
//! watchdog thread).

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use dxrt_core::config::ServiceConfig;
use dxrt_core::device::pool::DevicePool;
use dxrt_core::device::reader::ReaderThreads;
use dxrt_core::error::ErrorKind;
use dxrt_core::ipc::protocol::encode_server_message;
use dxrt_core::ipc::transport::PosixMqTransport;
use dxrt_core::ipc::IpcServer;
use dxrt_core::request::IpcServerMessage;
use dxrt_core::scheduler::{FifoPolicy, RoundRobinPolicy, SchedPolicyKind, SchedulerPolicy, SjfPolicy};
use dxrt_core::service::ServiceFacade;
use dxrt_core::watchdog::Watchdog;

/// NPU-multiplexing scheduler daemon.
#[derive(Parser, Debug)]
#[command(name = "dxrtd", version, about)]
struct Cli {
    /// Queue-order policy: FIFO, RoundRobin, or SJF.
    #[arg(short = 's', long = "scheduler", value_parser = SchedPolicyKind::from_str)]
    scheduler: Option<SchedPolicyKind>,

    /// Optional TOML config file; CLI flags and environment variables both
    /// take precedence over its values.
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Raise log verbosity by one level per occurrence (info -> debug -> trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = ServiceConfig::load(cli.config.as_deref()).context("failed to load service config")?;
    if let Some(policy) = cli.scheduler {
        config.scheduler_policy = policy;
    }

    log::info!(
        "dxrtd: starting with scheduler={:?} queue={}",
        config.scheduler_policy,
        config.ipc_queue_name
    );

    std::fs::create_dir_all(&config.dump_dir)
        .with_context(|| format!("failed to create dump dir {}", config.dump_dir.display()))?;

    let pool = Arc::new(DevicePool::discover().context("failed to discover devices")?);
    log::info!("dxrtd: discovered {} device(s)", pool.count());

    let transport = PosixMqTransport::open(&config.ipc_queue_name).context("failed to open IPC queue")?;
    let reply_handle = transport.reply_handle();
    let reply: dxrt_core::service::ReplySender = Arc::new(move |pid, msg: IpcServerMessage| {
        let bytes = encode_server_message(&msg).to_vec();
        if let Err(e) = reply_handle.send(pid as i64, &bytes) {
            log::warn!("dxrtd: failed to send reply to pid={pid}: {e}");
        }
    });

    match config.scheduler_policy {
        SchedPolicyKind::Fifo => run_with_policy(FifoPolicy::new(), pool, transport, reply, config),
        SchedPolicyKind::RoundRobin => run_with_policy(RoundRobinPolicy::new(), pool, transport, reply, config),
        SchedPolicyKind::Sjf => run_with_policy(SjfPolicy::new(), pool, transport, reply, config),
    }
}

fn run_with_policy<P: SchedulerPolicy + 'static>(
    policy: P,
    pool: Arc<DevicePool>,
    transport: PosixMqTransport,
    reply: dxrt_core::service::ReplySender,
    config: ServiceConfig,
) -> Result<()> {
    let facade = Arc::new(ServiceFacade::new(Arc::clone(&pool), policy, reply, config.dump_dir.clone()));

    let mut readers = Vec::new();
    for core in pool.all() {
        let scheduler = facade.scheduler();
        let dump_dir = config.dump_dir.clone();
        let on_complete = Arc::new(move |device_id: u32, resp| {
            scheduler.finish_jobs(device_id, resp);
        });

        let fault_facade = Arc::clone(&facade);
        let on_fault = Arc::new(move |device_id: u32, status: i32, _resp| {
            fault_facade.broadcast_error(ErrorKind::DeviceResponseFault, status, device_id as i32);
        });

        readers.push((Arc::clone(&core), ReaderThreads::spawn(core, dump_dir, on_complete, on_fault)));
    }

    let watchdog = Watchdog::new(Arc::clone(&facade));
    let (watchdog_handle, watchdog_stop) = watchdog.spawn();

    install_signal_handlers();

    let mut server = IpcServer::start(transport).context("failed to start IPC server")?;
    let handler_facade = Arc::clone(&facade);
    let result = server.run(move |msg| handler_facade.handle(msg));

    log::info!("dxrtd: shutting down");
    watchdog_stop.store(true, Ordering::SeqCst);
    let _ = watchdog_handle.join();
    for (core, reader) in readers {
        reader.shutdown(&core);
    }

    match result {
        Ok(()) => Ok(()),
        Err(_) if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("IPC server loop exited with error: {e}")),
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

/// Set by `SIGINT`/`SIGTERM`; the IPC receive loop's blocking syscall returns
/// `EINTR` on the next signal, `IpcServer::run` surfaces that as an error,
/// and `run_with_policy` checks this flag to tell a deliberate shutdown
/// apart from a genuine transport failure.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Installed once at startup; `SIGINT`/`SIGTERM` request a clean shutdown
/// (the IPC transport unblocks its `recv` loop on the next signal-interrupted
/// syscall and `run_with_policy` tears threads down), `SIGSEGV`/`SIGBUS`/
/// `SIGABRT` are logged before falling through to the default handler so a
/// crash still produces a core dump (§6).
fn install_signal_handlers() {
    extern "C" fn request_shutdown(_sig: libc::c_int) {
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    extern "C" fn log_fatal_and_reraise(sig: libc::c_int) {
        eprintln!("dxrtd: fatal signal {sig}, terminating");
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
    }

    unsafe {
        libc::signal(libc::SIGINT, request_shutdown as libc::sighandler_t);
        libc::signal(libc::SIGTERM, request_shutdown as libc::sighandler_t);
        libc::signal(libc::SIGSEGV, log_fatal_and_reraise as libc::sighandler_t);
        libc::signal(libc::SIGBUS, log_fatal_and_reraise as libc::sighandler_t);
        libc::signal(libc::SIGABRT, log_fatal_and_reraise as libc::sighandler_t);
    }
}
