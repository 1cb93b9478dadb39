mod channel;
mod config;
mod error;
mod factory;
mod ledger;
mod logging;
mod message;
mod procurement;
mod sales;
mod semaphore;
mod shared_state;
mod signals;
mod supervisor;
mod teardown;
#[cfg(test)]
mod testing;
mod types;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info, warn};

use crate::channel::ProgressQueue;
use crate::config::SalesConfig;
use crate::error::{SimError, SimResult};
use crate::factory::Factory;
use crate::sales::SalesOutcome;
use crate::semaphore::{LogLock, NamedSemaphore, Rendezvous};
use crate::shared_state::SharedSegment;
use crate::supervisor::Supervisor;
use crate::types::WorkerSpec;

/// Multi-process order fulfilment over POSIX shared memory, semaphores and
/// message queues.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Provision the run, launch the supervisor and factories, and clean up.
    Sales(SalesArgs),
    /// Collect factory reports and print the final report (launched by sales).
    Supervisor(SupervisorArgs),
    /// Produce parts against the shared order (launched by sales).
    Factory(FactoryArgs),
    /// Place an order with a remote factory server over UDP.
    Procurement(ProcurementArgs),
}

#[derive(Args, Debug)]
struct SalesArgs {
    /// Number of factories to launch.
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    workers: u32,
    /// Parts to manufacture.
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    order_size: u32,
    /// Smallest factory capacity drawn.
    #[arg(long, default_value_t = config::DEFAULT_MIN_CAPACITY)]
    min_capacity: u32,
    /// Largest factory capacity drawn.
    #[arg(long, default_value_t = config::DEFAULT_MAX_CAPACITY)]
    max_capacity: u32,
    /// Shortest batch duration drawn, in milliseconds.
    #[arg(long, default_value_t = config::DEFAULT_MIN_DURATION_MS)]
    min_duration_ms: u32,
    /// Longest batch duration drawn, in milliseconds.
    #[arg(long, default_value_t = config::DEFAULT_MAX_DURATION_MS)]
    max_duration_ms: u32,
    /// Pause between the supervisor's completion notice and print permission.
    #[arg(long, default_value_t = config::DEFAULT_SETTLE_DELAY_MS)]
    settle_delay_ms: u64,
    /// Stem of every shared resource name; must start with '/'.
    #[arg(long, default_value = config::DEFAULT_IPC_PREFIX)]
    ipc_prefix: String,
    /// Directory receiving supervisor.log and factory.log.
    #[arg(long, default_value = ".")]
    log_dir: PathBuf,
    /// Capacity of the progress queue, in messages.
    #[arg(long, default_value_t = config::DEFAULT_QUEUE_DEPTH)]
    queue_depth: usize,
}

impl From<SalesArgs> for SalesConfig {
    fn from(args: SalesArgs) -> Self {
        let mut config = SalesConfig::new(args.workers, args.order_size);
        config.capacity = args.min_capacity..=args.max_capacity;
        config.duration_ms = args.min_duration_ms..=args.max_duration_ms;
        config.settle_delay = Duration::from_millis(args.settle_delay_ms);
        config.ipc_prefix = args.ipc_prefix;
        config.log_dir = args.log_dir;
        config.queue_depth = args.queue_depth;
        config
    }
}

#[derive(Args, Debug)]
struct SupervisorArgs {
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    worker_count: u32,
    shm: String,
    channel: String,
    done: String,
    print: String,
    /// When given, the final order state is read under this lock.
    log_lock: Option<String>,
}

#[derive(Args, Debug)]
struct FactoryArgs {
    id: u32,
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    capacity: u32,
    duration_ms: u32,
    shm: String,
    channel: String,
    log_lock: String,
}

#[derive(Args, Debug)]
struct ProcurementArgs {
    order_size: u32,
    server_ip: IpAddr,
    port: u16,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version requests print to stdout and are not failures.
            let failed = err.use_stderr();
            let _ = err.print();
            return if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    logging::init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.role {
        Role::Sales(args) => {
            let _span = logging::role_span("sales", None).entered();
            let program =
                std::env::current_exe().context("locating the factory_line executable")?;
            let config = SalesConfig::from(args);
            let outcome = sales::run(&config, &program, &mut io::stdout().lock())
                .context("sales run failed")?;
            match outcome {
                SalesOutcome::Completed(snapshot) => info!(?snapshot, "order fulfilled"),
                SalesOutcome::Interrupted(signal) => info!(signal, "stopped on signal"),
            }
            Ok(())
        }
        Role::Supervisor(args) => {
            let _span = logging::role_span("supervisor", None).entered();
            run_supervisor(&args).context("supervisor failed")
        }
        Role::Factory(args) => {
            let _span = logging::role_span("factory", Some(args.id)).entered();
            run_factory(&args).with_context(|| format!("factory #{} failed", args.id))
        }
        Role::Procurement(args) => {
            let _span = logging::role_span("procurement", None).entered();
            let server = SocketAddr::new(args.server_ip, args.port);
            procurement::run(args.order_size, server, &mut io::stdout().lock())
                .context("procurement failed")?;
            Ok(())
        }
    }
}

fn run_supervisor(args: &SupervisorArgs) -> SimResult<()> {
    let segment = SharedSegment::open(&args.shm).map_err(SimError::Provisioning)?;
    let queue = ProgressQueue::open(&args.channel).map_err(SimError::Provisioning)?;
    let rendezvous =
        Rendezvous::attach(&args.done, &args.print).map_err(SimError::Provisioning)?;
    let log_lock = args
        .log_lock
        .as_deref()
        .map(NamedSemaphore::open)
        .transpose()
        .map_err(SimError::Provisioning)?;

    debug!(
        shm = segment.name(),
        channel = queue.name(),
        workers = args.worker_count,
        "attached"
    );

    let mut out = io::stdout().lock();
    let mut supervisor = Supervisor::new(&queue, args.worker_count);
    supervisor.drain(&mut out)?;

    let order = segment.state();
    let snapshot = match &log_lock {
        Some(lock) => lock.critical(|| order.snapshot())?,
        None => order.snapshot(),
    };
    supervisor.reconcile(&snapshot);
    supervisor.finish(&rendezvous, order, &mut out)
}

fn run_factory(args: &FactoryArgs) -> SimResult<()> {
    let segment = SharedSegment::open(&args.shm).map_err(SimError::Provisioning)?;
    let queue = ProgressQueue::open(&args.channel).map_err(SimError::Provisioning)?;
    let lock = NamedSemaphore::open(&args.log_lock).map_err(SimError::Provisioning)?;

    debug!(
        shm = segment.name(),
        channel = queue.name(),
        log_lock = lock.name(),
        "attached"
    );

    let spec = WorkerSpec::new(args.id, args.capacity, args.duration_ms);
    let summary =
        Factory::new(spec, segment.state(), &lock, &queue).run(&mut io::stdout().lock())?;
    if summary.undelivered > 0 {
        warn!(
            lost = summary.undelivered,
            "some production reports never reached the supervisor"
        );
    }
    debug!(?summary, "factory done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sales_options_flow_into_the_config() {
        let cli = Cli::try_parse_from([
            "factory_line",
            "sales",
            "3",
            "100",
            "--settle-delay-ms",
            "0",
            "--min-capacity",
            "30",
            "--max-capacity",
            "30",
            "--ipc-prefix",
            "/custom",
        ])
        .expect("parse");
        let Role::Sales(args) = cli.role else {
            panic!("expected the sales role");
        };
        let config = SalesConfig::from(args);
        assert_eq!(config.workers, 3);
        assert_eq!(config.capacity, 30..=30);
        assert_eq!(config.settle_delay, Duration::ZERO);
        assert_eq!(config.names().done, "/custom_done");
        assert_eq!(config.duration_ms, 500..=1200);
    }

    #[test]
    fn supervisor_log_lock_is_optional() {
        let cli = Cli::try_parse_from(["factory_line", "supervisor", "2", "/o", "/p", "/d", "/q"])
            .expect("parse");
        assert!(matches!(
            cli.role,
            Role::Supervisor(SupervisorArgs { log_lock: None, .. })
        ));
    }

    #[test]
    fn zero_workers_is_a_usage_failure() {
        let err = Cli::try_parse_from(["factory_line", "sales", "0", "10"]).expect_err("rejected");
        assert!(err.use_stderr());
    }

    #[test]
    fn help_is_not_a_failure() {
        let err = Cli::try_parse_from(["factory_line", "--help"]).expect_err("help short-circuits");
        assert!(!err.use_stderr());
    }
}
