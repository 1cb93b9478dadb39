//! Sales role: provision the run, launch every child, drive the rendezvous and
//! tear everything down again.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use tracing::{info, warn};

use crate::config::SalesConfig;
use crate::error::{SimError, SimResult};
use crate::semaphore::{LogLock, Rendezvous};
use crate::shared_state::OrderSnapshot;
use crate::signals;
use crate::teardown::{ChildRole, Provisioned, ReapOutcome, ShutdownContext};
use crate::types::{ResourceNames, WorkerSpec};

/// How a Sales run ended. Both variants are orderly exits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SalesOutcome {
    Completed(OrderSnapshot),
    Interrupted(libc::c_int),
}

/// Run one order end to end, launching children from `program`.
pub fn run(config: &SalesConfig, program: &Path, out: &mut impl Write) -> SimResult<SalesOutcome> {
    config.validate()?;
    let names = config.names();
    let (mut ctx, resources) =
        ShutdownContext::provision(&names, config.queue_depth).map_err(|err| {
            if err.is_already_exists() {
                warn!(
                    prefix = %config.ipc_prefix,
                    "resources left over from an earlier run; \
                     remove them or pick another --ipc-prefix"
                );
            }
            SimError::Provisioning(err)
        })?;
    resources
        .order()
        .initialize(config.order_size, config.workers);
    info!(
        order_size = config.order_size,
        workers = config.workers,
        prefix = %config.ipc_prefix,
        "order provisioned"
    );

    let outcome = drive(config, program, &names, &mut ctx, &resources, out);
    if let Err(err) = &outcome {
        warn!(error = %err, "aborting run");
        ctx.forward(libc::SIGTERM);
        ctx.collect_terminated();
    }
    ctx.release();
    outcome
}

fn drive(
    config: &SalesConfig,
    program: &Path,
    names: &ResourceNames,
    ctx: &mut ShutdownContext,
    resources: &Provisioned,
    out: &mut impl Write,
) -> SimResult<SalesOutcome> {
    signals::install(&names.done).map_err(SimError::Provisioning)?;
    let rendezvous = &resources.rendezvous;

    let stdout = log_file(&config.supervisor_log(), ChildRole::Supervisor, false)?;
    ctx.spawn(
        ChildRole::Supervisor,
        supervisor_command(config, program, names).stdout(Stdio::from(stdout)),
    )?;

    let mut rng = rand::rng();
    for id in 1..=config.workers {
        if let Some(signal) = signals::pending() {
            return interrupt(signal, ctx, rendezvous, out);
        }
        let spec = WorkerSpec::draw(id, &mut rng, &config.capacity, &config.duration_ms);
        let role = ChildRole::Factory(id);
        let stdout = log_file(&config.factory_log(), role, true)?;
        ctx.spawn(
            role,
            factory_command(program, &spec, names).stdout(Stdio::from(stdout)),
        )?;
        writeln!(
            out,
            "SALES: Factory # {:3} was created, with Capacity={:4} and Duration={:4}",
            spec.id, spec.capacity, spec.duration_ms
        )?;
        out.flush()?;
    }

    rendezvous.await_done()?;
    if let Some(signal) = signals::pending() {
        return interrupt(signal, ctx, rendezvous, out);
    }
    writeln!(out, "SALES: Supervisor says all Factories have completed their mission")?;
    out.flush()?;

    thread::sleep(config.settle_delay);
    if let Some(signal) = signals::pending() {
        return interrupt(signal, ctx, rendezvous, out);
    }
    writeln!(out, "SALES: Permission granted to print the final report")?;
    out.flush()?;
    rendezvous.grant_print()?;

    writeln!(out, "SALES: Cleaning up after the Supervisor Factory Processes")?;
    out.flush()?;
    if let ReapOutcome::Interrupted(signal) = ctx.reap_all() {
        return interrupt(signal, ctx, rendezvous, out);
    }

    let order = resources.order();
    let snapshot = resources.log_lock.critical(|| order.snapshot())?;
    writeln!(
        out,
        "SALES: Final order state: made={} remain={} active factories={}",
        snapshot.made, snapshot.remain, snapshot.active_count
    )?;
    if !snapshot.is_balanced() {
        warn!(?snapshot, "order counters do not add up");
    }
    writeln!(out, "\nAu revoir\n")?;
    out.flush()?;
    Ok(SalesOutcome::Completed(snapshot))
}

/// Forward the shutdown signal, wake anything parked on phase one, and wait
/// for the children before the caller releases.
fn interrupt(
    signal: libc::c_int,
    ctx: &mut ShutdownContext,
    rendezvous: &Rendezvous,
    out: &mut impl Write,
) -> SimResult<SalesOutcome> {
    writeln!(out, "{} ({signal})", signals::describe(signal))?;
    out.flush()?;
    info!(signal, children = ctx.live_children(), "shutting down on signal");
    ctx.forward(signal);
    if let Err(err) = rendezvous.announce_done() {
        warn!(error = %err, "failed to raise done signal during shutdown");
    }
    ctx.collect_terminated();
    writeln!(out, "\nAu revoir\n")?;
    out.flush()?;
    Ok(SalesOutcome::Interrupted(signal))
}

fn supervisor_command(config: &SalesConfig, program: &Path, names: &ResourceNames) -> Command {
    let mut command = Command::new(program);
    command
        .arg("supervisor")
        .arg(config.workers.to_string())
        .arg(&names.order)
        .arg(&names.progress)
        .arg(&names.done)
        .arg(&names.print)
        .arg(&names.log_lock)
        .stdin(Stdio::null());
    command
}

fn factory_command(program: &Path, spec: &WorkerSpec, names: &ResourceNames) -> Command {
    let mut command = Command::new(program);
    command
        .arg("factory")
        .arg(spec.id.to_string())
        .arg(spec.capacity.to_string())
        .arg(spec.duration_ms.to_string())
        .arg(&names.order)
        .arg(&names.progress)
        .arg(&names.log_lock)
        .stdin(Stdio::null());
    command
}

/// The supervisor log is truncated per run; the factories share one log in
/// append mode so their lock-serialised lines never overwrite each other.
fn log_file(path: &Path, role: ChildRole, append: bool) -> SimResult<File> {
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options.open(path).map_err(|source| SimError::Spawn {
        role: role.to_string(),
        source,
    })
}
