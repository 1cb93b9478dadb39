//! Everything Sales provisions or spawns, and the one routine that releases it.
//!
//! Handles close on drop. Names are unlinked by [`ShutdownContext::release`],
//! which only touches names this process created and is safe to call from
//! both the normal path and the signal path, any number of times.

use std::fmt;
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::channel::ProgressQueue;
use crate::error::{IpcResult, SimError, SimResult};
use crate::semaphore::{NamedSemaphore, Rendezvous};
use crate::shared_state::{SharedOrderState, SharedSegment};
use crate::signals;
use crate::types::{ResourceNames, WorkerId};

/// Polling interval while reaping, so a pending signal is noticed promptly.
const REAP_POLL: Duration = Duration::from_millis(50);

/// Handles to the resources of one run.
#[derive(Debug)]
pub struct Provisioned {
    pub segment: SharedSegment,
    pub log_lock: NamedSemaphore,
    pub rendezvous: Rendezvous,
}

impl Provisioned {
    pub fn order(&self) -> &SharedOrderState {
        self.segment.state()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildRole {
    Supervisor,
    Factory(WorkerId),
}

impl fmt::Display for ChildRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildRole::Supervisor => f.write_str("supervisor"),
            ChildRole::Factory(id) => write!(f, "factory #{id}"),
        }
    }
}

#[derive(Debug)]
struct TrackedChild {
    role: ChildRole,
    child: Child,
    reaped: bool,
}

#[derive(Debug)]
enum OwnedName {
    Segment(String),
    Queue(String),
    Semaphore(String),
}

impl OwnedName {
    fn unlink(&self) -> IpcResult<()> {
        match self {
            OwnedName::Segment(name) => SharedSegment::unlink(name),
            OwnedName::Queue(name) => ProgressQueue::unlink(name),
            OwnedName::Semaphore(name) => NamedSemaphore::unlink(name),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReapOutcome {
    AllExited,
    Interrupted(libc::c_int),
}

/// Shutdown state shared by the normal and the signal-driven path.
#[derive(Debug, Default)]
pub struct ShutdownContext {
    owned: Vec<OwnedName>,
    children: Vec<TrackedChild>,
}

impl ShutdownContext {
    /// Exclusively create every resource of a run. On failure, whatever was
    /// already created is released before the error is returned.
    pub fn provision(names: &ResourceNames, queue_depth: usize) -> IpcResult<(Self, Provisioned)> {
        let mut ctx = Self::default();
        match ctx.create_all(names, queue_depth) {
            Ok(resources) => Ok((ctx, resources)),
            Err(err) => {
                ctx.release();
                Err(err)
            }
        }
    }

    fn create_all(&mut self, names: &ResourceNames, queue_depth: usize) -> IpcResult<Provisioned> {
        let segment = SharedSegment::create(&names.order)?;
        self.owned.push(OwnedName::Segment(names.order.clone()));

        // Only the children talk over the queue; Sales just owns the name.
        ProgressQueue::create(&names.progress, queue_depth)?;
        self.owned.push(OwnedName::Queue(names.progress.clone()));

        let log_lock = self.create_semaphore(&names.log_lock, 1)?;
        let done = self.create_semaphore(&names.done, 0)?;
        let print = self.create_semaphore(&names.print, 0)?;
        debug!(?names, "provisioned shared resources");

        Ok(Provisioned {
            segment,
            log_lock,
            rendezvous: Rendezvous::new(done, print),
        })
    }

    fn create_semaphore(&mut self, name: &str, initial: u32) -> IpcResult<NamedSemaphore> {
        let semaphore = NamedSemaphore::create(name, initial)?;
        self.owned.push(OwnedName::Semaphore(name.to_string()));
        Ok(semaphore)
    }

    /// Spawn a child and track it for forwarding and reaping.
    pub fn spawn(&mut self, role: ChildRole, command: &mut Command) -> SimResult<u32> {
        let child = command.spawn().map_err(|source| SimError::Spawn {
            role: role.to_string(),
            source,
        })?;
        let pid = child.id();
        debug!(%role, pid, "spawned child");
        self.children.push(TrackedChild {
            role,
            child,
            reaped: false,
        });
        Ok(pid)
    }

    /// Send `signal` to every child that has not been reaped yet.
    pub fn forward(&self, signal: libc::c_int) {
        for tracked in self.children.iter().filter(|c| !c.reaped) {
            let pid = tracked.child.id() as libc::pid_t;
            // SAFETY: plain syscall on a pid this process spawned and has not reaped.
            if unsafe { libc::kill(pid, signal) } != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    warn!(role = %tracked.role, pid, error = %err, "failed to forward signal");
                }
            }
        }
    }

    /// Wait for every child, returning early if a shutdown signal arrives.
    pub fn reap_all(&mut self) -> ReapOutcome {
        loop {
            let mut running = 0;
            for tracked in self.children.iter_mut().filter(|c| !c.reaped) {
                match tracked.child.try_wait() {
                    Ok(Some(status)) => Self::mark_reaped(tracked, status),
                    Ok(None) => running += 1,
                    Err(err) => {
                        warn!(role = %tracked.role, error = %err, "lost track of child");
                        tracked.reaped = true;
                    }
                }
            }
            if running == 0 {
                return ReapOutcome::AllExited;
            }
            if let Some(signal) = signals::pending() {
                return ReapOutcome::Interrupted(signal);
            }
            thread::sleep(REAP_POLL);
        }
    }

    /// Blocking wait for children already told to terminate.
    pub fn collect_terminated(&mut self) {
        for tracked in self.children.iter_mut().filter(|c| !c.reaped) {
            match tracked.child.wait() {
                Ok(status) => Self::mark_reaped(tracked, status),
                Err(err) => {
                    warn!(role = %tracked.role, error = %err, "failed to reap child");
                    tracked.reaped = true;
                }
            }
        }
    }

    fn mark_reaped(tracked: &mut TrackedChild, status: ExitStatus) {
        tracked.reaped = true;
        if status.success() {
            debug!(role = %tracked.role, "child exited");
        } else {
            warn!(role = %tracked.role, %status, "child exited abnormally");
        }
    }

    /// Children spawned and not yet reaped.
    pub fn live_children(&self) -> usize {
        self.children.iter().filter(|c| !c.reaped).count()
    }

    /// Unlink every name this process created. Later calls do nothing.
    pub fn release(&mut self) {
        if self.owned.is_empty() {
            return;
        }
        for owned in self.owned.drain(..) {
            match owned.unlink() {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    debug!(?owned, "already unlinked");
                }
                Err(err) => warn!(error = %err, "failed to release resource"),
            }
        }
        info!("shared resources released");
    }
}

impl Drop for ShutdownContext {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::unique_prefix;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn release_twice_is_harmless_and_frees_every_name() {
        let names = ResourceNames::with_prefix(&unique_prefix());
        let (mut ctx, resources) = ShutdownContext::provision(&names, 4).expect("provision");
        resources.order().initialize(10, 1);

        ctx.release();
        ctx.release();
        drop(resources);

        // Every name is free again, so a fresh exclusive provision succeeds.
        let (mut again, _resources) = ShutdownContext::provision(&names, 4).expect("re-provision");
        again.release();
        assert!(SharedSegment::open(&names.order).expect_err("gone").is_not_found());
        assert!(NamedSemaphore::open(&names.print).expect_err("gone").is_not_found());
    }

    #[test]
    fn stale_resources_are_rejected_and_left_alone() {
        let names = ResourceNames::with_prefix(&unique_prefix());
        let (mut first, resources) = ShutdownContext::provision(&names, 4).expect("provision");
        resources.order().initialize(77, 2);

        let err = ShutdownContext::provision(&names, 4).expect_err("stale run must be detected");
        assert!(err.is_already_exists());

        // The failed attempt must not have unlinked the first run's objects.
        let attached = SharedSegment::open(&names.order).expect("still present");
        assert_eq!(attached.state().order_size(), 77);
        NamedSemaphore::open(&names.done).expect("still present");

        first.release();
    }

    #[test]
    fn partial_provisioning_rolls_back_created_names() {
        let names = ResourceNames::with_prefix(&unique_prefix());
        // Occupy the last name so provisioning fails after four creations.
        let blocker = NamedSemaphore::create(&names.print, 0).expect("blocker");

        let err = ShutdownContext::provision(&names, 4).expect_err("print collides");
        assert!(err.is_already_exists());
        assert!(SharedSegment::open(&names.order).expect_err("rolled back").is_not_found());
        assert!(ProgressQueue::open(&names.progress).expect_err("rolled back").is_not_found());
        assert!(NamedSemaphore::open(&names.log_lock).expect_err("rolled back").is_not_found());
        assert!(NamedSemaphore::open(&names.done).expect_err("rolled back").is_not_found());

        drop(blocker);
        NamedSemaphore::unlink(&names.print).expect("unlink blocker");
    }

    #[test]
    fn forwarded_signal_terminates_children() {
        let mut ctx = ShutdownContext::default();
        for id in 1..=2 {
            ctx.spawn(ChildRole::Factory(id), Command::new("sleep").arg("30"))
                .expect("spawn sleep");
        }
        assert_eq!(ctx.live_children(), 2);

        ctx.forward(libc::SIGTERM);
        ctx.collect_terminated();
        assert_eq!(ctx.live_children(), 0);
        // Forwarding after reaping is a no-op.
        ctx.forward(libc::SIGTERM);
    }

    #[test]
    fn reap_waits_for_normal_exit() {
        let mut ctx = ShutdownContext::default();
        ctx.spawn(ChildRole::Supervisor, &mut Command::new("true"))
            .expect("spawn true");
        assert_eq!(ctx.reap_all(), ReapOutcome::AllExited);
        assert_eq!(ctx.live_children(), 0);
    }

    #[test]
    fn spawn_failure_names_the_role() {
        let mut ctx = ShutdownContext::default();
        let err = ctx
            .spawn(
                ChildRole::Factory(4),
                &mut Command::new("/nonexistent/factory_line"),
            )
            .expect_err("missing binary");
        match err {
            SimError::Spawn { role, .. } => assert_eq!(role, "factory #4"),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(ctx.live_children(), 0);
    }

    #[test]
    fn abnormal_status_is_still_reaped() {
        let status = ExitStatus::from_raw(libc::SIGTERM);
        assert!(!status.success());
        let mut ctx = ShutdownContext::default();
        ctx.spawn(ChildRole::Supervisor, Command::new("sh").args(["-c", "exit 3"]))
            .expect("spawn sh");
        assert_eq!(ctx.reap_all(), ReapOutcome::AllExited);
    }
}
