//! Sales configuration and its defaults.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{SimError, SimResult};
use crate::types::{ResourceNames, posix_name};

pub const DEFAULT_MIN_CAPACITY: u32 = 10;
pub const DEFAULT_MAX_CAPACITY: u32 = 50;
pub const DEFAULT_MIN_DURATION_MS: u32 = 500;
pub const DEFAULT_MAX_DURATION_MS: u32 = 1200;
/// Simulated printer check between the two handshake phases. Nothing relies
/// on it for correctness.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 2000;
pub const DEFAULT_IPC_PREFIX: &str = "/factory_line";
/// Linux's default per-queue message limit for unprivileged users.
pub const DEFAULT_QUEUE_DEPTH: usize = 10;

pub const SUPERVISOR_LOG: &str = "supervisor.log";
pub const FACTORY_LOG: &str = "factory.log";

#[derive(Clone, Debug)]
pub struct SalesConfig {
    pub workers: u32,
    pub order_size: u32,
    pub capacity: RangeInclusive<u32>,
    pub duration_ms: RangeInclusive<u32>,
    pub settle_delay: Duration,
    /// Stem of every named resource. Fixed by default so that leftovers from a
    /// crashed run collide with the next one.
    pub ipc_prefix: String,
    pub log_dir: PathBuf,
    pub queue_depth: usize,
}

impl SalesConfig {
    /// Defaults for everything except the order itself.
    pub fn new(workers: u32, order_size: u32) -> Self {
        Self {
            workers,
            order_size,
            capacity: DEFAULT_MIN_CAPACITY..=DEFAULT_MAX_CAPACITY,
            duration_ms: DEFAULT_MIN_DURATION_MS..=DEFAULT_MAX_DURATION_MS,
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            ipc_prefix: DEFAULT_IPC_PREFIX.to_string(),
            log_dir: PathBuf::from("."),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    pub fn validate(&self) -> SimResult<()> {
        if self.workers == 0 {
            return Err(SimError::InvalidArgument("workers must be > 0".into()));
        }
        if self.order_size == 0 {
            return Err(SimError::InvalidArgument("order size must be > 0".into()));
        }
        if self.capacity.is_empty() || *self.capacity.start() == 0 {
            return Err(SimError::InvalidArgument(format!(
                "capacity range {:?} must be non-empty and start above 0",
                self.capacity
            )));
        }
        if self.duration_ms.is_empty() {
            return Err(SimError::InvalidArgument(format!(
                "duration range {:?} is empty",
                self.duration_ms
            )));
        }
        if self.queue_depth == 0 {
            return Err(SimError::InvalidArgument("queue depth must be > 0".into()));
        }
        // Every derived name must be a valid POSIX IPC name.
        posix_name(&self.names().progress)
            .map_err(|err| SimError::InvalidArgument(err.to_string()))?;
        Ok(())
    }

    pub fn names(&self) -> ResourceNames {
        ResourceNames::with_prefix(&self.ipc_prefix)
    }

    pub fn supervisor_log(&self) -> PathBuf {
        self.log_dir.join(SUPERVISOR_LOG)
    }

    pub fn factory_log(&self) -> PathBuf {
        self.log_dir.join(FACTORY_LOG)
    }
}
