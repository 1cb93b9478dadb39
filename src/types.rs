//! Shared identifiers and the per-factory production model.

use std::ffi::CString;
use std::ops::RangeInclusive;

use rand::Rng;

use crate::error::{IpcError, IpcResult};

/// Identifier of a factory process, contiguous in `1..=N`.
pub type WorkerId = u32;

/// Production parameters Sales assigns to one factory before spawning it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Stable factory identifier used in every report.
    pub id: WorkerId,
    /// Upper bound on the parts claimed per iteration.
    pub capacity: u32,
    /// Simulated latency of one batch, fixed for the factory's lifetime.
    pub duration_ms: u32,
}

impl WorkerSpec {
    /// Construct a spec with explicit parameters.
    pub fn new(id: WorkerId, capacity: u32, duration_ms: u32) -> Self {
        Self {
            id,
            capacity,
            duration_ms,
        }
    }

    /// Draw capacity and duration uniformly from the configured ranges.
    pub fn draw(
        id: WorkerId,
        rng: &mut impl Rng,
        capacity: &RangeInclusive<u32>,
        duration_ms: &RangeInclusive<u32>,
    ) -> Self {
        Self {
            id,
            capacity: rng.random_range(capacity.clone()),
            duration_ms: rng.random_range(duration_ms.clone()),
        }
    }
}

/// Identities of the five named resources of one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceNames {
    pub order: String,
    pub progress: String,
    pub log_lock: String,
    pub done: String,
    pub print: String,
}

impl ResourceNames {
    /// Derive every identity from a single `/`-prefixed stem.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            order: format!("{prefix}_order"),
            progress: format!("{prefix}_progress"),
            log_lock: format!("{prefix}_loglock"),
            done: format!("{prefix}_done"),
            print: format!("{prefix}_print"),
        }
    }
}

/// Validate a POSIX IPC name (`/name`, no other slash) and convert it for libc.
pub fn posix_name(name: &str) -> IpcResult<CString> {
    let valid = name.len() > 1 && name.starts_with('/') && !name[1..].contains('/');
    if !valid {
        return Err(IpcError::InvalidName(name.to_string()));
    }
    CString::new(name).map_err(|_| IpcError::InvalidName(name.to_string()))
}
