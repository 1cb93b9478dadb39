//! The order counter block shared by every process of a run.
//!
//! The block lives at offset 0 of a POSIX shared-memory object. All fields are
//! atomics so that attaching processes can read them without tearing, but the
//! read-modify-write operations ([`SharedOrderState::claim`],
//! [`SharedOrderState::record`], [`SharedOrderState::retire_worker`]) are only
//! correct while the caller holds the log lock.

use std::fs::File;
use std::mem;
use std::os::fd::FromRawFd;
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{IpcError, IpcOp, IpcResult, ResourceKind};
use crate::types::posix_name;

const KIND: ResourceKind = ResourceKind::SharedMemory;
const MODE: libc::mode_t = libc::S_IRUSR | libc::S_IWUSR;

#[repr(C, align(8))]
#[derive(Debug)]
pub struct SharedOrderState {
    order_size: AtomicU32,
    made: AtomicU32,
    remain: AtomicU32,
    active_count: AtomicU32,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderSnapshot {
    pub order_size: u32,
    pub made: u32,
    pub remain: u32,
    pub active_count: u32,
}

impl OrderSnapshot {
    /// Holds whenever no claim/record window is open.
    pub fn is_balanced(&self) -> bool {
        self.made.checked_add(self.remain) == Some(self.order_size)
    }
}

impl SharedOrderState {
    /// Process-local block, already initialised.
    #[cfg(test)]
    pub fn new(order_size: u32, workers: u32) -> Self {
        let state = Self {
            order_size: AtomicU32::new(0),
            made: AtomicU32::new(0),
            remain: AtomicU32::new(0),
            active_count: AtomicU32::new(0),
        };
        state.initialize(order_size, workers);
        state
    }

    /// Reset the counters for a fresh order. Must run before any factory starts.
    pub fn initialize(&self, order_size: u32, workers: u32) {
        self.order_size.store(order_size, Ordering::SeqCst);
        self.made.store(0, Ordering::SeqCst);
        self.remain.store(order_size, Ordering::SeqCst);
        self.active_count.store(workers, Ordering::SeqCst);
    }

    pub fn order_size(&self) -> u32 {
        self.order_size.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> u32 {
        self.remain.load(Ordering::SeqCst)
    }

    pub fn made(&self) -> u32 {
        self.made.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> u32 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Move up to `requested` parts from `remain` into the caller's batch.
    /// Returns 0 once the order is exhausted. Caller holds the log lock.
    pub fn claim(&self, requested: u32) -> u32 {
        let remain = self.remain.load(Ordering::SeqCst);
        let amount = remain.min(requested);
        self.remain.store(remain - amount, Ordering::SeqCst);
        amount
    }

    /// Account a finished batch. Caller holds the log lock.
    pub fn record(&self, amount: u32) {
        let made = self.made.load(Ordering::SeqCst);
        debug_assert!(
            u64::from(made) + u64::from(amount) <= u64::from(self.order_size()),
            "recorded more parts than ordered"
        );
        self.made.store(made.saturating_add(amount), Ordering::SeqCst);
    }

    /// Mark one factory as finished. Caller holds the log lock.
    pub fn retire_worker(&self) {
        let active = self.active_count.load(Ordering::SeqCst);
        self.active_count
            .store(active.saturating_sub(1), Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> OrderSnapshot {
        OrderSnapshot {
            order_size: self.order_size(),
            made: self.made(),
            remain: self.remaining(),
            active_count: self.active_workers(),
        }
    }
}

/// A mapped POSIX shared-memory object holding one [`SharedOrderState`].
#[derive(Debug)]
pub struct SharedSegment {
    name: String,
    map: MmapMut,
}

impl SharedSegment {
    pub const SIZE: usize = mem::size_of::<SharedOrderState>();

    /// Exclusively create and map a zeroed segment; fails if `name` already exists.
    pub fn create(name: &str) -> IpcResult<Self> {
        let file = shm_open(name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, IpcOp::Create)?;
        let map_result = file
            .set_len(Self::SIZE as u64)
            .and_then(|()| map(&file));
        match map_result {
            Ok(map) => Ok(Self {
                name: name.to_string(),
                map,
            }),
            Err(err) => {
                // Nothing else can hold a name we created a moment ago.
                let _ = Self::unlink(name);
                Err(IpcError::from_io(KIND, IpcOp::Map, name, err))
            }
        }
    }

    /// Attach to a segment created by Sales.
    pub fn open(name: &str) -> IpcResult<Self> {
        let file = shm_open(name, libc::O_RDWR, IpcOp::Attach)?;
        let actual = file
            .metadata()
            .map_err(|err| IpcError::from_io(KIND, IpcOp::Attach, name, err))?
            .len();
        if actual < Self::SIZE as u64 {
            return Err(IpcError::Undersized {
                kind: KIND,
                name: name.to_string(),
                actual,
                expected: Self::SIZE as u64,
            });
        }
        let map = map(&file).map_err(|err| IpcError::from_io(KIND, IpcOp::Map, name, err))?;
        Ok(Self {
            name: name.to_string(),
            map,
        })
    }

    pub fn unlink(name: &str) -> IpcResult<()> {
        let c_name = posix_name(name)?;
        // SAFETY: c_name is NUL-terminated.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
            return Err(IpcError::last_os(KIND, IpcOp::Unlink, name));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &SharedOrderState {
        // SAFETY: the mapping is page aligned, at least SIZE bytes long, lives as
        // long as `self`, and every field is an atomic valid for any bit pattern.
        unsafe { &*(self.map.as_ptr() as *const SharedOrderState) }
    }
}

fn shm_open(name: &str, flags: libc::c_int, op: IpcOp) -> IpcResult<File> {
    let c_name = posix_name(name)?;
    // SAFETY: c_name is NUL-terminated.
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, MODE) };
    if fd < 0 {
        return Err(IpcError::last_os(KIND, op, name));
    }
    // SAFETY: fd was just returned by shm_open and is owned by nobody else.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn map(file: &File) -> std::io::Result<MmapMut> {
    // SAFETY: the object is shared on purpose; every access goes through atomics.
    unsafe { MmapOptions::new().len(SharedSegment::SIZE).map_mut(file) }
}
