//! Named POSIX semaphores backing the log lock and the two-phase rendezvous.

use std::ptr::NonNull;

use tracing::warn;

use crate::error::{IpcError, IpcOp, IpcResult, ResourceKind};
use crate::types::posix_name;

const MODE: libc::mode_t = libc::S_IRUSR | libc::S_IWUSR;
const KIND: ResourceKind = ResourceKind::Semaphore;

/// Handle to a named semaphore. Dropping it closes the handle; only
/// [`NamedSemaphore::unlink`] removes the name.
#[derive(Debug)]
pub struct NamedSemaphore {
    name: String,
    raw: NonNull<libc::sem_t>,
}

// SAFETY: sem_post/sem_wait are thread-safe and the handle is never freed while borrowed.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Exclusively create `name` with `initial` permits; fails if it already exists.
    pub fn create(name: &str, initial: u32) -> IpcResult<Self> {
        let c_name = posix_name(name)?;
        // SAFETY: c_name is NUL-terminated; the variadic tail is (mode, value) as O_CREAT requires.
        let raw = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                MODE as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        Self::from_raw(name, raw, IpcOp::Create)
    }

    /// Attach to a semaphore created by another process.
    pub fn open(name: &str) -> IpcResult<Self> {
        let c_name = posix_name(name)?;
        // SAFETY: c_name is NUL-terminated; no variadic arguments without O_CREAT.
        let raw = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        Self::from_raw(name, raw, IpcOp::Attach)
    }

    fn from_raw(name: &str, raw: *mut libc::sem_t, op: IpcOp) -> IpcResult<Self> {
        if raw == libc::SEM_FAILED {
            return Err(IpcError::last_os(KIND, op, name));
        }
        let raw = NonNull::new(raw).ok_or_else(|| IpcError::last_os(KIND, op, name))?;
        Ok(Self {
            name: name.to_string(),
            raw,
        })
    }

    /// Remove the name. Open handles stay usable until closed.
    pub fn unlink(name: &str) -> IpcResult<()> {
        let c_name = posix_name(name)?;
        // SAFETY: c_name is NUL-terminated.
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } != 0 {
            return Err(IpcError::last_os(KIND, IpcOp::Unlink, name));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post(&self) -> IpcResult<()> {
        // SAFETY: raw is a live handle returned by sem_open.
        if unsafe { libc::sem_post(self.raw.as_ptr()) } != 0 {
            return Err(IpcError::last_os(KIND, IpcOp::Post, &self.name));
        }
        Ok(())
    }

    /// Block until a permit is available. Interrupted waits are resumed.
    pub fn wait(&self) -> IpcResult<()> {
        loop {
            // SAFETY: raw is a live handle returned by sem_open.
            if unsafe { libc::sem_wait(self.raw.as_ptr()) } == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(IpcError::from_io(KIND, IpcOp::Wait, &self.name, err));
            }
        }
    }

    /// Take a permit if one is available right now.
    #[cfg(test)]
    pub fn try_wait(&self) -> IpcResult<bool> {
        loop {
            // SAFETY: raw is a live handle returned by sem_open.
            if unsafe { libc::sem_trywait(self.raw.as_ptr()) } == 0 {
                return Ok(true);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(IpcError::from_io(KIND, IpcOp::Wait, &self.name, err)),
            }
        }
    }

    /// Raw handle for the signal handler, which may only call `sem_post`.
    pub(crate) fn as_ptr(&self) -> *mut libc::sem_t {
        self.raw.as_ptr()
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: raw came from sem_open and is closed exactly once here.
        unsafe {
            libc::sem_close(self.raw.as_ptr());
        }
    }
}

/// Mutual exclusion shared by every factory for console output and order-state mutation.
pub trait LogLock {
    /// Run `section` while holding the lock.
    fn critical<R>(&self, section: impl FnOnce() -> R) -> IpcResult<R>;
}

struct PostOnDrop<'a>(&'a NamedSemaphore);

impl Drop for PostOnDrop<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.0.post() {
            warn!(error = %err, "failed to release log lock");
        }
    }
}

impl LogLock for NamedSemaphore {
    fn critical<R>(&self, section: impl FnOnce() -> R) -> IpcResult<R> {
        self.wait()?;
        let _release = PostOnDrop(self);
        Ok(section())
    }
}

/// One-shot two-phase handshake between Supervisor and Sales.
///
/// Phase one: the supervisor announces that every factory completed and Sales
/// wakes from [`Rendezvous::await_done`]. Phase two: Sales grants permission
/// and the supervisor wakes from [`Rendezvous::await_print`]. Each semaphore is
/// used once per run.
#[derive(Debug)]
pub struct Rendezvous {
    done: NamedSemaphore,
    print: NamedSemaphore,
}

impl Rendezvous {
    pub fn new(done: NamedSemaphore, print: NamedSemaphore) -> Self {
        Self { done, print }
    }

    /// Attach to both semaphores created by Sales.
    pub fn attach(done: &str, print: &str) -> IpcResult<Self> {
        Ok(Self {
            done: NamedSemaphore::open(done)?,
            print: NamedSemaphore::open(print)?,
        })
    }

    /// Supervisor side of phase one.
    pub fn announce_done(&self) -> IpcResult<()> {
        self.done.post()
    }

    /// Sales side of phase one.
    pub fn await_done(&self) -> IpcResult<()> {
        self.done.wait()
    }

    /// Sales side of phase two.
    pub fn grant_print(&self) -> IpcResult<()> {
        self.print.post()
    }

    /// Supervisor side of phase two.
    pub fn await_print(&self) -> IpcResult<()> {
        self.print.wait()
    }

    #[cfg(test)]
    pub(crate) fn done_semaphore(&self) -> &NamedSemaphore {
        &self.done
    }

    #[cfg(test)]
    pub(crate) fn print_semaphore(&self) -> &NamedSemaphore {
        &self.print
    }
}
