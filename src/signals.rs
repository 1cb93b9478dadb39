//! SIGINT/SIGTERM handling for Sales.
//!
//! The handler only records the signal number and posts the `done` semaphore,
//! both async-signal-safe. Posting wakes Sales if it is parked in phase one of
//! the handshake; every other wait in Sales polls [`pending`]. All teardown
//! runs afterwards in ordinary context.

use std::ptr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

use crate::error::{IpcError, IpcOp, IpcResult, ResourceKind};
use crate::semaphore::NamedSemaphore;

static PENDING: AtomicI32 = AtomicI32::new(0);
static WAKE: AtomicPtr<libc::sem_t> = AtomicPtr::new(ptr::null_mut());
/// The handler's own handle, open for the rest of the process so `WAKE` never dangles.
static WAKE_HANDLE: OnceLock<NamedSemaphore> = OnceLock::new();

const HANDLED: [libc::c_int; 2] = [libc::SIGINT, libc::SIGTERM];

extern "C" fn on_shutdown_signal(signal: libc::c_int) {
    PENDING.store(signal, Ordering::SeqCst);
    let wake = WAKE.load(Ordering::SeqCst);
    if !wake.is_null() {
        // SAFETY: sem_post is async-signal-safe; the handle is never closed.
        unsafe {
            libc::sem_post(wake);
        }
    }
}

/// Route SIGINT and SIGTERM to the handler, which posts the semaphore named
/// `wake`. `SA_RESTART` is left off so blocking calls return early.
pub fn install(wake: &str) -> IpcResult<()> {
    let handle = NamedSemaphore::open(wake)?;
    let handle = WAKE_HANDLE.get_or_init(|| handle);
    WAKE.store(handle.as_ptr(), Ordering::SeqCst);

    for signal in HANDLED {
        // SAFETY: sigaction is plain data; zero is a valid starting point.
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction =
            on_shutdown_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = 0;
        // SAFETY: action is fully initialised and outlives the call.
        let rc = unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signal, &action, ptr::null_mut())
        };
        if rc != 0 {
            return Err(IpcError::last_os(ResourceKind::Semaphore, IpcOp::Attach, wake));
        }
    }
    Ok(())
}

/// The signal that requested shutdown, if any.
pub fn pending() -> Option<libc::c_int> {
    match PENDING.load(Ordering::SeqCst) {
        0 => None,
        signal => Some(signal),
    }
}

pub fn describe(signal: libc::c_int) -> &'static str {
    match signal {
        libc::SIGINT => "INTERRUPTED by SIGINT",
        libc::SIGTERM => "nicely asked to TERMINATE by SIGTERM",
        _ => "unexpectedly SIGNALed",
    }
}
