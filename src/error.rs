//! Error taxonomy shared by every role.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::message::{Purpose, WireError};

/// Convenience alias for operations on named IPC resources.
pub type IpcResult<T> = Result<T, IpcError>;

/// Which kind of named resource an [`IpcError`] refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    SharedMemory,
    MessageQueue,
    Semaphore,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceKind::SharedMemory => "shared memory",
            ResourceKind::MessageQueue => "message queue",
            ResourceKind::Semaphore => "semaphore",
        };
        f.write_str(label)
    }
}

/// The operation that failed on a named resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcOp {
    Create,
    Attach,
    Map,
    Send,
    Receive,
    Wait,
    Post,
    Unlink,
}

impl fmt::Display for IpcOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IpcOp::Create => "create",
            IpcOp::Attach => "attach",
            IpcOp::Map => "map",
            IpcOp::Send => "send on",
            IpcOp::Receive => "receive on",
            IpcOp::Wait => "wait on",
            IpcOp::Post => "post",
            IpcOp::Unlink => "unlink",
        };
        f.write_str(label)
    }
}

/// OS-level failure on a named shared resource.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to {op} {kind} `{name}`: {source}")]
    Os {
        kind: ResourceKind,
        op: IpcOp,
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("resource name `{0}` must start with '/' and contain no other '/' or NUL bytes")]
    InvalidName(String),
    #[error("{kind} `{name}` is {actual} bytes, expected at least {expected}")]
    Undersized {
        kind: ResourceKind,
        name: String,
        actual: u64,
        expected: u64,
    },
}

impl IpcError {
    /// Captures `errno` for a failed libc call.
    pub fn last_os(kind: ResourceKind, op: IpcOp, name: &str) -> Self {
        Self::from_io(kind, op, name, io::Error::last_os_error())
    }

    pub fn from_io(kind: ResourceKind, op: IpcOp, name: &str, source: io::Error) -> Self {
        IpcError::Os {
            kind,
            op,
            name: name.to_string(),
            source,
        }
    }

    /// True when an exclusive create collided with an existing resource.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, IpcError::Os { source, .. } if source.kind() == io::ErrorKind::AlreadyExists)
    }

    /// True when the named resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, IpcError::Os { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Top-level failure of a role. Every variant ends the process with exit code 1.
#[derive(Debug, Error)]
pub enum SimError {
    /// Create/attach of shared memory, the progress channel or a semaphore failed.
    #[error("resource provisioning failed: {0}")]
    Provisioning(#[source] IpcError),

    /// A child process could not be created or its log redirected.
    #[error("failed to spawn {role}: {source}")]
    Spawn {
        role: String,
        #[source]
        source: io::Error,
    },

    /// A blocking IPC operation failed after provisioning succeeded.
    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("malformed progress frame: {0}")]
    Wire(#[from] WireError),

    /// A peer answered with a message the protocol does not allow at this point.
    #[error("expected {expected:?} message, received {received:?}")]
    UnexpectedReply {
        expected: Purpose,
        received: Purpose,
    },

    /// A confirmation announced a factory count outside `1..=max`.
    #[error("server confirmed {num_workers} factories, expected 1..={max}")]
    InvalidConfirmation { num_workers: u32, max: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type SimResult<T> = Result<T, SimError>;
