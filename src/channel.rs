//! Progress channel: a POSIX message queue carrying fixed-size frames from
//! every factory to the supervisor.
//!
//! Sends block while the queue is full and receives block while it is empty;
//! neither side has a timeout.

use std::io;

use crate::error::{IpcError, IpcOp, IpcResult, ResourceKind};
use crate::message::{FRAME_LEN, Frame};
use crate::types::posix_name;

const KIND: ResourceKind = ResourceKind::MessageQueue;
const MODE: libc::mode_t = libc::S_IRUSR | libc::S_IWUSR;

/// Producer side of the progress channel.
pub trait ProgressSink {
    fn send(&self, frame: &Frame) -> IpcResult<()>;
}

/// Consumer side of the progress channel. Returns the raw received bytes so
/// the consumer decides how to treat malformed frames.
pub trait ProgressSource {
    fn recv(&self) -> IpcResult<Vec<u8>>;
}

#[derive(Debug)]
pub struct ProgressQueue {
    name: String,
    mqd: libc::mqd_t,
}

impl ProgressQueue {
    /// Exclusively create a queue holding up to `depth` frames.
    pub fn create(name: &str, depth: usize) -> IpcResult<Self> {
        let c_name = posix_name(name)?;
        // SAFETY: mq_attr is plain data; zero is a valid starting point for every field.
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_maxmsg = depth as libc::c_long;
        attr.mq_msgsize = FRAME_LEN as libc::c_long;
        // SAFETY: c_name is NUL-terminated; with O_CREAT the variadic tail is (mode, attr*).
        let mqd = unsafe {
            libc::mq_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                MODE,
                &mut attr as *mut libc::mq_attr,
            )
        };
        Self::from_raw(name, mqd, IpcOp::Create)
    }

    /// Attach to a queue created by Sales.
    pub fn open(name: &str) -> IpcResult<Self> {
        let c_name = posix_name(name)?;
        // SAFETY: c_name is NUL-terminated; no variadic arguments without O_CREAT.
        let mqd = unsafe { libc::mq_open(c_name.as_ptr(), libc::O_RDWR) };
        Self::from_raw(name, mqd, IpcOp::Attach)
    }

    fn from_raw(name: &str, mqd: libc::mqd_t, op: IpcOp) -> IpcResult<Self> {
        if mqd == -1 as libc::mqd_t {
            return Err(IpcError::last_os(KIND, op, name));
        }
        Ok(Self {
            name: name.to_string(),
            mqd,
        })
    }

    pub fn unlink(name: &str) -> IpcResult<()> {
        let c_name = posix_name(name)?;
        // SAFETY: c_name is NUL-terminated.
        if unsafe { libc::mq_unlink(c_name.as_ptr()) } != 0 {
            return Err(IpcError::last_os(KIND, IpcOp::Unlink, name));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn msg_size(&self) -> IpcResult<usize> {
        // SAFETY: mq_attr is plain data filled in by mq_getattr.
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        // SAFETY: mqd is an open descriptor and attr is a valid out pointer.
        if unsafe { libc::mq_getattr(self.mqd, &mut attr) } != 0 {
            return Err(IpcError::last_os(KIND, IpcOp::Receive, &self.name));
        }
        Ok((attr.mq_msgsize as usize).max(FRAME_LEN))
    }
}

impl ProgressSink for ProgressQueue {
    fn send(&self, frame: &Frame) -> IpcResult<()> {
        loop {
            // SAFETY: the frame outlives the call and its length is passed alongside.
            let rc = unsafe {
                libc::mq_send(self.mqd, frame.as_ptr() as *const libc::c_char, frame.len(), 0)
            };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(IpcError::from_io(KIND, IpcOp::Send, &self.name, err));
            }
        }
    }
}

impl ProgressSource for ProgressQueue {
    fn recv(&self) -> IpcResult<Vec<u8>> {
        // mq_receive rejects buffers smaller than the queue's message size.
        let mut buf = vec![0u8; self.msg_size()?];
        loop {
            let mut priority: libc::c_uint = 0;
            // SAFETY: buf is writable for buf.len() bytes; priority is a valid out pointer.
            let received = unsafe {
                libc::mq_receive(
                    self.mqd,
                    buf.as_mut_ptr() as *mut libc::c_char,
                    buf.len(),
                    &mut priority,
                )
            };
            if received >= 0 {
                buf.truncate(received as usize);
                return Ok(buf);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(IpcError::from_io(KIND, IpcOp::Receive, &self.name, err));
            }
        }
    }
}

impl Drop for ProgressQueue {
    fn drop(&mut self) {
        // SAFETY: mqd is open and closed exactly once here.
        unsafe {
            libc::mq_close(self.mqd);
        }
    }
}
