//! In-memory adapter used by tests in place of a real character device.
//! Grounded on the original's `mock_driver_adapter`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use parking_lot::Mutex;

use crate::error::{ErrorKind, Result, ServiceError};

use super::adapter::{DriverAdapter, PollOutcome};

/// Commands a test can stage a response for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Ok(i32),
    Busy,
    Fault(i32),
}

/// A scriptable, in-memory stand-in for a character device.
pub struct MockAdapter {
    name: String,
    next_ioctl: Mutex<Vec<ScriptedOutcome>>,
    terminated: AtomicBool,
    poll_ready: AtomicBool,
    fd: AtomicI32,
}

impl MockAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            next_ioctl: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
            poll_ready: AtomicBool::new(false),
            fd: AtomicI32::new(-1),
        }
    }

    /// Queue the outcome of the next `ioctl` call (FIFO).
    pub fn push_outcome(&self, outcome: ScriptedOutcome) {
        self.next_ioctl.lock().push(outcome);
    }

    pub fn signal_ready(&self) {
        self.poll_ready.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// The command value the reader-thread shutdown path sends to unblock a
/// pending poll/read; matches `dxrt_cmd_t::TERMINATE` in the wire protocol.
pub const TERMINATE_CMD: i32 = -100;

impl DriverAdapter for MockAdapter {
    fn ioctl(&self, cmd: i32, _data: &mut [u8], _sub_cmd: i32) -> Result<i32> {
        if cmd == TERMINATE_CMD {
            self.terminated.store(true, Ordering::SeqCst);
            return Ok(0);
        }
        let outcome = self.next_ioctl.lock().pop();
        match outcome {
            Some(ScriptedOutcome::Ok(v)) => Ok(v),
            Some(ScriptedOutcome::Busy) => Err(ServiceError::device_io(libc::EBUSY)),
            Some(ScriptedOutcome::Fault(code)) => {
                Err(ServiceError::new(ErrorKind::DeviceResponseFault, code))
            }
            None => Ok(0),
        }
    }

    fn write(&self, buf: &[u8]) -> Result<i32> {
        Ok(buf.len() as i32)
    }

    fn read(&self, _buf: &mut [u8]) -> Result<i32> {
        Ok(0)
    }

    fn poll(&self) -> Result<PollOutcome> {
        if self.terminated.load(Ordering::SeqCst) || self.poll_ready.swap(false, Ordering::SeqCst) {
            Ok(PollOutcome::Ready)
        } else {
            Ok(PollOutcome::Timeout)
        }
    }

    fn mmap(&self, _len: usize, _offset: u64) -> Result<Option<*mut u8>> {
        Ok(None)
    }

    fn fd(&self) -> RawFd {
        self.fd.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
