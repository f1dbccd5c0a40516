//! Transport backing the IPC receive loop — §4.F / §6.
//!
//! `IpcTransport` abstracts the one primitive the receive loop actually
//! needs (blocking receive, addressed send, startup drain) so `IpcServer`
//! itself stays transport-agnostic, grounded on `IPCServerWrapper`
//! (`ipc_server_wrapper.h`) wrapping a `MESSAE_QUEUE`-typed `IPCServer`.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ErrorKind, Result, ServiceError};

/// One raw wire record: an opaque byte payload plus the POSIX mqueue
/// `msgType` / Windows pipe correlation tag used for reply routing.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub msg_type: i64,
    pub bytes: Vec<u8>,
}

/// Minimal transport contract the receive loop depends on.
pub trait IpcTransport: Send {
    /// Block until one message arrives. `None` on a clean shutdown signal.
    fn recv(&mut self) -> Result<Option<RawMessage>>;
    /// Address a reply by `msg_type` (client pid for async replies, or
    /// `pid + 10_000_000` for a synchronous call/response pair, per §4.F).
    fn send(&mut self, msg: RawMessage) -> Result<()>;
    /// Drain and discard any residual messages left over from a previous
    /// run, so a restarted daemon doesn't replay stale requests.
    fn drain(&mut self) -> Result<()>;
}

const MAX_MSG_SIZE: usize = 256;
const MAX_QUEUE_DEPTH: i64 = 64;

/// Linux POSIX message-queue transport, grounded on
/// `IPC_TYPE::MESSAE_QUEUE` being the server wrapper's default.
pub struct PosixMqTransport {
    recv_fd: libc::mqd_t,
    send_fd: libc::mqd_t,
    name: CString,
}

impl PosixMqTransport {
    /// Open (creating if needed) the named queue used for both directions —
    /// the receive and reply queues are the same object (§4.F).
    pub fn open(queue_name: &str) -> Result<Self> {
        let name = CString::new(format!("/{queue_name}"))
            .map_err(|_| ServiceError::new(ErrorKind::InvalidArgument, -1))?;

        let mut attr = libc::mq_attr {
            mq_flags: 0,
            mq_maxmsg: MAX_QUEUE_DEPTH,
            mq_msgsize: MAX_MSG_SIZE as i64,
            mq_curmsgs: 0,
        };

        let fd = unsafe {
            libc::mq_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o660,
                &mut attr as *mut libc::mq_attr,
            )
        };
        if fd == -1 {
            return Err(io_error(ErrorKind::ServiceIo));
        }

        Ok(Self { recv_fd: fd, send_fd: fd, name })
    }

    /// A cheap, `Send + Sync` handle good for addressed sends only — used to
    /// build the facade's `ReplySender` so completions and watchdog/reader
    /// broadcasts can reach the queue from threads that don't own the
    /// receive loop. `mqd_t` is a plain descriptor on Linux; POSIX mqueues
    /// allow concurrent `mq_send` from multiple threads on the same
    /// descriptor.
    pub fn reply_handle(&self) -> MqReplyHandle {
        MqReplyHandle { send_fd: self.send_fd }
    }
}

/// See [`PosixMqTransport::reply_handle`].
#[derive(Clone, Copy)]
pub struct MqReplyHandle {
    send_fd: libc::mqd_t,
}

impl MqReplyHandle {
    pub fn send(&self, msg_type: i64, bytes: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(8 + bytes.len());
        buf.extend_from_slice(&msg_type.to_le_bytes());
        buf.extend_from_slice(bytes);
        let ret = unsafe {
            libc::mq_send(
                self.send_fd,
                buf.as_ptr() as *const libc::c_char,
                buf.len(),
                0,
            )
        };
        if ret == -1 {
            return Err(io_error(ErrorKind::ServiceIo));
        }
        Ok(())
    }
}

impl IpcTransport for PosixMqTransport {
    fn recv(&mut self) -> Result<Option<RawMessage>> {
        let mut buf = vec![0u8; MAX_MSG_SIZE];
        let mut prio: u32 = 0;
        let n = unsafe {
            libc::mq_receive(
                self.recv_fd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut prio,
            )
        };
        if n < 0 {
            return Err(io_error(ErrorKind::ServiceIo));
        }
        buf.truncate(n as usize);
        if buf.len() < 8 {
            return Err(ServiceError::new(ErrorKind::ServiceIo, -1));
        }
        let msg_type = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        Ok(Some(RawMessage {
            msg_type,
            bytes: buf[8..].to_vec(),
        }))
    }

    fn send(&mut self, msg: RawMessage) -> Result<()> {
        let mut buf = Vec::with_capacity(8 + msg.bytes.len());
        buf.extend_from_slice(&msg.msg_type.to_le_bytes());
        buf.extend_from_slice(&msg.bytes);
        let ret = unsafe {
            libc::mq_send(
                self.send_fd,
                buf.as_ptr() as *const libc::c_char,
                buf.len(),
                0,
            )
        };
        if ret == -1 {
            return Err(io_error(ErrorKind::ServiceIo));
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        loop {
            let mut buf = vec![0u8; MAX_MSG_SIZE];
            let mut prio: u32 = 0;
            let saved_flags = unsafe {
                let mut attr: libc::mq_attr = std::mem::zeroed();
                libc::mq_getattr(self.recv_fd, &mut attr);
                attr.mq_flags
            };
            unsafe {
                let mut attr: libc::mq_attr = std::mem::zeroed();
                attr.mq_flags = libc::O_NONBLOCK as i64;
                libc::mq_setattr(self.recv_fd, &attr, std::ptr::null_mut());
            }
            let n = unsafe {
                libc::mq_receive(
                    self.recv_fd,
                    buf.as_mut_ptr() as *mut libc::c_char,
                    buf.len(),
                    &mut prio,
                )
            };
            unsafe {
                let mut attr: libc::mq_attr = std::mem::zeroed();
                attr.mq_flags = saved_flags;
                libc::mq_setattr(self.recv_fd, &attr, std::ptr::null_mut());
            }
            if n < 0 {
                break;
            }
            log::debug!("dxrt-core: drained residual IPC message ({n} bytes)");
        }
        Ok(())
    }
}

impl Drop for PosixMqTransport {
    fn drop(&mut self) {
        unsafe {
            libc::mq_close(self.recv_fd);
            libc::mq_unlink(self.name.as_ptr());
        }
    }
}

/// Windows named-pipe transport. Out of scope per spec.md §1 ("the
/// Windows/Linux driver ioctl/socket transport specifics beyond the
/// adapter contract"); kept so the transport factory stays exhaustive
/// across platforms, same pattern as `OverlappedCharDeviceAdapter`.
pub struct NamedPipeTransport {
    stopped: AtomicBool,
}

impl NamedPipeTransport {
    pub fn open(_pipe_name: &str) -> Result<Self> {
        Err(ServiceError::new(ErrorKind::InvalidOperation, -1))
    }
}

impl IpcTransport for NamedPipeTransport {
    fn recv(&mut self) -> Result<Option<RawMessage>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Err(ServiceError::new(ErrorKind::InvalidOperation, -1))
    }
    fn send(&mut self, _msg: RawMessage) -> Result<()> {
        Err(ServiceError::new(ErrorKind::InvalidOperation, -1))
    }
    fn drain(&mut self) -> Result<()> {
        Ok(())
    }
}

fn io_error(kind: ErrorKind) -> ServiceError {
    ServiceError::new(kind, std::io::Error::last_os_error().raw_os_error().unwrap_or(-1))
}
