//! Error kinds for the scheduler service.
//!
//! Mirrors the kinds enumerated in the design's error-handling table, not
//! any particular source exception hierarchy: callers match on `ErrorKind`,
//! never on the underlying OS error.

use thiserror::Error;

/// One error kind per row of the error-handling table.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("file not found")]
    FileNotFound,
    #[error("device i/o error")]
    DeviceIo,
    #[error("service i/o error")]
    ServiceIo,
    #[error("not enough memory")]
    NotEnoughMemory,
    #[error("invalid operation")]
    InvalidOperation,
    #[error("device response fault")]
    DeviceResponseFault,
    #[error("termination")]
    Termination,
}

/// Service-level error: a kind plus an optional raw code from the driver or
/// transport layer (ioctl return value, errno, ...).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{kind}: code={code}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub code: i32,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, code: i32) -> Self {
        Self { kind, code }
    }

    pub fn device_io(code: i32) -> Self {
        Self::new(ErrorKind::DeviceIo, code)
    }

    pub fn is_busy(&self) -> bool {
        self.kind == ErrorKind::DeviceIo && (self.code == libc::EBUSY || self.code == libc::EAGAIN)
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
