//! Core runtime of the NPU scheduler service.
//!
//! This crate is the long-lived daemon's library: device pool and arena,
//! bound-class registry, the three scheduler policies, the IPC wire
//! protocol, the service facade that ties them together, and the liveness
//! watchdog. The binary crate (`dxrtd`) only parses CLI args, installs
//! logging/signal handling, and drives the IPC receive loop against
//! [`service::ServiceFacade`].

pub mod arena;
pub mod bound;
pub mod config;
pub mod device;
pub mod error;
pub mod ipc;
pub mod request;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod task;
pub mod watchdog;

pub use error::{ErrorKind, Result, ServiceError};
