//! Device core — §4.C.
//!
//! Wraps one device and its adapter: identification, serialized command
//! dispatch, channel rotation, reset/recovery, and bound-class add/delete
//! (issuing the matching `SCHED_ADD`/`SCHED_DELETE` ioctl on first/last
//! reference).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bound::{BoundClass, BoundTransition};
use crate::error::{ErrorKind, Result, ServiceError};

use super::adapter::{DriverAdapter, PollOutcome};
use super::{Device, DeviceCmd};

/// Result of `identify()`: what the device reported about itself.
#[derive(Debug, Clone, Copy)]
pub struct IdentifyInfo {
    pub mem_size: u64,
    pub num_dma_ch: u8,
}

/// One device plus its adapter. Command issuance is serialized through
/// `cmd_lock`; reader threads use a separate lock (owned by `ResponseReader`)
/// and do not contend with command dispatch.
pub struct DeviceCore {
    pub device: Arc<Device>,
    adapter: Box<dyn DriverAdapter>,
    cmd_lock: Mutex<()>,
}

impl DeviceCore {
    pub fn new(device: Arc<Device>, adapter: Box<dyn DriverAdapter>) -> Self {
        Self {
            device,
            adapter,
            cmd_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> u32 {
        self.device.id
    }

    /// Issue `IDENTIFY_DEVICE` and learn memory size / DMA-channel count.
    pub fn identify(&self) -> Result<IdentifyInfo> {
        let mut buf = [0u8; 16];
        let _lock = self.cmd_lock.lock();
        self.adapter
            .ioctl(DeviceCmd::IdentifyDevice as i32, &mut buf, 0)?;
        let mem_size = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let num_dma_ch = buf[8];
        Ok(IdentifyInfo {
            mem_size: if mem_size == 0 { self.device.mem_size } else { mem_size },
            num_dma_ch: if num_dma_ch == 0 { self.device.num_dma_ch } else { num_dma_ch },
        })
    }

    /// Thin dispatcher: serialize `{cmd, subcmd, buffer}` through the
    /// adapter. Gives subcommand paths (weight-info, bound, firmware, LED,
    /// OTP, reset, start, dump, config JSON) no semantic interpretation
    /// beyond sizing `buf`.
    pub fn execute(&self, cmd: DeviceCmd, sub_cmd: i32, buf: &mut [u8]) -> Result<i32> {
        let _lock = self.cmd_lock.lock();
        self.adapter.ioctl(cmd as i32, buf, sub_cmd)
    }

    pub fn write(&self, buf: &[u8], channel: Option<u32>) -> Result<(i32, u32)> {
        let ch = channel.unwrap_or_else(|| self.device.next_write_channel());
        let n = self.adapter.write(buf)?;
        Ok((n, ch))
    }

    pub fn read(&self, buf: &mut [u8], channel: Option<u32>) -> Result<(i32, u32)> {
        let ch = channel.unwrap_or_else(|| self.device.next_read_channel());
        let n = self.adapter.read(buf)?;
        Ok((n, ch))
    }

    /// Send an ioctl with a short countdown, clear blocked state.
    pub fn reset(&self, opt: i32) -> Result<()> {
        let mut buf = opt.to_le_bytes();
        {
            let _lock = self.cmd_lock.lock();
            self.adapter.ioctl(DeviceCmd::Reset as i32, &mut buf, 0)?;
        }
        self.device.unblock();
        Ok(())
    }

    pub fn issue_recovery(&self) -> Result<()> {
        let mut buf = [0u8; 4];
        let _lock = self.cmd_lock.lock();
        self.adapter.ioctl(DeviceCmd::Recovery as i32, &mut buf, 0)?;
        Ok(())
    }

    /// Register (or add a reference to) a bound class, issuing `SCHED_ADD`
    /// on first reference.
    pub fn add_bound(&self, class: BoundClass) -> Result<()> {
        match self.device.bound.add_bound(class) {
            None => Err(ServiceError::new(ErrorKind::InvalidOperation, -1)),
            Some(BoundTransition::FirstReference) => {
                let mut buf = [0u8; 4];
                let _lock = self.cmd_lock.lock();
                self.adapter
                    .ioctl(DeviceCmd::Schedule as i32, &mut buf, class as i32)?;
                Ok(())
            }
            Some(BoundTransition::AlreadyRegistered) => Ok(()),
            _ => unreachable!("add_bound never yields a deletion transition"),
        }
    }

    /// Release a reference to a bound class, issuing `SCHED_DELETE` when
    /// the last reference drops.
    pub fn delete_bound(&self, class: BoundClass) -> Result<()> {
        match self.device.bound.delete_bound(class) {
            None => {
                log::warn!("dxrt-core: delete_bound on unregistered class on device {}", self.id());
                Ok(())
            }
            Some(BoundTransition::LastReference) => {
                let mut buf = [0u8; 4];
                let _lock = self.cmd_lock.lock();
                self.adapter
                    .ioctl(DeviceCmd::Schedule as i32, &mut buf, -(class as i32) - 1)?;
                Ok(())
            }
            Some(BoundTransition::StillRegistered) => Ok(()),
            _ => unreachable!("delete_bound never yields an addition transition"),
        }
    }

    pub fn can_accept_bound(&self, class: BoundClass) -> bool {
        self.device.bound.can_accept_bound(class)
    }

    pub fn load(&self) -> i32 {
        self.device.load.load(Ordering::SeqCst)
    }

    /// Block for the next completion on this device. Used by the response
    /// reader threads; does not go through `cmd_lock` since polling and
    /// command dispatch are independent operations on the adapter.
    pub fn poll(&self) -> Result<PollOutcome> {
        self.adapter.poll()
    }
}
