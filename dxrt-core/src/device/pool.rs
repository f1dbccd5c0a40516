//! Device pool — enumerates and owns every `DeviceCore`, §4.C/§2.
//!
//! Grounded on `DevicePool` (original `device_pool.h`): a flat collection of
//! cores built once at startup, looked up by device id, with the same
//! environment-variable overrides the original uses for test rigs.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{ErrorKind, Result, ServiceError};

use super::adapter::{AdapterKind, DriverAdapterFactory};
use super::core::DeviceCore;
use super::{Device, DeviceKind};

/// Env var forcing the device count, bypassing directory enumeration.
pub const ENV_FORCE_NUM_DEV: &str = "DXRT_FORCE_NUM_DEV";
/// Env var restricting enumeration to a single device id.
pub const ENV_FORCE_DEVICE_ID: &str = "DXRT_FORCE_DEVICE_ID";
/// Env var overriding the `/dev` character-device name prefix.
pub const ENV_DEVICE_FILE_PREFIX: &str = "DXRT_DEVICE_FILE_PREFIX";

const DEFAULT_DEVICE_FILE_PREFIX: &str = "dxrt";
const DEFAULT_MEM_SIZE: u64 = 2 * 1024 * 1024 * 1024;
const DEFAULT_NUM_DMA_CH: u8 = 4;
const MAX_PROBE: u32 = 32;

/// All devices known to this instance of the service.
pub struct DevicePool {
    cores: Vec<Arc<DeviceCore>>,
}

impl DevicePool {
    /// Build a pool by probing `/dev/<prefix><n>` for `n` in `0..MAX_PROBE`,
    /// honoring the force-count / force-id env overrides.
    pub fn discover() -> Result<Self> {
        let prefix = std::env::var(ENV_DEVICE_FILE_PREFIX)
            .unwrap_or_else(|_| DEFAULT_DEVICE_FILE_PREFIX.to_string());

        if let Ok(forced_id) = std::env::var(ENV_FORCE_DEVICE_ID) {
            let id: u32 = forced_id
                .parse()
                .map_err(|_| ServiceError::new(ErrorKind::InvalidArgument, -1))?;
            let core = open_core(&prefix, id)?;
            return Ok(Self { cores: vec![core] });
        }

        let limit = match std::env::var(ENV_FORCE_NUM_DEV) {
            Ok(v) => v
                .parse::<u32>()
                .map_err(|_| ServiceError::new(ErrorKind::InvalidArgument, -1))?,
            Err(_) => MAX_PROBE,
        };

        let mut cores = Vec::new();
        for id in 0..limit {
            match open_core(&prefix, id) {
                Ok(core) => cores.push(core),
                Err(_) if std::env::var(ENV_FORCE_NUM_DEV).is_err() => break,
                Err(e) => return Err(e),
            }
        }

        if cores.is_empty() {
            return Err(ServiceError::new(ErrorKind::FileNotFound, -1));
        }

        Ok(Self { cores })
    }

    /// Build a pool from pre-constructed cores (used by tests with mock
    /// adapters, and by any caller that wants to wire devices by hand).
    pub fn from_cores(cores: Vec<Arc<DeviceCore>>) -> Self {
        Self { cores }
    }

    pub fn count(&self) -> usize {
        self.cores.len()
    }

    pub fn get(&self, device_id: u32) -> Option<Arc<DeviceCore>> {
        self.cores.iter().find(|c| c.id() == device_id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeviceCore>> {
        self.cores.iter()
    }

    pub fn all(&self) -> Vec<Arc<DeviceCore>> {
        self.cores.clone()
    }

    /// Pick the least-loaded device among `candidates` (empty means "any").
    /// Returns `None` if every candidate is currently blocked.
    pub fn least_loaded(&self, candidates: &[u32]) -> Option<Arc<DeviceCore>> {
        let eligible = self.cores.iter().filter(|c| {
            !c.device.is_blocked() && (candidates.is_empty() || candidates.contains(&c.id()))
        });
        eligible.min_by_key(|c| c.load())
            .cloned()
    }
}

fn open_core(prefix: &str, id: u32) -> Result<Arc<DeviceCore>> {
    let path = PathBuf::from(format!("/dev/{prefix}{id}"));
    let adapter =
        DriverAdapterFactory::create(AdapterKind::LocalCharDevice, &path.to_string_lossy())?;

    let device = Arc::new(Device::new(
        id,
        path,
        DeviceKind::Acc,
        0,
        0,
        DEFAULT_MEM_SIZE,
        DEFAULT_NUM_DMA_CH,
    ));
    let core = Arc::new(DeviceCore::new(device, adapter));

    let identity = core.identify()?;
    log::info!(
        "dxrt-core: device {id} identified: mem_size={} num_dma_ch={}",
        identity.mem_size,
        identity.num_dma_ch
    );

    Ok(core)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockAdapter;

    fn mock_core(id: u32) -> Arc<DeviceCore> {
        let device = Arc::new(Device::new(id, PathBuf::from("/dev/mock"), DeviceKind::Acc, 0, 0, DEFAULT_MEM_SIZE, 4));
        Arc::new(DeviceCore::new(device, Box::new(MockAdapter::new("mock"))))
    }

    #[test]
    fn get_returns_matching_device() {
        let pool = DevicePool::from_cores(vec![mock_core(0), mock_core(1)]);
        assert_eq!(pool.get(1).unwrap().id(), 1);
        assert!(pool.get(5).is_none());
    }

    #[test]
    fn least_loaded_skips_blocked_devices() {
        let a = mock_core(0);
        let b = mock_core(1);
        a.device.load.store(10, std::sync::atomic::Ordering::SeqCst);
        b.device.load.store(2, std::sync::atomic::Ordering::SeqCst);
        b.device.block();
        let pool = DevicePool::from_cores(vec![a, b]);
        let picked = pool.least_loaded(&[]).unwrap();
        assert_eq!(picked.id(), 0);
    }

    #[test]
    fn least_loaded_respects_candidate_list() {
        let pool = DevicePool::from_cores(vec![mock_core(0), mock_core(1), mock_core(2)]);
        let picked = pool.least_loaded(&[2]).unwrap();
        assert_eq!(picked.id(), 2);
    }
}
