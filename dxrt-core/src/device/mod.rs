//! Device pool, device core, driver adapter, and response reader threads —
//! §4.A–§4.D.

pub mod adapter;
pub mod core;
pub mod pool;
pub mod reader;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

use crate::bound::BoundRegistry;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32};
use std::sync::Mutex as StdMutex;

/// Number of 1 Hz watchdog samples kept in the rolling duty-cycle window
/// (§4.G `GET_USAGE`, fed by the watchdog's per-tick sampling in §4.H).
const DUTY_CYCLE_WINDOW: usize = 60;

/// Rolling duty-cycle sampler: one boolean ("was this device loaded?") per
/// watchdog tick, reported as a 0..1000 permille scale by `GET_USAGE`.
#[derive(Default)]
pub struct DutyCycleTracker {
    samples: StdMutex<VecDeque<bool>>,
}

impl DutyCycleTracker {
    pub fn tick(&self, busy: bool) {
        let mut samples = self.samples.lock().unwrap();
        samples.push_back(busy);
        if samples.len() > DUTY_CYCLE_WINDOW {
            samples.pop_front();
        }
    }

    /// Duty cycle scaled 0..1000, per spec.md §4.G `GET_USAGE`.
    pub fn permille(&self) -> u32 {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return 0;
        }
        let busy = samples.iter().filter(|b| **b).count();
        (busy as u32 * 1000) / samples.len() as u32
    }
}

/// ioctl command set carried over the generic `{cmd, subcmd, data, size}`
/// message — §6. Subcommand paths under `Custom`/`Pcie`/`Schedule` are
/// recognized only to size the buffer correctly; this crate gives them no
/// further semantic interpretation (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DeviceCmd {
    IdentifyDevice = 0,
    GetStatus = 1,
    Reset = 2,
    UpdateConfig = 3,
    UpdateFirmware = 4,
    GetLog = 5,
    Dump = 6,
    WriteMem = 7,
    ReadMem = 8,
    NpuRunReq = 9,
    NpuRunResp = 10,
    Terminate = 11,
    DrvInfo = 12,
    Schedule = 13,
    Custom = 14,
    Pcie = 15,
    Recovery = 16,
    Start = 17,
}

/// Device type, §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Acc,
    Std,
}

/// Immutable device identity plus the mutable bits the design calls out
/// (bound counters, load, blocked flag, channel rotators).
pub struct Device {
    pub id: u32,
    pub path: PathBuf,
    pub kind: DeviceKind,
    pub variant: u32,
    pub mem_base: u64,
    pub mem_size: u64,
    pub num_dma_ch: u8,
    pub bound: BoundRegistry,
    pub load: AtomicI32,
    pub blocked: AtomicBool,
    pub duty_cycle: DutyCycleTracker,
    read_ch: AtomicU32,
    write_ch: AtomicU32,
}

impl Device {
    pub fn new(id: u32, path: PathBuf, kind: DeviceKind, variant: u32, mem_base: u64, mem_size: u64, num_dma_ch: u8) -> Self {
        Self {
            id,
            path,
            kind,
            variant,
            mem_base,
            mem_size,
            num_dma_ch,
            bound: BoundRegistry::new(),
            load: AtomicI32::new(0),
            blocked: AtomicBool::new(false),
            duty_cycle: DutyCycleTracker::default(),
            read_ch: AtomicU32::new(0),
            write_ch: AtomicU32::new(0),
        }
    }

    /// Select the next read DMA channel, rotating mod `num_dma_ch`.
    pub fn next_read_channel(&self) -> u32 {
        rotate(&self.read_ch, self.num_dma_ch as u32)
    }

    /// Select the next write DMA channel, rotating mod `num_dma_ch`.
    pub fn next_write_channel(&self) -> u32 {
        rotate(&self.write_ch, self.num_dma_ch as u32)
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn block(&self) {
        self.blocked.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn unblock(&self) {
        self.blocked.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

fn rotate(counter: &AtomicU32, modulus: u32) -> u32 {
    use std::sync::atomic::Ordering;
    let modulus = modulus.max(1);
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some((v + 1) % modulus))
        .unwrap_or(0)
}
