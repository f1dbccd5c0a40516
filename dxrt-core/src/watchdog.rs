//! Liveness watchdog — §4.H.
//!
//! Polls every known pid once a second with a signal-0 `kill` check
//! (`process_manager.cpp`'s approach to liveness without a wait(2) handle on
//! another process's children) and runs the staged teardown when one has
//! died: stop admission, reclaim its table entries and device memory, drain
//! its in-flight load off the scheduler, then force the clear if the device
//! won't drain on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::ErrorKind;
use crate::scheduler::SchedulerPolicy;
use crate::service::ServiceFacade;

/// Liveness scan cadence (§4.H).
const SCAN_INTERVAL: Duration = Duration::from_secs(1);
/// Arena `compact()` is coalesced to once every this many scans, not every
/// tick, since it walks the whole free list.
const COMPACT_EVERY_N_CYCLES: u32 = 10;
/// Poll interval while draining a dying process's in-flight load off a
/// device (§4.H `ClearDevice`).
const CLEAR_POLL_INTERVAL: Duration = Duration::from_micros(10);
/// A `ClearDevice` poll that makes no progress for this long counts as one
/// stall.
const STALL_THRESHOLD: Duration = Duration::from_millis(600);
/// After this many consecutive stalls, the watchdog gives up waiting for
/// the device to drain on its own and forces the clear.
const MAX_STALLS_BEFORE_FORCE: u32 = 3;

/// Background liveness scanner. `run()`/`spawn()` drive a 1 Hz loop that
/// reaps dead processes and ticks each device's duty-cycle sampler; `stop()`
/// unblocks it for shutdown.
pub struct Watchdog<P: SchedulerPolicy> {
    facade: Arc<ServiceFacade<P>>,
    stop: Arc<AtomicBool>,
}

impl<P: SchedulerPolicy + 'static> Watchdog<P> {
    pub fn new(facade: Arc<ServiceFacade<P>>) -> Self {
        Self {
            facade,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the scan loop on a dedicated thread.
    pub fn spawn(self) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let stop = Arc::clone(&self.stop);
        let handle = std::thread::spawn(move || self.run());
        (handle, stop)
    }

    /// Drive the scan loop on the calling thread until `stop` is set.
    pub fn run(&self) {
        let mut cycle: u32 = 0;
        while !self.stop.load(Ordering::SeqCst) {
            self.tick_duty_cycle();

            for pid in self.facade.state().known_pids() {
                if !is_alive(pid) {
                    log::warn!("dxrt-core: watchdog detected dead process pid={pid}");
                    self.handle_process_die(pid);
                }
            }

            cycle = cycle.wrapping_add(1);
            if cycle % COMPACT_EVERY_N_CYCLES == 0 {
                self.facade.compact_all();
            }

            std::thread::sleep(SCAN_INTERVAL);
        }
    }

    fn tick_duty_cycle(&self) {
        let scheduler = self.facade.scheduler();
        for core in self.facade.pool().iter() {
            core.device.duty_cycle.tick(scheduler.load(core.id()) > 0);
        }
    }

    /// Staged teardown for a confirmed-dead pid (§4.H.1):
    /// 1. stop admission for the pid
    /// 2. reclaim its table entries, bound references and device memory
    /// 3. drain its in-flight load off every device it touched, forcing a
    ///    recovery if the device won't drain on its own
    /// 4. drop it from the known-pid set and re-arm admission
    fn handle_process_die(&self, pid: i32) {
        let scheduler = self.facade.scheduler();
        scheduler.stop_scheduler(pid);

        self.facade.reclaim_dead_process(pid);

        for device_id in self.facade.devices_touched_by(pid) {
            self.clear_device(pid, device_id);
        }

        scheduler.clean_died_process(pid);
        self.facade.forget_pid(pid);
        scheduler.start_scheduler(pid);
        crate::stats::GLOBAL_STATS.record_process_reaped();
    }

    /// Wait for `pid`'s in-flight requests on `device_id` to drain, polling
    /// at `CLEAR_POLL_INTERVAL`. A poll window with no progress for
    /// `STALL_THRESHOLD` counts as one stall; after `MAX_STALLS_BEFORE_FORCE`
    /// the watchdog stops waiting, clears the process's load unconditionally,
    /// issues a device recovery ioctl, and broadcasts `RECOVERY` to the pid.
    fn clear_device(&self, pid: i32, device_id: u32) {
        let scheduler = self.facade.scheduler();
        let mut last_load = scheduler.get_proc_load(pid);
        let mut stall_started = Instant::now();
        let mut stalls = 0u32;

        loop {
            let load = scheduler.get_proc_load(pid);
            if load <= 0 {
                return;
            }

            if load != last_load {
                last_load = load;
                stall_started = Instant::now();
            } else if stall_started.elapsed() >= STALL_THRESHOLD {
                stalls += 1;
                stall_started = Instant::now();
                if stalls >= MAX_STALLS_BEFORE_FORCE {
                    self.force_clear(pid, device_id);
                    return;
                }
            }

            std::thread::sleep(CLEAR_POLL_INTERVAL);
        }
    }

    fn force_clear(&self, pid: i32, device_id: u32) {
        log::error!(
            "dxrt-core: forcing clear of pid={pid} on device {device_id} after {MAX_STALLS_BEFORE_FORCE} stalls"
        );
        self.facade.scheduler().clear_proc_load(pid);
        if let Some(core) = self.facade.pool().get(device_id) {
            if let Err(e) = core.issue_recovery() {
                log::error!("dxrt-core: device {device_id} recovery ioctl failed: {e}");
            }
        }
        self.facade
            .notify_error(pid, ErrorKind::Termination, -1, device_id as i32);
    }

    /// Signal the scan loop to exit after its current iteration.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Signal-0 liveness check: `kill(pid, 0)` sends no signal but fails with
/// `ESRCH` if the pid no longer exists (and `EPERM` if it exists but is
/// owned by another user — treated as alive either way).
fn is_alive(pid: i32) -> bool {
    let ret = unsafe { libc::kill(pid, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::core::DeviceCore;
    use crate::device::mock::MockAdapter;
    use crate::device::pool::DevicePool;
    use crate::device::{Device, DeviceKind};
    use crate::scheduler::FifoPolicy;
    use std::path::PathBuf;

    fn make_pool() -> Arc<DevicePool> {
        let device = Arc::new(Device::new(0, PathBuf::from("/dev/mock0"), DeviceKind::Acc, 0, 0, 1 << 20, 4));
        let core = Arc::new(DeviceCore::new(device, Box::new(MockAdapter::new("mock"))));
        Arc::new(DevicePool::from_cores(vec![core]))
    }

    fn make_facade(pool: Arc<DevicePool>) -> Arc<ServiceFacade<FifoPolicy>> {
        Arc::new(ServiceFacade::new(
            pool,
            FifoPolicy::new(),
            Arc::new(|_, _| {}),
            std::env::temp_dir(),
        ))
    }

    #[test]
    fn is_alive_is_true_for_own_pid() {
        let pid = std::process::id() as i32;
        assert!(is_alive(pid));
    }

    #[test]
    fn is_alive_is_false_for_an_unused_pid() {
        // A pid this large is never assigned on a real system; ESRCH expected.
        assert!(!is_alive(i32::MAX - 1));
    }

    #[test]
    fn handle_process_die_clears_scheduler_and_forgets_pid() {
        let pool = make_pool();
        let facade = make_facade(pool);
        facade.state().register_pid(4242);
        assert!(facade.state().known_pids().contains(&4242));

        let watchdog = Watchdog::new(Arc::clone(&facade));
        watchdog.handle_process_die(4242);

        assert!(!facade.state().known_pids().contains(&4242));
        assert_eq!(facade.scheduler().get_proc_load(4242), 0);
    }

    #[test]
    fn tick_duty_cycle_samples_every_device_once() {
        let pool = make_pool();
        let facade = make_facade(pool);
        let watchdog = Watchdog::new(Arc::clone(&facade));
        let before: Vec<u32> = facade.pool().iter().map(|c| c.device.duty_cycle.permille()).collect();
        watchdog.tick_duty_cycle();
        // One more sample landed in the window; with an idle mock device
        // that sample is "not busy", so the permille stays at its floor.
        let after: Vec<u32> = facade.pool().iter().map(|c| c.device.duty_cycle.permille()).collect();
        assert_eq!(before.len(), after.len());
    }
}
