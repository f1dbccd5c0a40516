//! Scheduler.
//!
//! Shared admission/dispatch/completion state lives in `Scheduler<P>`;
//! policies only decide queue order, grounded on `SchedulerService` and its
//! `FIFOSchedulerService`/`RoundRobinSchedulerService`/`SJFSchedulerService`
//! subclasses in the original's `scheduler_service.h`. `nvme-driver`'s
//! `IoScheduler` trait (one `submit`/`next` pair per policy, `io_scheduler.rs`)
//! is the Rust-idiom source for turning that class hierarchy into a trait
//! plus a generic wrapper instead of virtual dispatch.

pub mod fifo;
pub mod round_robin;
pub mod sjf;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::pool::DevicePool;
use crate::device::DeviceCmd;
use crate::request::{Request, Response};

pub use fifo::FifoPolicy;
pub use round_robin::RoundRobinPolicy;
pub use sjf::SjfPolicy;

/// Which policy to build, selected by the `dxrtd -s|--scheduler` CLI flag
/// or the config file's `scheduler_policy` key (§6). `Scheduler<P>` is
/// generic over the policy so this enum only exists at the construction
/// boundary — once built, dispatch never matches on it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
pub enum SchedPolicyKind {
    #[default]
    Fifo,
    RoundRobin,
    #[serde(rename = "SJF")]
    Sjf,
}

impl std::str::FromStr for SchedPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "FIFO" | "Fifo" | "fifo" => Ok(Self::Fifo),
            "RoundRobin" | "roundrobin" | "round-robin" => Ok(Self::RoundRobin),
            "SJF" | "Sjf" | "sjf" => Ok(Self::Sjf),
            other => Err(format!("unknown scheduler policy: {other}")),
        }
    }
}

/// Devices under this many in-flight requests get fed immediately on
/// admission; past it, a request waits for a completion to free a slot.
pub const SCHED_THRESHOLD: i32 = 6;

/// Error code surfaced for a request targeting an unregistered/invalid task.
pub const STATUS_INVALID_TASK: i32 = -1;
/// Error code surfaced for a request targeting a blocked device.
pub const STATUS_DEVICE_BLOCKED: i32 = -2;

/// Per-device queue discipline. Shared admission/completion bookkeeping
/// (`loads`, `loads_proc`, `map`, `running`) lives in `Scheduler<P>`, not
/// here — a policy only decides which pending request comes out of `pop`.
pub trait SchedulerPolicy: Send + Sync {
    fn push(&self, request: Request, device_id: u32);
    fn pop(&self, device_id: u32) -> Option<Request>;
    fn on_complete(&self, pid: i32, task_id: i32, inf_time: u32);
}

/// Checks `(pid, deviceId, taskId)` against the service facade's task table
/// before a request is allowed onto a device.
pub type TaskValidator = Arc<dyn Fn(i32, u32, i32) -> bool + Send + Sync>;

/// Delivered for every completion, success or synthesized error.
pub type CompletionCallback = Arc<dyn Fn(Response) + Send + Sync>;

/// Delivered when dispatch fails terminally (not EBUSY/EAGAIN).
/// Arguments: pid, error code.
pub type ErrorCallback = Arc<dyn Fn(i32, i32) + Send + Sync>;

#[derive(Default)]
struct SharedState {
    loads: Mutex<BTreeMap<u32, i32>>,
    loads_proc: Mutex<BTreeMap<i32, i32>>,
    map: Mutex<BTreeMap<i32, BTreeMap<i32, Request>>>,
    running: Mutex<BTreeMap<(i32, u32), BTreeSet<i32>>>,
    stopped: Mutex<BTreeSet<i32>>,
}

/// Owns the request lifecycle for every device: admission, dispatch,
/// completion, and the per-process teardown paths used by the service
/// facade and the liveness watchdog.
pub struct Scheduler<P: SchedulerPolicy> {
    policy: P,
    shared: SharedState,
    pool: Arc<DevicePool>,
    validator: TaskValidator,
    on_complete: CompletionCallback,
    on_error: ErrorCallback,
}

impl<P: SchedulerPolicy> Scheduler<P> {
    pub fn new(
        policy: P,
        pool: Arc<DevicePool>,
        validator: TaskValidator,
        on_complete: CompletionCallback,
        on_error: ErrorCallback,
    ) -> Self {
        Self {
            policy,
            shared: SharedState::default(),
            pool,
            validator,
            on_complete,
            on_error,
        }
    }

    pub fn load(&self, device_id: u32) -> i32 {
        *self.shared.loads.lock().get(&device_id).unwrap_or(&0)
    }

    pub fn get_proc_load(&self, pid: i32) -> i32 {
        *self.shared.loads_proc.lock().get(&pid).unwrap_or(&0)
    }

    /// Admit `req` for dispatch on `device_id`.
    pub fn add_scheduler(&self, req: Request, device_id: u32) {
        let pid = req.proc_id;
        if self.shared.stopped.lock().contains(&pid) {
            return;
        }

        self.shared
            .map
            .lock()
            .entry(pid)
            .or_default()
            .insert(req.req_id, req.clone());
        *self.shared.loads_proc.lock().entry(pid).or_insert(0) += 1;

        self.policy.push(req, device_id);

        if self.load(device_id) < SCHED_THRESHOLD {
            self.schedule(device_id);
        }
    }

    /// Pop and dispatch one request for `device_id`.
    fn schedule(&self, device_id: u32) {
        let Some(req) = self.policy.pop(device_id) else {
            return;
        };
        let pid = req.proc_id;
        let req_id = req.req_id;

        if !(self.validator)(pid, device_id, req.task_id) {
            self.complete_with_error(pid, req_id, STATUS_INVALID_TASK);
            return;
        }

        let Some(core) = self.pool.get(device_id) else {
            self.complete_with_error(pid, req_id, STATUS_DEVICE_BLOCKED);
            return;
        };
        if core.device.is_blocked() {
            self.complete_with_error(pid, req_id, STATUS_DEVICE_BLOCKED);
            return;
        }

        self.shared
            .running
            .lock()
            .entry((pid, device_id))
            .or_default()
            .insert(req_id);
        *self.shared.loads.lock().entry(device_id).or_insert(0) += 1;

        let buf = encode_run_request(&req);
        let mut io_buf = buf;
        match core.execute(DeviceCmd::NpuRunReq, 0, &mut io_buf) {
            Ok(_) => {
                crate::stats::GLOBAL_STATS.record_dispatch();
            }
            Err(e) if e.is_busy() => {
                self.undo_dispatch(pid, device_id, req_id);
                self.policy.push(req, device_id);
            }
            Err(e) => {
                self.undo_dispatch(pid, device_id, req_id);
                crate::stats::GLOBAL_STATS.record_error();
                (self.on_error)(pid, e.code);
            }
        }
    }

    fn undo_dispatch(&self, pid: i32, device_id: u32, req_id: i32) {
        if let Some(set) = self.shared.running.lock().get_mut(&(pid, device_id)) {
            set.remove(&req_id);
        }
        if let Some(load) = self.shared.loads.lock().get_mut(&device_id) {
            *load = (*load - 1).max(0);
        }
    }

    fn complete_with_error(&self, pid: i32, req_id: i32, status: i32) {
        if let Some(load) = self.shared.loads_proc.lock().get_mut(&pid) {
            *load = (*load - 1).max(0);
        }
        self.shared
            .map
            .lock()
            .get_mut(&pid)
            .map(|m| m.remove(&req_id));
        crate::stats::GLOBAL_STATS.record_error();
        (self.on_error)(pid, status);
    }

    /// Record a completion reported by a response reader thread.
    pub fn finish_jobs(&self, device_id: u32, resp: Response) {
        let pid = resp.proc_id;
        let req_id = resp.req_id;

        if let Some(set) = self.shared.running.lock().get_mut(&(pid, device_id)) {
            set.remove(&req_id);
        }
        if let Some(load) = self.shared.loads.lock().get_mut(&device_id) {
            *load = (*load - 1).max(0);
        } else {
            log::warn!("dxrt-core: finish_jobs underflow on device {device_id} load");
        }
        if let Some(load) = self.shared.loads_proc.lock().get_mut(&pid) {
            *load = (*load - 1).max(0);
        }

        let task_id = self
            .shared
            .map
            .lock()
            .get_mut(&pid)
            .and_then(|m| m.remove(&req_id))
            .map(|r| r.task_id)
            .unwrap_or(-1);

        self.policy.on_complete(pid, task_id, resp.inf_time);
        crate::stats::GLOBAL_STATS.record_completion();
        (self.on_complete)(resp);

        if self.load(device_id) < SCHED_THRESHOLD {
            self.schedule(device_id);
        }
    }

    /// Clear all pending (not yet dispatched) work for `pid` and suspend
    /// future admission until `start_scheduler` is called.
    pub fn stop_scheduler(&self, pid: i32) {
        self.shared.map.lock().remove(&pid);
        self.shared.stopped.lock().insert(pid);
    }

    /// Re-arm admission for `pid` after a watchdog-forced clear.
    pub fn start_scheduler(&self, pid: i32) {
        self.shared.stopped.lock().remove(&pid);
    }

    /// Drop not-yet-running entries for one task; running requests are left
    /// for completion (or device reset) to drain.
    pub fn stop_task_inference(&self, pid: i32, _device_id: u32, task_id: i32) {
        if let Some(per_pid) = self.shared.map.lock().get_mut(&pid) {
            per_pid.retain(|_, r| r.task_id != task_id);
        }
    }

    pub fn stop_all_inference_for_process(&self, pid: i32, _device_id: u32) {
        self.shared.map.lock().remove(&pid);
    }

    pub fn clean_died_process(&self, pid: i32) {
        self.shared.loads_proc.lock().remove(&pid);
        self.shared.running.lock().retain(|(p, _), _| *p != pid);
    }

    pub fn clear_all_load(&self) {
        for v in self.shared.loads.lock().values_mut() {
            *v = 0;
        }
        for v in self.shared.loads_proc.lock().values_mut() {
            *v = 0;
        }
        self.shared.running.lock().clear();
    }

    pub fn clear_proc_load(&self, pid: i32) {
        self.shared.loads_proc.lock().insert(pid, 0);
        self.shared.running.lock().retain(|(p, _), _| *p != pid);
    }
}

fn encode_run_request(req: &Request) -> [u8; 48] {
    let mut buf = [0u8; 48];
    buf[0..4].copy_from_slice(&req.req_id.to_le_bytes());
    buf[4..8].copy_from_slice(&req.proc_id.to_le_bytes());
    buf[8..12].copy_from_slice(&req.task_id.to_le_bytes());
    buf[12..20].copy_from_slice(&req.input.base.to_le_bytes());
    buf[20..28].copy_from_slice(&req.input.size.to_le_bytes());
    buf[28..36].copy_from_slice(&req.output.base.to_le_bytes());
    buf[36..44].copy_from_slice(&req.output.size.to_le_bytes());
    buf[44] = req.bound as u8;
    buf[45] = req.priority;
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bound::BoundClass;
    use crate::device::core::DeviceCore;
    use crate::device::mock::MockAdapter;
    use crate::device::{Device, DeviceKind};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_pool_with_mock() -> Arc<DevicePool> {
        let device = Arc::new(Device::new(0, PathBuf::from("/dev/mock0"), DeviceKind::Acc, 0, 0, 1 << 20, 4));
        let core = Arc::new(DeviceCore::new(device, Box::new(MockAdapter::new("mock"))));
        Arc::new(DevicePool::from_cores(vec![core]))
    }

    fn sample_request(req_id: i32, pid: i32, task_id: i32) -> Request {
        Request {
            req_id,
            proc_id: pid,
            task_id,
            bound: BoundClass::Normal,
            input: Default::default(),
            output: Default::default(),
            cmd_offset: 0,
            weight_offset: 0,
            dma_ch: None,
            priority: 0,
            bandwidth_hint: 0,
        }
    }

    #[test]
    fn add_scheduler_dispatches_immediately_under_threshold() {
        let pool = make_pool_with_mock();
        let completions = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::clone(&completions);
        let sched = Scheduler::new(
            FifoPolicy::new(),
            pool,
            Arc::new(|_, _, _| true),
            Arc::new(move |_resp| {
                c2.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_, _| {}),
        );
        sched.add_scheduler(sample_request(1, 100, 0), 0);
        assert_eq!(sched.load(0), 1);
    }

    #[test]
    fn invalid_task_synthesizes_error_and_clears_state() {
        let pool = make_pool_with_mock();
        let errors = Arc::new(AtomicUsize::new(0));
        let e2 = Arc::clone(&errors);
        let sched = Scheduler::new(
            FifoPolicy::new(),
            pool,
            Arc::new(|_, _, _| false),
            Arc::new(|_resp| {}),
            Arc::new(move |_pid, _code| {
                e2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        sched.add_scheduler(sample_request(1, 100, 0), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(sched.get_proc_load(100), 0);
    }

    #[test]
    fn finish_jobs_decrements_and_is_floor_clamped() {
        let pool = make_pool_with_mock();
        let sched = Scheduler::new(
            FifoPolicy::new(),
            pool,
            Arc::new(|_, _, _| true),
            Arc::new(|_resp| {}),
            Arc::new(|_, _| {}),
        );
        sched.add_scheduler(sample_request(1, 100, 0), 0);
        sched.finish_jobs(
            0,
            Response {
                req_id: 1,
                proc_id: 100,
                inf_time: 42,
                status: 0,
                dma_ch: 0,
                argmax: None,
                ppu_filter_count: None,
            },
        );
        assert_eq!(sched.load(0), 0);
        assert_eq!(sched.get_proc_load(100), 0);
        // A second, unmatched finish_jobs must not underflow below zero.
        sched.finish_jobs(
            0,
            Response {
                req_id: 99,
                proc_id: 100,
                inf_time: 1,
                status: 0,
                dma_ch: 0,
                argmax: None,
                ppu_filter_count: None,
            },
        );
        assert_eq!(sched.load(0), 0);
    }

    #[test]
    fn stop_scheduler_suspends_admission_until_restarted() {
        let pool = make_pool_with_mock();
        let sched = Scheduler::new(
            FifoPolicy::new(),
            pool,
            Arc::new(|_, _, _| true),
            Arc::new(|_resp| {}),
            Arc::new(|_, _| {}),
        );
        sched.stop_scheduler(100);
        sched.add_scheduler(sample_request(1, 100, 0), 0);
        assert_eq!(sched.get_proc_load(100), 0);
        sched.start_scheduler(100);
        sched.add_scheduler(sample_request(2, 100, 0), 0);
        assert_eq!(sched.get_proc_load(100), 1);
    }
}
