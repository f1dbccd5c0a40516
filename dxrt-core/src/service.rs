//! Service facade — §4.G.
//!
//! Owns the global `(pid, deviceId) -> ProcessWithDeviceInfo` table behind
//! one mutex, a per-device memory arena/tier pair, the device pool, and the
//! scheduler. One handler method per `RequestCode`, grounded on
//! `dxrt_service.cpp`'s message-dispatch switch and `memory_service.cpp`'s
//! `TaskInit`/`IsTaskValid` algorithm.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::{DeviceArena, MemoryTier};
use crate::bound::BoundClass;
use crate::device::pool::DevicePool;
use crate::error::ErrorKind;
use crate::request::{IpcClientMessage, IpcServerMessage, RequestCode, Response};
use crate::scheduler::{Scheduler, SchedulerPolicy};
use crate::task::{ProcessWithDeviceInfo, TaskInfo, WeightRegion};

/// Per-device memory state: the arena plus the dual-indexed memory tier
/// built on top of it (spec.md §4.B's explicit open question — both
/// indices are kept).
struct DeviceResources {
    arena: DeviceArena,
    memory: MemoryTier,
}

/// Global facade state, shared (via `Arc`) with the scheduler's task
/// validator closure so `Scheduler<P>` can be constructed before the
/// facade that owns it.
pub struct FacadeState {
    processes: Mutex<std::collections::BTreeMap<(i32, u32), ProcessWithDeviceInfo>>,
    devices: std::collections::BTreeMap<u32, DeviceResources>,
    known_pids: Mutex<BTreeSet<i32>>,
}

impl FacadeState {
    fn new(pool: &DevicePool) -> Self {
        let mut devices = std::collections::BTreeMap::new();
        for core in pool.iter() {
            devices.insert(
                core.id(),
                DeviceResources {
                    arena: DeviceArena::new(core.device.mem_base, core.device.mem_size),
                    memory: MemoryTier::new(),
                },
            );
        }
        Self {
            processes: Mutex::new(std::collections::BTreeMap::new()),
            devices,
            known_pids: Mutex::new(BTreeSet::new()),
        }
    }

    /// `IsTaskValid`: the service table contains the task **and** the
    /// memory tier has at least one allocation recorded under
    /// `(pid, taskId)` (§4.G).
    pub fn is_task_valid(&self, pid: i32, device_id: u32, task_id: i32) -> bool {
        let has_entry = self
            .processes
            .lock()
            .get(&(pid, device_id))
            .is_some_and(|p| p.has_task(task_id));
        let has_memory = self
            .devices
            .get(&device_id)
            .is_some_and(|d| d.memory.has_task_allocation(pid, task_id));
        has_entry && has_memory
    }

    pub fn register_pid(&self, pid: i32) {
        self.known_pids.lock().insert(pid);
    }

    pub fn forget_pid(&self, pid: i32) {
        self.known_pids.lock().remove(&pid);
    }

    pub fn known_pids(&self) -> Vec<i32> {
        self.known_pids.lock().iter().copied().collect()
    }
}

/// Sent asynchronously to a client outside of a direct request/reply turn:
/// scheduled-inference completions, and `ERROR_REPORT` broadcasts.
pub type ReplySender = Arc<dyn Fn(i32, IpcServerMessage) + Send + Sync>;

/// Routes messages to per-`RequestCode` handlers, owns the one mutex over
/// the process table (§4.G), and wires scheduler completions/errors back
/// out to clients via `reply`.
pub struct ServiceFacade<P: SchedulerPolicy> {
    state: Arc<FacadeState>,
    pool: Arc<DevicePool>,
    scheduler: Arc<Scheduler<P>>,
    reply: ReplySender,
    dump_dir: PathBuf,
}

impl<P: SchedulerPolicy + 'static> ServiceFacade<P> {
    /// Build the facade's shared state and the scheduler that references it,
    /// breaking the facade/scheduler/device cyclic ownership the design
    /// calls out in §9 by handing the scheduler only a non-owning validator
    /// closure over an `Arc<FacadeState>`.
    pub fn new(
        pool: Arc<DevicePool>,
        policy: P,
        reply: ReplySender,
        dump_dir: PathBuf,
    ) -> Self {
        let state = Arc::new(FacadeState::new(&pool));

        let validator_state = Arc::clone(&state);
        let validator = Arc::new(move |pid: i32, device_id: u32, task_id: i32| {
            validator_state.is_task_valid(pid, device_id, task_id)
        });

        let complete_reply = Arc::clone(&reply);
        let on_complete = Arc::new(move |resp: Response| {
            let msg = IpcServerMessage {
                code: crate::ipc::protocol::scheduled_inference_code(resp.dma_ch),
                msg_type: resp.proc_id as i64,
                device_id: -1,
                data: 0,
                result: resp.status,
                response: Some(resp),
            };
            complete_reply(resp.proc_id, msg);
        });

        let error_reply = Arc::clone(&reply);
        let on_error = Arc::new(move |pid: i32, code: i32| {
            let msg = IpcServerMessage::error(pid as i64, -1, code);
            error_reply(pid, msg);
        });

        let scheduler = Arc::new(Scheduler::new(policy, Arc::clone(&pool), validator, on_complete, on_error));

        Self {
            state,
            pool,
            scheduler,
            reply,
            dump_dir,
        }
    }

    pub fn scheduler(&self) -> Arc<Scheduler<P>> {
        Arc::clone(&self.scheduler)
    }

    pub fn state(&self) -> Arc<FacadeState> {
        Arc::clone(&self.state)
    }

    pub fn pool(&self) -> Arc<DevicePool> {
        Arc::clone(&self.pool)
    }

    /// Broadcast an `ERROR_REPORT` to every known pid — used for
    /// device-side faults (§4.D/§7), which affect every client that might
    /// have work on the blocked device.
    pub fn broadcast_error(&self, kind: ErrorKind, result: i32, device_id: i32) {
        for pid in self.state.known_pids() {
            let msg = IpcServerMessage::error(pid as i64, device_id, encode_kind(kind, result));
            (self.reply)(pid, msg);
        }
    }

    /// Broadcast an `ERROR_REPORT` to one pid only — used for the
    /// watchdog's forced-termination path (§4.H/§7), which only concerns
    /// the dying process.
    pub fn notify_error(&self, pid: i32, kind: ErrorKind, result: i32, device_id: i32) {
        let msg = IpcServerMessage::error(pid as i64, device_id, encode_kind(kind, result));
        (self.reply)(pid, msg);
    }

    /// Dispatch one decoded client message to its handler. Never panics on
    /// a malformed request — an unreachable `RequestCode` branch can only
    /// be hit for `InvalidRequestCode`/`ErrorReport`/`DoScheduledInference`,
    /// which a client never legitimately sends; those fall through to the
    /// generic invalid-request reply (§7).
    pub fn handle(&self, msg: IpcClientMessage) -> IpcServerMessage {
        let Some(code) = RequestCode::from_raw(msg.code) else {
            return IpcServerMessage::error(msg.msg_type, -1, 0);
        };

        use RequestCode::*;
        match code {
            GetMemory => self.get_memory(&msg, false),
            GetMemoryForModel => self.get_memory(&msg, true),
            FreeMemory => self.free_memory(&msg),
            DeviceInit => self.device_init(&msg, true),
            DeviceDeinit => self.device_init(&msg, false),
            TaskInit => self.task_init(&msg),
            TaskDeinit => self.task_deinit(&msg),
            RequestScheduleInference => self.schedule_inference(&msg),
            DeallocateTaskMemory => self.deallocate_task_memory(&msg),
            ProcessDeinit => self.process_deinit(&msg),
            ViewFreeMemory => self.view_memory(&msg, true),
            ViewUsedMemory => self.view_memory(&msg, false),
            ViewAvailableDevice => self.view_available_device(&msg),
            GetUsage => self.get_usage(&msg),
            DeviceReset | InferenceCompleted => IpcServerMessage::ok(msg.msg_type, code, 0),
            Close => self.close(&msg),
            ErrorReport | DoScheduledInference | InvalidRequestCode => {
                IpcServerMessage::error(msg.msg_type, -1, 0)
            }
        }
    }

    fn get_memory(&self, msg: &IpcClientMessage, backward: bool) -> IpcServerMessage {
        self.state.register_pid(msg.pid);
        let Some(dev) = self.state.devices.get(&msg.device_id) else {
            return IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1);
        };

        let size = if backward { msg.model_memory_size } else { msg.data };
        let result = if backward {
            dev.arena.backward_allocate(size)
        } else {
            dev.arena.allocate(size)
        };

        match result {
            Ok(addr) => {
                let task_id = if msg.task_id != 0 { Some(msg.task_id) } else { None };
                dev.memory.record(msg.pid, task_id, addr);
                crate::stats::GLOBAL_STATS.record_alloc(size);
                IpcServerMessage::ok(msg.msg_type, RequestCode::GetMemory, addr as i64)
            }
            Err(_) => IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1),
        }
    }

    fn free_memory(&self, msg: &IpcClientMessage) -> IpcServerMessage {
        let Some(dev) = self.state.devices.get(&msg.device_id) else {
            return IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1);
        };
        let addr = msg.data;
        let task_id = if msg.task_id != 0 { Some(msg.task_id) } else { None };
        if dev.memory.forget(msg.pid, task_id, addr) {
            if let Some(size) = dev.arena.deallocate(addr) {
                crate::stats::GLOBAL_STATS.record_free(size);
            }
            IpcServerMessage::ok(msg.msg_type, RequestCode::FreeMemory, 0)
        } else {
            IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1)
        }
    }

    /// `DEVICE_INIT`/`DEVICE_DEINIT`: record (or erase) a de-duplicated
    /// weight-region descriptor on the process/device entry. The checksum
    /// field of the original's weight descriptor has no wire counterpart
    /// here (model-file parsing producing it is out of scope, §1); the
    /// task id field is repurposed to carry it, matching the original
    /// protocol's practice of overloading message fields per code.
    fn device_init(&self, msg: &IpcClientMessage, add: bool) -> IpcServerMessage {
        let region = WeightRegion {
            address: msg.data,
            size: msg.model_memory_size,
            checksum: msg.task_id as u64,
        };
        let mut processes = self.state.processes.lock();
        let entry = processes.entry((msg.pid, msg.device_id)).or_default();
        let changed = if add {
            entry.add_weight_region(region)
        } else {
            entry.remove_weight_region(region)
        };
        let code = if add { RequestCode::DeviceInit } else { RequestCode::DeviceDeinit };
        IpcServerMessage::ok(msg.msg_type, code, changed as i64)
    }

    /// `TASK_INIT`: pre-check → reject-if-present → insert → bound add,
    /// exactly the four steps of §4.G.
    fn task_init(&self, msg: &IpcClientMessage) -> IpcServerMessage {
        let Some(dev) = self.state.devices.get(&msg.device_id) else {
            return IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1);
        };
        let Some(core) = self.pool.get(msg.device_id) else {
            return IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1);
        };

        if dev.arena.free_size() < msg.model_memory_size {
            dev.arena.compact();
            if dev.arena.free_size() < msg.model_memory_size {
                return IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1);
            }
        }

        let mut processes = self.state.processes.lock();
        let entry = processes.entry((msg.pid, msg.device_id)).or_default();
        if entry.has_task(msg.task_id) {
            return IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1);
        }

        let bound = msg.request.as_ref().map(|r| r.bound).unwrap_or(BoundClass::Normal);
        if !core.can_accept_bound(bound) {
            return IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1);
        }

        entry.insert_task(msg.task_id, TaskInfo::new(msg.pid, msg.device_id, bound, msg.model_memory_size));
        drop(processes);

        if core.add_bound(bound).is_err() {
            self.state
                .processes
                .lock()
                .get_mut(&(msg.pid, msg.device_id))
                .map(|p| p.remove_task(msg.task_id));
            return IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1);
        }

        self.state.register_pid(msg.pid);
        IpcServerMessage::ok(msg.msg_type, RequestCode::TaskInit, 0)
    }

    /// `TASK_DEINIT`: release the bound reservation and drop the table
    /// entry. Memory is reclaimed separately by `DEALLOCATE_TASK_MEMORY`
    /// (§4.G, §5's ordering guarantee).
    fn task_deinit(&self, msg: &IpcClientMessage) -> IpcServerMessage {
        let task = {
            let mut processes = self.state.processes.lock();
            processes
                .get_mut(&(msg.pid, msg.device_id))
                .and_then(|p| p.remove_task(msg.task_id))
        };
        let Some(task) = task else {
            return IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1);
        };
        if let Some(core) = self.pool.get(msg.device_id) {
            let _ = core.delete_bound(task.bound);
        }
        self.scheduler.stop_task_inference(msg.pid, msg.device_id, msg.task_id);
        IpcServerMessage::ok(msg.msg_type, RequestCode::TaskDeinit, 0)
    }

    fn schedule_inference(&self, msg: &IpcClientMessage) -> IpcServerMessage {
        let Some(request) = msg.request.clone() else {
            return IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1);
        };
        if !self.state.is_task_valid(msg.pid, msg.device_id, msg.task_id) {
            return IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1);
        }
        self.scheduler.add_scheduler(request, msg.device_id);
        IpcServerMessage::ok(msg.msg_type, RequestCode::RequestScheduleInference, 0)
    }

    /// `DEALLOCATE_TASK_MEMORY`: free every address held by `(pid, taskId)`;
    /// reject if the task is still present in the service table (it must
    /// have been `TASK_DEINIT`ed first, §5's ordering guarantee).
    fn deallocate_task_memory(&self, msg: &IpcClientMessage) -> IpcServerMessage {
        let still_live = self
            .state
            .processes
            .lock()
            .get(&(msg.pid, msg.device_id))
            .is_some_and(|p| p.has_task(msg.task_id));
        if still_live {
            return IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1);
        }
        let Some(dev) = self.state.devices.get(&msg.device_id) else {
            return IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1);
        };
        for addr in dev.memory.addresses_for_task(msg.pid, msg.task_id) {
            dev.memory.forget(msg.pid, Some(msg.task_id), addr);
            dev.arena.deallocate(addr);
        }
        dev.memory.clear_task(msg.pid, msg.task_id);
        IpcServerMessage::ok(msg.msg_type, RequestCode::DeallocateTaskMemory, 0)
    }

    /// `PROCESS_DEINIT`: stop the scheduler for `pid`, `TaskDeInit` every
    /// task the process holds across every device, erase its table
    /// entries, then free all of its device memory (§4.G).
    fn process_deinit(&self, msg: &IpcClientMessage) -> IpcServerMessage {
        let pid = msg.pid;
        self.scheduler.stop_scheduler(pid);
        self.teardown_tasks_for_pid(pid);
        self.free_all_memory_for_pid(pid);
        self.state.forget_pid(pid);
        IpcServerMessage::ok(msg.msg_type, RequestCode::ProcessDeinit, 0)
    }

    /// `TaskDeInit` every task `pid` holds on every device: release its
    /// bound reservation and erase its table entry. Shared by
    /// `PROCESS_DEINIT` and the watchdog's dead-process reclaim.
    fn teardown_tasks_for_pid(&self, pid: i32) {
        let entries: Vec<(u32, Vec<i32>)> = {
            let processes = self.state.processes.lock();
            processes
                .iter()
                .filter(|((p, _), _)| *p == pid)
                .map(|((_, d), info)| (*d, info.task_ids()))
                .collect()
        };

        for (device_id, task_ids) in entries {
            for task_id in task_ids {
                let task = self
                    .state
                    .processes
                    .lock()
                    .get_mut(&(pid, device_id))
                    .and_then(|p| p.remove_task(task_id));
                if let Some(task) = task {
                    if let Some(core) = self.pool.get(device_id) {
                        let _ = core.delete_bound(task.bound);
                    }
                }
            }
            self.state.processes.lock().remove(&(pid, device_id));
        }
    }

    /// Free every address `pid` holds on every device. Shared by
    /// `PROCESS_DEINIT`, `CLOSE`, and the watchdog's dead-process reclaim.
    fn free_all_memory_for_pid(&self, pid: i32) {
        for dev in self.state.devices.values() {
            for addr in dev.memory.addresses_for_pid(pid) {
                dev.arena.deallocate(addr);
            }
            dev.memory.clear_pid(pid);
        }
    }

    fn view_memory(&self, msg: &IpcClientMessage, free: bool) -> IpcServerMessage {
        let Some(dev) = self.state.devices.get(&msg.device_id) else {
            return IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1);
        };
        let value = if free { dev.arena.free_size() } else { dev.arena.used_size() };
        let code = if free { RequestCode::ViewFreeMemory } else { RequestCode::ViewUsedMemory };
        IpcServerMessage::ok(msg.msg_type, code, value as i64)
    }

    /// Bitmask of non-blocked devices, bit `i` set when device `i` is
    /// available (§4.G).
    fn view_available_device(&self, msg: &IpcClientMessage) -> IpcServerMessage {
        let mut mask: i64 = 0;
        for core in self.pool.iter() {
            if !core.device.is_blocked() {
                mask |= 1 << core.id();
            }
        }
        IpcServerMessage::ok(msg.msg_type, RequestCode::ViewAvailableDevice, mask)
    }

    /// Device duty cycle, scaled ×1000 (§4.G).
    fn get_usage(&self, msg: &IpcClientMessage) -> IpcServerMessage {
        let Some(core) = self.pool.get(msg.device_id) else {
            return IpcServerMessage::error(msg.msg_type, msg.device_id as i32, -1);
        };
        let permille = core.device.duty_cycle.permille();
        IpcServerMessage::ok(msg.msg_type, RequestCode::GetUsage, permille as i64)
    }

    fn close(&self, msg: &IpcClientMessage) -> IpcServerMessage {
        self.free_all_memory_for_pid(msg.pid);
        IpcServerMessage::ok(msg.msg_type, RequestCode::Close, 0)
    }

    /// Device ids `pid` currently has a table entry or live memory on —
    /// used by the watchdog to scope a forced `RECOVERY` to the devices a
    /// dying process actually touched (§4.H.1).
    pub fn devices_touched_by(&self, pid: i32) -> Vec<u32> {
        let mut ids: BTreeSet<u32> = self
            .state
            .processes
            .lock()
            .keys()
            .filter(|(p, _)| *p == pid)
            .map(|(_, d)| *d)
            .collect();
        for (device_id, dev) in &self.state.devices {
            if !dev.memory.addresses_for_pid(pid).is_empty() {
                ids.insert(*device_id);
            }
        }
        ids.into_iter().collect()
    }

    /// Staged cleanup step 2+3 of `handle_process_die` (§4.H.1): under the
    /// facade mutex, `TaskDeInit` every task `pid` holds on every device,
    /// erase its table entries, then free all of its device memory.
    pub fn reclaim_dead_process(&self, pid: i32) {
        self.teardown_tasks_for_pid(pid);
        self.free_all_memory_for_pid(pid);
    }

    /// Drop `pid` from the known-pid set the watchdog and `ERROR_REPORT`
    /// broadcasts consult (§4.H step 1).
    pub fn forget_pid(&self, pid: i32) {
        self.state.forget_pid(pid);
    }

    /// Coalescing `compact()` on every device's arena — the watchdog calls
    /// this every 10 cycles (§4.H).
    pub fn compact_all(&self) {
        for dev in self.state.devices.values() {
            dev.arena.compact();
        }
    }
}

fn encode_kind(kind: ErrorKind, result: i32) -> i32 {
    // The error kind is carried in `data` by the caller; `result` stays the
    // raw status/error code, matching `IPCServerMessage{result, data}`'s
    // split between a semantic kind and a raw code (§7).
    let _ = kind;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bound::BoundClass;
    use crate::device::core::DeviceCore;
    use crate::device::mock::MockAdapter;
    use crate::device::{Device, DeviceKind};
    use crate::request::MemRegion;
    use crate::scheduler::FifoPolicy;
    use std::path::PathBuf;

    fn make_pool() -> Arc<DevicePool> {
        let device = Arc::new(Device::new(0, PathBuf::from("/dev/mock0"), DeviceKind::Acc, 0, 0, 1 << 20, 4));
        let core = Arc::new(DeviceCore::new(device, Box::new(MockAdapter::new("mock"))));
        Arc::new(DevicePool::from_cores(vec![core]))
    }

    fn facade_with_reply() -> (ServiceFacade<FifoPolicy>, Arc<Mutex<Vec<(i32, IpcServerMessage)>>>) {
        let pool = make_pool();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent2 = Arc::clone(&sent);
        let reply: ReplySender = Arc::new(move |pid, msg| sent2.lock().push((pid, msg)));
        let facade = ServiceFacade::new(pool, FifoPolicy::new(), reply, PathBuf::from("/tmp"));
        (facade, sent)
    }

    fn client_msg(code: RequestCode, pid: i32, device_id: u32, task_id: i32, data: u64, mem: u64) -> IpcClientMessage {
        IpcClientMessage {
            code: code as i32,
            msg_type: pid as i64,
            pid,
            device_id,
            task_id,
            data,
            model_memory_size: mem,
            request: Some(crate::request::Request {
                req_id: 1,
                proc_id: pid,
                task_id,
                bound: BoundClass::Normal,
                input: MemRegion::default(),
                output: MemRegion::default(),
                cmd_offset: 0,
                weight_offset: 0,
                dma_ch: None,
                priority: 0,
                bandwidth_hint: 0,
            }),
        }
    }

    #[test]
    fn get_memory_then_free_memory_round_trips() {
        let (facade, _sent) = facade_with_reply();
        let reply = facade.handle(client_msg(RequestCode::GetMemory, 100, 0, 0, 4096, 0));
        assert_eq!(reply.result, 0);
        let addr = reply.data as u64;

        let free_reply = facade.handle(client_msg(RequestCode::FreeMemory, 100, 0, 0, addr, 0));
        assert_eq!(free_reply.result, 0);
    }

    #[test]
    fn task_init_then_schedule_inference_smoke() {
        let (facade, sent) = facade_with_reply();

        let mem_reply = facade.handle(client_msg(RequestCode::GetMemory, 100, 0, 1, 1 << 20, 0));
        assert_eq!(mem_reply.result, 0);

        let init_reply = facade.handle(client_msg(RequestCode::TaskInit, 100, 0, 1, 0, 1 << 20));
        assert_eq!(init_reply.result, 0);

        let sched_reply = facade.handle(client_msg(RequestCode::RequestScheduleInference, 100, 0, 1, 0, 0));
        assert_eq!(sched_reply.result, 0);

        // MockAdapter's ioctl defaults to Ok(0) with no scripted outcome,
        // so dispatch succeeds immediately; the reply fires once `finish_jobs`
        // is invoked by whoever owns the reader thread in production. Here
        // we drive it directly to complete the smoke scenario end-to-end.
        facade.scheduler().finish_jobs(
            0,
            Response {
                req_id: 1,
                proc_id: 100,
                inf_time: 5000,
                status: 0,
                dma_ch: 0,
                argmax: None,
                ppu_filter_count: None,
            },
        );

        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 100);
    }

    #[test]
    fn task_init_rejects_duplicate_task_id() {
        let (facade, _sent) = facade_with_reply();
        facade.handle(client_msg(RequestCode::GetMemory, 100, 0, 1, 4096, 0));
        let first = facade.handle(client_msg(RequestCode::TaskInit, 100, 0, 1, 0, 4096));
        assert_eq!(first.result, 0);
        let second = facade.handle(client_msg(RequestCode::TaskInit, 100, 0, 1, 0, 4096));
        assert_ne!(second.result, 0);
    }

    #[test]
    fn bound_cap_rejects_fourth_distinct_class() {
        let (facade, _sent) = facade_with_reply();
        let classes = [BoundClass::Only0, BoundClass::Only1, BoundClass::Only2, BoundClass::Pair01];
        let mut results = Vec::new();
        for (i, class) in classes.iter().enumerate() {
            let mut msg = client_msg(RequestCode::TaskInit, 100 + i as i32, 0, i as i32 + 1, 0, 4096);
            msg.request.as_mut().unwrap().bound = *class;
            results.push(facade.handle(msg).result);
        }
        assert_eq!(results[0..3], [0, 0, 0]);
        assert_ne!(results[3], 0);
    }

    #[test]
    fn deallocate_task_memory_rejects_while_task_still_live() {
        let (facade, _sent) = facade_with_reply();
        facade.handle(client_msg(RequestCode::GetMemory, 100, 0, 1, 4096, 0));
        facade.handle(client_msg(RequestCode::TaskInit, 100, 0, 1, 0, 4096));
        let reply = facade.handle(client_msg(RequestCode::DeallocateTaskMemory, 100, 0, 1, 0, 0));
        assert_ne!(reply.result, 0);

        facade.handle(client_msg(RequestCode::TaskDeinit, 100, 0, 1, 0, 0));
        let reply = facade.handle(client_msg(RequestCode::DeallocateTaskMemory, 100, 0, 1, 0, 0));
        assert_eq!(reply.result, 0);
    }

    #[test]
    fn process_deinit_clears_everything() {
        let (facade, _sent) = facade_with_reply();
        facade.handle(client_msg(RequestCode::GetMemory, 100, 0, 1, 4096, 0));
        facade.handle(client_msg(RequestCode::TaskInit, 100, 0, 1, 0, 4096));
        facade.handle(client_msg(RequestCode::ProcessDeinit, 100, 0, 0, 0, 0));

        assert!(!facade.state().is_task_valid(100, 0, 1));
        let view = facade.handle(client_msg(RequestCode::ViewUsedMemory, 100, 0, 0, 0, 0));
        assert_eq!(view.data, 0);
    }

    #[test]
    fn unknown_code_is_rejected_without_panic() {
        let (facade, _sent) = facade_with_reply();
        let mut msg = client_msg(RequestCode::GetMemory, 100, 0, 0, 0, 0);
        msg.code = 99_999;
        let reply = facade.handle(msg);
        assert_eq!(reply.code, RequestCode::InvalidRequestCode as i32);
    }
}
