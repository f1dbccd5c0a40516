//! Round-robin policy: per-device `pid -> queue<reqId>` plus a rotating
//! cursor, grounded on `RoundRobinSchedulerService` (`scheduler_service.h`).

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;

use crate::request::Request;

use super::SchedulerPolicy;

#[derive(Default)]
struct DeviceQueues {
    by_pid: BTreeMap<i32, VecDeque<Request>>,
    cursor: Option<i32>,
}

#[derive(Default)]
pub struct RoundRobinPolicy {
    devices: Mutex<BTreeMap<u32, DeviceQueues>>,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchedulerPolicy for RoundRobinPolicy {
    fn push(&self, request: Request, device_id: u32) {
        let mut devices = self.devices.lock();
        let dq = devices.entry(device_id).or_default();
        dq.by_pid.entry(request.proc_id).or_default().push_back(request);
    }

    fn pop(&self, device_id: u32) -> Option<Request> {
        let mut devices = self.devices.lock();
        let dq = devices.get_mut(&device_id)?;
        if dq.by_pid.is_empty() {
            return None;
        }

        let pids: Vec<i32> = dq.by_pid.keys().copied().collect();
        let start_idx = match dq.cursor {
            Some(c) => pids.iter().position(|p| *p > c).unwrap_or(0),
            None => 0,
        };

        for offset in 0..pids.len() {
            let idx = (start_idx + offset) % pids.len();
            let pid = pids[idx];
            if let Some(queue) = dq.by_pid.get_mut(&pid) {
                if let Some(req) = queue.pop_front() {
                    if queue.is_empty() {
                        dq.by_pid.remove(&pid);
                    }
                    dq.cursor = Some(pid);
                    return Some(req);
                }
            }
        }
        None
    }

    fn on_complete(&self, _pid: i32, _task_id: i32, _inf_time: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bound::BoundClass;

    fn req(id: i32, pid: i32) -> Request {
        Request {
            req_id: id,
            proc_id: pid,
            task_id: 0,
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
    fn alternates_between_processes() {
        let p = RoundRobinPolicy::new();
        p.push(req(1, 100), 0);
        p.push(req(2, 100), 0);
        p.push(req(3, 200), 0);

        assert_eq!(p.pop(0).unwrap().proc_id, 100);
        assert_eq!(p.pop(0).unwrap().proc_id, 200);
        assert_eq!(p.pop(0).unwrap().proc_id, 100);
        assert!(p.pop(0).is_none());
    }
}
