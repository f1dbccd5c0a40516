//! Shortest-job-first policy: per-device priority queue keyed by
//! `(task_time_estimate, req_id)` ascending. `task_time_estimate` is the
//! first observed `inf_time` for `(pid, taskId)`, written once and never
//! smoothed. Grounded on `SJFSchedulerService` /
//! `InferenceTimeCheckSchedulerService` (`scheduler_service.h`).

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use parking_lot::Mutex;

use crate::request::Request;

use super::SchedulerPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    time_estimate: u32,
    req_id: i32,
    request: RequestHandle,
}

// `Request` doesn't implement `Ord`; keep only the fields the heap orders
// on directly and stash the full request behind a small wrapper so the
// `BinaryHeap<Reverse<Entry>>` comparison never has to look inside it.
#[derive(Debug, Clone)]
struct RequestHandle(Request);

impl PartialEq for RequestHandle {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}
impl Eq for RequestHandle {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.time_estimate, self.req_id).cmp(&(other.time_estimate, other.req_id))
    }
}

#[derive(Default)]
pub struct SjfPolicy {
    queues: Mutex<BTreeMap<u32, BinaryHeap<Reverse<Entry>>>>,
    estimates: Mutex<BTreeMap<(i32, i32), u32>>,
}

impl SjfPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn estimate_for(&self, pid: i32, task_id: i32) -> u32 {
        *self.estimates.lock().get(&(pid, task_id)).unwrap_or(&0)
    }
}

impl SchedulerPolicy for SjfPolicy {
    fn push(&self, request: Request, device_id: u32) {
        let estimate = self.estimate_for(request.proc_id, request.task_id);
        let entry = Entry {
            time_estimate: estimate,
            req_id: request.req_id,
            request: RequestHandle(request),
        };
        self.queues.lock().entry(device_id).or_default().push(Reverse(entry));
    }

    fn pop(&self, device_id: u32) -> Option<Request> {
        self.queues
            .lock()
            .get_mut(&device_id)
            .and_then(|q| q.pop())
            .map(|Reverse(entry)| entry.request.0)
    }

    fn on_complete(&self, pid: i32, task_id: i32, inf_time: u32) {
        self.estimates.lock().entry((pid, task_id)).or_insert(inf_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bound::BoundClass;

    fn req(id: i32, pid: i32, task_id: i32) -> Request {
        Request {
            req_id: id,
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
    fn unknown_tasks_default_to_zero_estimate_and_tie_break_on_req_id() {
        let p = SjfPolicy::new();
        p.push(req(5, 100, 0), 0);
        p.push(req(1, 100, 1), 0);
        assert_eq!(p.pop(0).unwrap().req_id, 1);
        assert_eq!(p.pop(0).unwrap().req_id, 5);
    }

    #[test]
    fn shorter_known_task_goes_first() {
        let p = SjfPolicy::new();
        p.on_complete(100, 0, 50);
        p.on_complete(100, 1, 10);
        p.push(req(1, 100, 0), 0);
        p.push(req(2, 100, 1), 0);
        assert_eq!(p.pop(0).unwrap().task_id, 1);
        assert_eq!(p.pop(0).unwrap().task_id, 0);
    }

    #[test]
    fn estimate_is_written_once_not_smoothed() {
        let p = SjfPolicy::new();
        p.on_complete(100, 0, 10);
        p.on_complete(100, 0, 999);
        assert_eq!(p.estimate_for(100, 0), 10);
    }
}
