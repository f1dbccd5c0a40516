//! First-in-first-out policy: one queue per device, grounded on
//! `FIFOSchedulerService` (`scheduler_service.h`).

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;

use crate::request::Request;

use super::SchedulerPolicy;

#[derive(Default)]
pub struct FifoPolicy {
    queues: Mutex<BTreeMap<u32, VecDeque<Request>>>,
}

impl FifoPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchedulerPolicy for FifoPolicy {
    fn push(&self, request: Request, device_id: u32) {
        self.queues.lock().entry(device_id).or_default().push_back(request);
    }

    fn pop(&self, device_id: u32) -> Option<Request> {
        self.queues.lock().get_mut(&device_id).and_then(|q| q.pop_front())
    }

    fn on_complete(&self, _pid: i32, _task_id: i32, _inf_time: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bound::BoundClass;

    fn req(id: i32) -> Request {
        Request {
            req_id: id,
            proc_id: 1,
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
    fn pops_in_insertion_order() {
        let p = FifoPolicy::new();
        p.push(req(1), 0);
        p.push(req(2), 0);
        assert_eq!(p.pop(0).unwrap().req_id, 1);
        assert_eq!(p.pop(0).unwrap().req_id, 2);
        assert!(p.pop(0).is_none());
    }

    #[test]
    fn devices_are_independent() {
        let p = FifoPolicy::new();
        p.push(req(1), 0);
        p.push(req(2), 1);
        assert_eq!(p.pop(1).unwrap().req_id, 2);
        assert_eq!(p.pop(0).unwrap().req_id, 1);
    }
}
