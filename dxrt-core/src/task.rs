//! Task and per-process/device aggregate data model — §3.

use std::collections::{BTreeMap, BTreeSet};

use crate::bound::BoundClass;

/// `(pid, deviceId, taskId)` identity of a task.
pub type TaskKey = (i32, u32, i32);

/// A weight-region descriptor used for de-duplicated weight tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightRegion {
    pub address: u64,
    pub size: u64,
    pub checksum: u64,
}

/// One task: created on first reference to a compiled model on a device.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub pid: i32,
    pub device_id: u32,
    pub bound: BoundClass,
    pub mem_usage: u64,
    pub addresses: BTreeSet<u64>,
}

impl TaskInfo {
    pub fn new(pid: i32, device_id: u32, bound: BoundClass, mem_usage: u64) -> Self {
        Self {
            pid,
            device_id,
            bound,
            mem_usage,
            addresses: BTreeSet::new(),
        }
    }
}

/// Per-`(pid, deviceId)` aggregate.
#[derive(Debug, Clone, Default)]
pub struct ProcessWithDeviceInfo {
    tasks: BTreeMap<i32, TaskInfo>,
    weight_regions: BTreeSet<(u64, u64, u64)>,
}

impl ProcessWithDeviceInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_task(&self, task_id: i32) -> bool {
        self.tasks.contains_key(&task_id)
    }

    pub fn insert_task(&mut self, task_id: i32, info: TaskInfo) {
        self.tasks.insert(task_id, info);
    }

    pub fn task(&self, task_id: i32) -> Option<&TaskInfo> {
        self.tasks.get(&task_id)
    }

    pub fn task_mut(&mut self, task_id: i32) -> Option<&mut TaskInfo> {
        self.tasks.get_mut(&task_id)
    }

    pub fn remove_task(&mut self, task_id: i32) -> Option<TaskInfo> {
        self.tasks.remove(&task_id)
    }

    pub fn task_ids(&self) -> Vec<i32> {
        self.tasks.keys().copied().collect()
    }

    pub fn bound_counts(&self) -> BTreeMap<BoundClass, usize> {
        let mut counts = BTreeMap::new();
        for t in self.tasks.values() {
            *counts.entry(t.bound).or_insert(0) += 1;
        }
        counts
    }

    pub fn add_weight_region(&mut self, region: WeightRegion) -> bool {
        self.weight_regions
            .insert((region.address, region.size, region.checksum))
    }

    pub fn remove_weight_region(&mut self, region: WeightRegion) -> bool {
        self.weight_regions
            .remove(&(region.address, region.size, region.checksum))
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.weight_regions.is_empty()
    }
}
