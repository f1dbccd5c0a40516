//! Device memory arena — §4.B.
//!
//! Best-fit / back-allocated address-range allocator over a fixed
//! `[base, base+size)` interval, plus the service-wide PID/task memory
//! tiers built on top of it.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

use crate::error::{ErrorKind, ServiceError};

/// Alignment every allocation is rounded up to, in bytes.
pub const MEMORY_ALIGNMENT: u64 = 64;

/// Allocations at or above this size are eligible to trigger defragmentation
/// on an otherwise-failed `allocate`.
pub const LARGE_ALLOCATION_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Fragmentation ratio above which a large-allocation failure triggers a
/// defrag-and-retry.
pub const MEDIUM_FRAGMENTATION_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Free,
    Busy,
    Permanent,
}

#[derive(Debug, Clone, Copy)]
struct ArenaNode {
    addr: u64,
    size: u64,
    status: NodeStatus,
}

/// Aggregate fragmentation snapshot, returned by `fragmentation_info`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FragmentationInfo {
    pub total_free: u64,
    pub largest_free: u64,
    pub smallest_free: u64,
    pub count: usize,
    pub ratio: f64,
}

fn align_up(size: u64, align: u64) -> u64 {
    (size + align - 1) / align * align
}

/// Best-fit allocator over one device's address range.
///
/// Invariants held under `inner`'s lock: nodes partition `[base, base+size)`
/// with no gaps; no two adjacent nodes are both `Free` (merge-on-free keeps
/// this); `used_size` equals the sum of `Busy`/`Permanent` node sizes.
pub struct DeviceArena {
    base: u64,
    size: u64,
    inner: Mutex<BTreeMap<u64, ArenaNode>>,
}

impl DeviceArena {
    pub fn new(base: u64, size: u64) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            base,
            ArenaNode {
                addr: base,
                size,
                status: NodeStatus::Free,
            },
        );
        Self {
            base,
            size,
            inner: Mutex::new(nodes),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn free_size(&self) -> u64 {
        let nodes = self.inner.lock();
        nodes
            .values()
            .filter(|n| n.status == NodeStatus::Free)
            .map(|n| n.size)
            .sum()
    }

    pub fn used_size(&self) -> u64 {
        self.size - self.free_size()
    }

    fn find_best_fit(nodes: &BTreeMap<u64, ArenaNode>, required: u64) -> Option<u64> {
        nodes
            .values()
            .filter(|n| n.status == NodeStatus::Free && n.size >= required)
            .min_by_key(|n| n.size)
            .map(|n| n.addr)
    }

    /// Same best-fit rule as `find_best_fit`, but ties are broken toward the
    /// highest address — `backward_allocate` scans from the top of the
    /// arena (§4.B) so model weights land away from the bottom's churn.
    fn find_best_fit_from_top(nodes: &BTreeMap<u64, ArenaNode>, required: u64) -> Option<u64> {
        nodes
            .values()
            .filter(|n| n.status == NodeStatus::Free && n.size >= required)
            .min_by_key(|n| (n.size, std::cmp::Reverse(n.addr)))
            .map(|n| n.addr)
    }

    /// Best-fit allocate from the bottom of the chosen free node.
    pub fn allocate(&self, requested: u64) -> Result<u64, ServiceError> {
        let required = align_up(requested, MEMORY_ALIGNMENT);
        let mut nodes = self.inner.lock();

        if let Some(addr) = Self::find_best_fit(&nodes, required) {
            Self::split_from_bottom(&mut nodes, addr, required);
            return Ok(addr);
        }

        drop(nodes);
        if required >= LARGE_ALLOCATION_THRESHOLD {
            let frag = self.fragmentation_info();
            if frag.ratio > MEDIUM_FRAGMENTATION_THRESHOLD {
                self.compact();
                let mut nodes = self.inner.lock();
                if let Some(addr) = Self::find_best_fit(&nodes, required) {
                    Self::split_from_bottom(&mut nodes, addr, required);
                    return Ok(addr);
                }
            }
        }

        Err(ServiceError::new(ErrorKind::NotEnoughMemory, -1))
    }

    /// Best-fit allocate, splitting from the top of the chosen free node —
    /// used to keep model weights away from the churn at the bottom.
    pub fn backward_allocate(&self, requested: u64) -> Result<u64, ServiceError> {
        let required = align_up(requested, MEMORY_ALIGNMENT);
        let mut nodes = self.inner.lock();

        if let Some(node_addr) = Self::find_best_fit_from_top(&nodes, required) {
            let addr = Self::split_from_top(&mut nodes, node_addr, required);
            return Ok(addr);
        }

        drop(nodes);
        if required >= LARGE_ALLOCATION_THRESHOLD {
            let frag = self.fragmentation_info();
            if frag.ratio > MEDIUM_FRAGMENTATION_THRESHOLD {
                self.compact();
                let mut nodes = self.inner.lock();
                if let Some(node_addr) = Self::find_best_fit_from_top(&nodes, required) {
                    let addr = Self::split_from_top(&mut nodes, node_addr, required);
                    return Ok(addr);
                }
            }
        }

        Err(ServiceError::new(ErrorKind::NotEnoughMemory, -1))
    }

    fn split_from_bottom(nodes: &mut BTreeMap<u64, ArenaNode>, addr: u64, required: u64) {
        let node = nodes.remove(&addr).expect("addr must be a known node");
        nodes.insert(
            addr,
            ArenaNode {
                addr,
                size: required,
                status: NodeStatus::Busy,
            },
        );
        if node.size > required {
            let rest_addr = addr + required;
            nodes.insert(
                rest_addr,
                ArenaNode {
                    addr: rest_addr,
                    size: node.size - required,
                    status: NodeStatus::Free,
                },
            );
        }
    }

    fn split_from_top(nodes: &mut BTreeMap<u64, ArenaNode>, node_addr: u64, required: u64) -> u64 {
        let node = nodes.remove(&node_addr).expect("addr must be a known node");
        let alloc_addr = node.addr + node.size - required;
        if node.size > required {
            nodes.insert(
                node_addr,
                ArenaNode {
                    addr: node_addr,
                    size: node.size - required,
                    status: NodeStatus::Free,
                },
            );
        }
        nodes.insert(
            alloc_addr,
            ArenaNode {
                addr: alloc_addr,
                size: required,
                status: NodeStatus::Busy,
            },
        );
        alloc_addr
    }

    /// Mark `addr` free and merge with adjacent free neighbours. No-op (with
    /// a warning) on an unknown address. Returns the freed node's size, for
    /// callers that report it (e.g. process-wide allocation counters).
    pub fn deallocate(&self, addr: u64) -> Option<u64> {
        let mut nodes = self.inner.lock();
        let Some(node) = nodes.get_mut(&addr) else {
            log::warn!("dxrt-core: deallocate of unknown address {addr:#x}");
            return None;
        };
        node.status = NodeStatus::Free;
        let size = node.size;
        Self::merge_adjacent(&mut nodes, addr);
        Some(size)
    }

    fn merge_adjacent(nodes: &mut BTreeMap<u64, ArenaNode>, addr: u64) {
        // merge with successor
        let this = *nodes.get(&addr).unwrap();
        if let Some((&next_addr, &next)) = nodes.range((addr + 1)..).next() {
            if next_addr == this.addr + this.size && next.status == NodeStatus::Free {
                nodes.remove(&next_addr);
                let entry = nodes.get_mut(&addr).unwrap();
                entry.size += next.size;
            }
        }
        // merge with predecessor
        let this = *nodes.get(&addr).unwrap();
        if let Some((&prev_addr, &prev)) = nodes.range(..addr).next_back() {
            if prev.status == NodeStatus::Free && prev_addr + prev.size == this.addr {
                nodes.remove(&addr);
                let entry = nodes.get_mut(&prev_addr).unwrap();
                entry.size += this.size;
            }
        }
    }

    pub fn fragmentation_info(&self) -> FragmentationInfo {
        let nodes = self.inner.lock();
        let free_sizes: Vec<u64> = nodes
            .values()
            .filter(|n| n.status == NodeStatus::Free)
            .map(|n| n.size)
            .collect();
        let total_free: u64 = free_sizes.iter().sum();
        let largest_free = free_sizes.iter().copied().max().unwrap_or(0);
        let smallest_free = free_sizes.iter().copied().min().unwrap_or(0);
        let ratio = if total_free == 0 {
            0.0
        } else {
            (total_free - largest_free) as f64 / total_free as f64
        };
        FragmentationInfo {
            total_free,
            largest_free,
            smallest_free,
            count: free_sizes.len(),
            ratio,
        }
    }

    /// Coalesce all adjacent free nodes. Does not relocate live allocations.
    pub fn compact(&self) {
        let mut nodes = self.inner.lock();
        let addrs: Vec<u64> = nodes.keys().copied().collect();
        for addr in addrs {
            if nodes.get(&addr).map(|n| n.status) == Some(NodeStatus::Free) {
                Self::merge_adjacent(&mut nodes, addr);
            }
        }
    }
}

/// Service-wide memory tier on top of one or more device arenas: keeps both
/// the legacy PID-scoped index and the `(pid, taskId)`-scoped index, per the
/// design's open question on dual memory-tracking indices. Both index the
/// same arena; removing an address from either implies exactly one arena
/// deallocation.
#[derive(Default)]
pub struct MemoryTier {
    by_pid: Mutex<BTreeMap<i32, BTreeSet<u64>>>,
    by_pid_task: Mutex<BTreeMap<(i32, i32), BTreeSet<u64>>>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, pid: i32, task_id: Option<i32>, addr: u64) {
        self.by_pid.lock().entry(pid).or_default().insert(addr);
        if let Some(task_id) = task_id {
            self.by_pid_task
                .lock()
                .entry((pid, task_id))
                .or_default()
                .insert(addr);
        }
    }

    /// Remove `addr` from both indices. Returns true if it was known.
    pub fn forget(&self, pid: i32, task_id: Option<i32>, addr: u64) -> bool {
        let mut found = false;
        if let Some(set) = self.by_pid.lock().get_mut(&pid) {
            found |= set.remove(&addr);
        }
        if let Some(task_id) = task_id {
            if let Some(set) = self.by_pid_task.lock().get_mut(&(pid, task_id)) {
                found |= set.remove(&addr);
            }
        }
        found
    }

    pub fn addresses_for_pid(&self, pid: i32) -> Vec<u64> {
        self.by_pid
            .lock()
            .get(&pid)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn addresses_for_task(&self, pid: i32, task_id: i32) -> Vec<u64> {
        self.by_pid_task
            .lock()
            .get(&(pid, task_id))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_task_allocation(&self, pid: i32, task_id: i32) -> bool {
        self.by_pid_task
            .lock()
            .get(&(pid, task_id))
            .is_some_and(|s| !s.is_empty())
    }

    pub fn clear_pid(&self, pid: i32) {
        self.by_pid.lock().remove(&pid);
        self.by_pid_task.lock().retain(|(p, _), _| *p != pid);
    }

    pub fn clear_task(&self, pid: i32, task_id: i32) {
        self.by_pid_task.lock().remove(&(pid, task_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_plus_free_equals_size() {
        let arena = DeviceArena::new(0, 4096);
        let a = arena.allocate(100).unwrap();
        let _b = arena.allocate(500).unwrap();
        assert_eq!(arena.used_size() + arena.free_size(), arena.size());
        arena.deallocate(a);
        assert_eq!(arena.used_size() + arena.free_size(), arena.size());
    }

    #[test]
    fn allocate_deallocate_round_trip_restores_free_size() {
        let arena = DeviceArena::new(0, 1 << 20);
        let before = arena.free_size();
        let addr = arena.allocate(4096).unwrap();
        assert_ne!(arena.free_size(), before);
        arena.deallocate(addr);
        assert_eq!(arena.free_size(), before);
    }

    #[test]
    fn no_adjacent_free_nodes_after_deallocate() {
        let arena = DeviceArena::new(0, 4096);
        let a = arena.allocate(512).unwrap();
        let b = arena.allocate(512).unwrap();
        let c = arena.allocate(512).unwrap();
        arena.deallocate(b);
        arena.deallocate(a);
        arena.deallocate(c);
        let nodes = arena.inner.lock();
        assert_eq!(nodes.len(), 1, "all adjacent free nodes should have merged into one");
    }

    #[test]
    fn oom_returns_not_enough_memory() {
        let arena = DeviceArena::new(0, 1024);
        let err = arena.allocate(2048).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotEnoughMemory);
    }

    #[test]
    fn backward_allocate_splits_from_top_of_node() {
        let arena = DeviceArena::new(0, 4096);
        let addr = arena.backward_allocate(1024).unwrap();
        assert_eq!(addr, 4096 - 1024);
    }

    #[test]
    fn backward_allocate_breaks_size_ties_toward_highest_address() {
        let arena = DeviceArena::new(0, 5 * 4096);
        // Five equal-size busy nodes, then free every other one so the
        // resulting free nodes stay isolated (no merge-on-free collapses
        // them into one node) and are still tied on size.
        let c0 = arena.allocate(4096).unwrap();
        let c1 = arena.allocate(4096).unwrap();
        let c2 = arena.allocate(4096).unwrap();
        let c3 = arena.allocate(4096).unwrap();
        let c4 = arena.allocate(4096).unwrap();
        arena.deallocate(c0);
        arena.deallocate(c2);
        arena.deallocate(c4);
        let _ = (c1, c3); // left busy to keep c0/c2/c4 from merging

        let addr = arena.backward_allocate(4096).unwrap();
        assert_eq!(addr, c4, "equal-size ties must resolve to the highest address");
    }

    #[test]
    fn unknown_address_deallocate_is_noop() {
        let arena = DeviceArena::new(0, 4096);
        let before = arena.free_size();
        arena.deallocate(0xdead_beef);
        assert_eq!(arena.free_size(), before);
    }

    #[test]
    fn memory_tier_tracks_both_indices() {
        let tier = MemoryTier::new();
        tier.record(100, Some(7), 0x1000);
        assert_eq!(tier.addresses_for_pid(100), vec![0x1000]);
        assert_eq!(tier.addresses_for_task(100, 7), vec![0x1000]);
        assert!(tier.has_task_allocation(100, 7));

        assert!(tier.forget(100, Some(7), 0x1000));
        assert!(tier.addresses_for_pid(100).is_empty());
        assert!(!tier.has_task_allocation(100, 7));
    }
}
