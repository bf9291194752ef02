//! The process registry: PID hash plus adjustment-ordered buckets.
//!
//! Records live in an arena of slots linked by indices instead of pointers,
//! so the structure stays compact under pressure and can be traversed from
//! the watchdog thread behind a shared lock. Mutation happens only on the
//! reactor thread holding the exclusive lock; the watchdog reads records and
//! may flip their [`validity`](ProcessRecord::is_valid) flag, which is why
//! that flag is atomic rather than guarded.
//!
//! Bucket order is LIFO: the head is the most recently registered process at
//! that adjustment, the tail is the oldest and therefore the first eviction
//! candidate.

use crate::{adj_to_slot, ADJ_SLOT_COUNT};
use rustix::fd::OwnedFd;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};

const PID_HASH_SIZE: usize = 1024;
const NIL: u32 = u32::MAX;

#[inline]
fn pid_hash(pid: i32) -> usize {
    (((pid >> 8) ^ pid) & (PID_HASH_SIZE as i32 - 1)) as usize
}

/// A registered process.
#[derive(Debug)]
pub struct ProcessRecord {
    /// Process id (always a thread-group leader).
    pub pid: i32,
    /// Effective uid at registration.
    pub uid: u32,
    /// Current OOM adjustment; matches the bucket the record sits in.
    pub oom_adj: i32,
    /// PID of the control client owning this record; 0 = unclaimed.
    pub registrant: i32,
    /// Process file descriptor, when the kernel supports them.
    pub pidfd: Option<OwnedFd>,
    valid: AtomicBool,
}

impl ProcessRecord {
    /// Create a record; starts valid.
    pub fn new(pid: i32, uid: u32, oom_adj: i32, registrant: i32, pidfd: Option<OwnedFd>) -> Self {
        Self { pid, uid, oom_adj, registrant, pidfd, valid: AtomicBool::new(true) }
    }

    /// Whether the record is still alive. Cleared by the watchdog after an
    /// emergency kill; removal happens later on the reactor thread.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the record dead without unlinking it. Safe under a shared lock.
    #[inline]
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
struct Slot {
    record: Option<ProcessRecord>,
    /// Toward the bucket head (newer entries).
    prev: u32,
    /// Toward the bucket tail (older entries).
    next: u32,
    hash_next: u32,
    next_free: u32,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    head: u32,
    tail: u32,
}

impl Default for Bucket {
    fn default() -> Self {
        Self { head: NIL, tail: NIL }
    }
}

/// Result of scanning a bucket for its heaviest member.
#[derive(Debug, Default)]
pub struct HeaviestScan {
    /// Pid of the largest live process, if any.
    pub victim: Option<i32>,
    /// Pids whose size could not be read; they are gone and should be
    /// removed.
    pub dead: SmallVec<[i32; 4]>,
}

/// PID-indexed registry with per-adjustment eviction order.
pub struct Registry {
    slots: Vec<Slot>,
    free_head: u32,
    hash: Vec<u32>,
    buckets: Vec<Bucket>,
    len: usize,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: NIL,
            hash: vec![NIL; PID_HASH_SIZE],
            buckets: vec![Bucket::default(); ADJ_SLOT_COUNT],
            len: 0,
        }
    }

    /// Number of registered processes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot_index(&self, pid: i32) -> Option<u32> {
        let mut idx = self.hash[pid_hash(pid)];
        while idx != NIL {
            let slot = &self.slots[idx as usize];
            if slot.record.as_ref().map(|r| r.pid) == Some(pid) {
                return Some(idx);
            }
            idx = slot.hash_next;
        }
        None
    }

    /// Look up a record by pid.
    pub fn get(&self, pid: i32) -> Option<&ProcessRecord> {
        let idx = self.slot_index(pid)?;
        self.slots[idx as usize].record.as_ref()
    }

    /// Look up a record mutably by pid.
    pub fn get_mut(&mut self, pid: i32) -> Option<&mut ProcessRecord> {
        let idx = self.slot_index(pid)?;
        self.slots[idx as usize].record.as_mut()
    }

    /// Insert a new record. Returns `false` if the pid is already present.
    pub fn insert(&mut self, record: ProcessRecord) -> bool {
        if self.slot_index(record.pid).is_some() {
            return false;
        }
        let pid = record.pid;
        let adj = record.oom_adj;

        let idx = match self.free_head {
            NIL => {
                self.slots.push(Slot {
                    record: None,
                    prev: NIL,
                    next: NIL,
                    hash_next: NIL,
                    next_free: NIL,
                });
                (self.slots.len() - 1) as u32
            }
            free => {
                self.free_head = self.slots[free as usize].next_free;
                free
            }
        };

        let hval = pid_hash(pid);
        let slot = &mut self.slots[idx as usize];
        slot.record = Some(record);
        slot.hash_next = self.hash[hval];
        self.hash[hval] = idx;

        self.link_into_bucket(idx, adj);
        self.len += 1;
        true
    }

    /// Remove a record, returning it (including its pidfd) to the caller.
    pub fn remove(&mut self, pid: i32) -> Option<ProcessRecord> {
        let idx = self.slot_index(pid)?;

        // Unlink from the hash chain.
        let hval = pid_hash(pid);
        let mut cursor = self.hash[hval];
        if cursor == idx {
            self.hash[hval] = self.slots[idx as usize].hash_next;
        } else {
            while cursor != NIL {
                let next = self.slots[cursor as usize].hash_next;
                if next == idx {
                    self.slots[cursor as usize].hash_next = self.slots[idx as usize].hash_next;
                    break;
                }
                cursor = next;
            }
        }

        self.unlink_from_bucket(idx);

        let slot = &mut self.slots[idx as usize];
        let record = slot.record.take();
        slot.hash_next = NIL;
        slot.next_free = self.free_head;
        self.free_head = idx;
        self.len -= 1;
        record
    }

    /// Move a record to a different adjustment bucket.
    pub fn set_adjustment(&mut self, pid: i32, adj: i32) -> bool {
        let Some(idx) = self.slot_index(pid) else {
            return false;
        };
        self.unlink_from_bucket(idx);
        if let Some(record) = self.slots[idx as usize].record.as_mut() {
            record.oom_adj = adj;
        }
        self.link_into_bucket(idx, adj);
        true
    }

    /// Try to claim a record on behalf of `registrant`.
    ///
    /// Succeeds when the record already belongs to the registrant or is
    /// unclaimed (its previous owner disconnected).
    pub fn claim(&mut self, pid: i32, registrant: i32) -> bool {
        let Some(record) = self.get_mut(pid) else {
            return false;
        };
        if record.registrant == registrant {
            return true;
        }
        if record.registrant == 0 {
            record.registrant = registrant;
            return true;
        }
        false
    }

    /// Mark every record owned by `registrant` as unclaimed.
    pub fn remove_claims(&mut self, registrant: i32) {
        for slot in &mut self.slots {
            if let Some(record) = slot.record.as_mut() {
                if record.registrant == registrant {
                    record.registrant = 0;
                }
            }
        }
    }

    /// Pids removable by `registrant`: its own records plus unclaimed ones.
    pub fn purgeable_pids(&self, registrant: i32) -> Vec<i32> {
        self.slots
            .iter()
            .filter_map(|slot| slot.record.as_ref())
            .filter(|r| r.registrant == registrant || r.registrant == 0)
            .map(|r| r.pid)
            .collect()
    }

    /// Flip the validity flag of a record. Usable under a shared lock.
    pub fn invalidate(&self, pid: i32) {
        if let Some(record) = self.get(pid) {
            record.invalidate();
        }
    }

    /// Oldest record in the bucket for `adj` (the eviction candidate).
    pub fn tail(&self, adj: i32) -> Option<&ProcessRecord> {
        let idx = self.buckets[adj_to_slot(adj)].tail;
        if idx == NIL {
            return None;
        }
        self.slots[idx as usize].record.as_ref()
    }

    /// Walking tail-to-head, the entry one step newer than `pid`.
    ///
    /// Returns `None` when `pid` is no longer in the bucket or was the
    /// newest entry.
    pub fn next_candidate(&self, adj: i32, pid: i32) -> Option<&ProcessRecord> {
        let mut idx = self.buckets[adj_to_slot(adj)].tail;
        while idx != NIL {
            let slot = &self.slots[idx as usize];
            if slot.record.as_ref().map(|r| r.pid) == Some(pid) {
                let prev = slot.prev;
                if prev == NIL {
                    return None;
                }
                return self.slots[prev as usize].record.as_ref();
            }
            idx = slot.prev;
        }
        None
    }

    /// Scan a bucket for its heaviest live member.
    ///
    /// `size_of` returns a process size in pages, or `None` for processes
    /// that are gone. With a single entry no size is read at all.
    pub fn heaviest(
        &self,
        adj: i32,
        size_of: &mut dyn FnMut(i32) -> Option<i64>,
    ) -> HeaviestScan {
        let bucket = self.buckets[adj_to_slot(adj)];
        let mut scan = HeaviestScan::default();
        if bucket.head == NIL {
            return scan;
        }
        if bucket.head == bucket.tail {
            scan.victim = self.slots[bucket.head as usize].record.as_ref().map(|r| r.pid);
            return scan;
        }

        let mut max_size = 0;
        let mut idx = bucket.head;
        while idx != NIL {
            let slot = &self.slots[idx as usize];
            if let Some(record) = slot.record.as_ref() {
                match size_of(record.pid) {
                    Some(size) if size > max_size => {
                        max_size = size;
                        scan.victim = Some(record.pid);
                    }
                    Some(_) => {}
                    None => scan.dead.push(record.pid),
                }
            }
            idx = slot.next;
        }
        scan
    }

    /// Pids in a bucket, head (newest) first.
    pub fn bucket_pids(&self, adj: i32) -> Vec<i32> {
        let mut pids = Vec::new();
        let mut idx = self.buckets[adj_to_slot(adj)].head;
        while idx != NIL {
            let slot = &self.slots[idx as usize];
            if let Some(record) = slot.record.as_ref() {
                pids.push(record.pid);
            }
            idx = slot.next;
        }
        pids
    }

    fn link_into_bucket(&mut self, idx: u32, adj: i32) {
        let bucket = &mut self.buckets[adj_to_slot(adj)];
        let old_head = bucket.head;
        bucket.head = idx;
        if bucket.tail == NIL {
            bucket.tail = idx;
        }
        {
            let slot = &mut self.slots[idx as usize];
            slot.prev = NIL;
            slot.next = old_head;
        }
        if old_head != NIL {
            self.slots[old_head as usize].prev = idx;
        }
    }

    fn unlink_from_bucket(&mut self, idx: u32) {
        let (prev, next, adj) = {
            let slot = &self.slots[idx as usize];
            let adj = slot.record.as_ref().map(|r| r.oom_adj).unwrap_or(0);
            (slot.prev, slot.next, adj)
        };
        let bucket = &mut self.buckets[adj_to_slot(adj)];
        if bucket.head == idx {
            bucket.head = next;
        }
        if bucket.tail == idx {
            bucket.tail = prev;
        }
        if prev != NIL {
            self.slots[prev as usize].next = next;
        }
        if next != NIL {
            self.slots[next as usize].prev = prev;
        }
        let slot = &mut self.slots[idx as usize];
        slot.prev = NIL;
        slot.next = NIL;
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: i32, adj: i32, registrant: i32) -> ProcessRecord {
        ProcessRecord::new(pid, 1000, adj, registrant, None)
    }

    #[test]
    fn test_insert_lookup_remove_roundtrip() {
        let mut reg = Registry::new();
        assert!(reg.insert(record(100, 900, 1)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(100).unwrap().oom_adj, 900);
        assert_eq!(reg.bucket_pids(900), vec![100]);

        let removed = reg.remove(100).unwrap();
        assert_eq!(removed.pid, 100);
        assert!(reg.is_empty());
        assert!(reg.bucket_pids(900).is_empty());
        assert!(reg.get(100).is_none());
    }

    #[test]
    fn test_duplicate_pid_rejected() {
        let mut reg = Registry::new();
        assert!(reg.insert(record(100, 900, 1)));
        assert!(!reg.insert(record(100, 500, 1)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(100).unwrap().oom_adj, 900);
    }

    #[test]
    fn test_bucket_order_lifo_tail_oldest() {
        let mut reg = Registry::new();
        reg.insert(record(1, 900, 0));
        reg.insert(record(2, 900, 0));
        reg.insert(record(3, 900, 0));
        assert_eq!(reg.bucket_pids(900), vec![3, 2, 1]);
        assert_eq!(reg.tail(900).unwrap().pid, 1);
    }

    #[test]
    fn test_next_candidate_walks_toward_newer() {
        let mut reg = Registry::new();
        reg.insert(record(1, 900, 0));
        reg.insert(record(2, 900, 0));
        reg.insert(record(3, 900, 0));
        assert_eq!(reg.next_candidate(900, 1).unwrap().pid, 2);
        assert_eq!(reg.next_candidate(900, 2).unwrap().pid, 3);
        assert!(reg.next_candidate(900, 3).is_none());
        // Unknown pid restarts nothing.
        assert!(reg.next_candidate(900, 42).is_none());
    }

    #[test]
    fn test_set_adjustment_moves_buckets() {
        let mut reg = Registry::new();
        reg.insert(record(1, 900, 0));
        reg.insert(record(2, 900, 0));
        assert!(reg.set_adjustment(1, 200));
        assert_eq!(reg.bucket_pids(900), vec![2]);
        assert_eq!(reg.bucket_pids(200), vec![1]);
        assert_eq!(reg.get(1).unwrap().oom_adj, 200);
    }

    #[test]
    fn test_hash_collisions() {
        // Adding 1 << 18 changes neither the low bits nor the folded-in
        // bits 8..18 modulo the table mask, so these pids share a chain.
        const STRIDE: i32 = 1 << 18;
        let mut reg = Registry::new();
        for k in 0..4 {
            assert!(reg.insert(record(5 + STRIDE * k, 0, 0)));
        }
        assert_eq!(reg.len(), 4);
        for k in 0..4 {
            assert!(reg.get(5 + STRIDE * k).is_some());
        }
        assert!(reg.remove(5 + STRIDE).is_some());
        assert!(reg.get(5).is_some());
        assert!(reg.get(5 + 2 * STRIDE).is_some());
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_claim_semantics() {
        let mut reg = Registry::new();
        reg.insert(record(100, 900, 7));
        // The owner can re-claim.
        assert!(reg.claim(100, 7));
        // Another client is refused while the record is owned.
        assert!(!reg.claim(100, 8));
        assert_eq!(reg.get(100).unwrap().registrant, 7);

        // After the owner vanishes, any client can take over.
        reg.remove_claims(7);
        assert_eq!(reg.get(100).unwrap().registrant, 0);
        assert!(reg.claim(100, 8));
        assert_eq!(reg.get(100).unwrap().registrant, 8);
    }

    #[test]
    fn test_purgeable_includes_unclaimed() {
        let mut reg = Registry::new();
        reg.insert(record(1, 900, 7));
        reg.insert(record(2, 900, 8));
        reg.insert(record(3, 900, 0));
        let mut pids = reg.purgeable_pids(7);
        pids.sort_unstable();
        assert_eq!(pids, vec![1, 3]);
    }

    #[test]
    fn test_invalidate_under_shared_reference() {
        let mut reg = Registry::new();
        reg.insert(record(100, 900, 0));
        let shared: &Registry = &reg;
        assert!(shared.get(100).unwrap().is_valid());
        shared.invalidate(100);
        assert!(!shared.get(100).unwrap().is_valid());
        // Still linked; only the flag changed.
        assert_eq!(shared.bucket_pids(900), vec![100]);
    }

    #[test]
    fn test_heaviest_scan() {
        let mut reg = Registry::new();
        reg.insert(record(1, 900, 0));
        reg.insert(record(2, 900, 0));
        reg.insert(record(3, 900, 0));

        let mut scan = reg.heaviest(900, &mut |pid| match pid {
            1 => Some(100),
            2 => Some(500),
            _ => None, // pid 3 is gone
        });
        assert_eq!(scan.victim, Some(2));
        assert_eq!(scan.dead.as_slice(), &[3]);

        // A single-entry bucket short-circuits without sizing.
        let mut reg = Registry::new();
        reg.insert(record(9, 100, 0));
        scan = reg.heaviest(100, &mut |_| panic!("size read for singleton"));
        assert_eq!(scan.victim, Some(9));
    }

    #[test]
    fn test_slot_reuse_after_remove() {
        let mut reg = Registry::new();
        for pid in 1..=8 {
            reg.insert(record(pid, 0, 0));
        }
        let slots_before = reg.slots.len();
        for pid in 1..=8 {
            reg.remove(pid);
        }
        for pid in 9..=16 {
            reg.insert(record(pid, 0, 0));
        }
        assert_eq!(reg.slots.len(), slots_before);
        assert_eq!(reg.len(), 8);
    }
}
