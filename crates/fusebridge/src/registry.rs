//! Mount slot table and per-mount state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::gate::CompletionGate;
use crate::mount::MountOptions;
use crate::reply::Completion;
use crate::request::{OpKind, Request, RequestContext, RequestRecord};

/// Process-unique identity of a mount. Unlike the slot index it is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountId(pub u64);

/// Counters for one mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountStats {
    pub requests: u64,
    pub errors: u64,
    pub unsupported: u64,
    pub aborted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    errors: AtomicU64,
    unsupported: AtomicU64,
    aborted: AtomicU64,
}

/// State of one mounted filesystem, shared by its driver thread, the
/// dispatcher and the lifecycle controller.
#[derive(Debug)]
pub struct MountEntry {
    index: usize,
    id: MountId,
    garbage: AtomicBool,
    exited: AtomicBool,
    mountpoint: String,
    options: MountOptions,
    thread: Mutex<Option<JoinHandle<()>>>,
    gate: CompletionGate,
    record: Mutex<RequestRecord>,
    counters: Counters,
}

impl MountEntry {
    pub fn new(index: usize, id: MountId, mountpoint: String, options: MountOptions) -> Self {
        MountEntry {
            index,
            id,
            garbage: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            mountpoint,
            options,
            thread: Mutex::new(None),
            gate: CompletionGate::new(),
            record: Mutex::new(RequestRecord::default()),
            counters: Counters::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> MountId {
        self.id
    }

    pub fn mountpoint(&self) -> &str {
        &self.mountpoint
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn gate(&self) -> &CompletionGate {
        &self.gate
    }

    pub fn is_garbage(&self) -> bool {
        self.garbage.load(Ordering::Acquire)
    }

    /// Flags the entry for teardown. Never cleared.
    pub fn mark_garbage(&self) {
        self.garbage.store(true, Ordering::Release);
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub(crate) fn set_thread(&self, handle: JoinHandle<()>) {
        *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub(crate) fn take_thread(&self) -> Option<JoinHandle<()>> {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn record(&self) -> MutexGuard<'_, RequestRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a call: arms the gate and overwrites the request record.
    pub(crate) fn begin(&self, context: RequestContext, request: Request) -> u64 {
        let seq = {
            let mut record = self.record();
            let seq = self.gate.arm();
            record.fill(seq, context, request);
            seq
        };
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        seq
    }

    /// Releases whatever call the driver thread is blocked on, except the
    /// final DESTROY. Returns true if a call was aborted.
    pub(crate) fn abort_in_flight(&self) -> bool {
        let record = self.record();
        let Some(seq) = self.gate.in_flight() else {
            return false;
        };
        if record.seq == seq && record.kind == Some(OpKind::Destroy) {
            return false;
        }
        self.gate.abort(seq)
    }

    pub(crate) fn take_request(&self, seq: u64) -> Option<(RequestContext, Request)> {
        self.record().take(seq)
    }

    /// Stores the result of call `seq` and wakes its driver thread. Returns
    /// false if that call is no longer waiting.
    pub(crate) fn complete(&self, seq: u64, kind: OpKind, completion: Completion) -> bool {
        let code = completion.code;
        {
            let mut record = self.record();
            if record.seq == seq {
                record.result = code;
            }
        }
        if code < 0 {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        let delivered = self.gate.signal(seq, completion);
        if !delivered {
            warn!(
                slot = self.index,
                op = %kind,
                seq,
                garbage = self.is_garbage(),
                "completion arrived for a request that is no longer waiting"
            );
        }
        delivered
    }

    pub(crate) fn note_unsupported(&self) {
        self.counters.unsupported.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_aborted(&self) {
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_result(&self) -> i32 {
        self.record().result
    }

    pub fn stats(&self) -> MountStats {
        MountStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            unsupported: self.counters.unsupported.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
enum Slot {
    Free,
    Reserved,
    Live(Arc<MountEntry>),
}

/// Fixed-capacity table of mounts indexed by slot.
#[derive(Debug)]
pub struct MountTable {
    slots: Vec<Slot>,
    capacity: usize,
}

impl MountTable {
    pub fn new(capacity: usize) -> Self {
        MountTable {
            slots: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots below the high-water mark, free ones included.
    pub fn high_water(&self) -> usize {
        self.slots.len()
    }

    /// Reserves the lowest free slot, extending the high-water mark if needed.
    pub fn allocate(&mut self) -> Result<usize> {
        if let Some(index) = self.slots.iter().position(|s| matches!(s, Slot::Free)) {
            self.slots[index] = Slot::Reserved;
            return Ok(index);
        }
        if self.slots.len() >= self.capacity {
            return Err(BridgeError::CapacityExceeded { max: self.capacity });
        }
        self.slots.push(Slot::Reserved);
        Ok(self.slots.len() - 1)
    }

    pub fn install(&mut self, index: usize, entry: Arc<MountEntry>) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Slot::Live(entry);
        }
    }

    pub fn free(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Slot::Free;
        }
        while matches!(self.slots.last(), Some(Slot::Free)) {
            self.slots.pop();
        }
    }

    pub fn get(&self, index: usize) -> Option<&Arc<MountEntry>> {
        match self.slots.get(index) {
            Some(Slot::Live(entry)) => Some(entry),
            _ => None,
        }
    }

    pub fn live(&self) -> impl Iterator<Item = &Arc<MountEntry>> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Live(entry) if !entry.is_garbage() => Some(entry),
            _ => None,
        })
    }

    /// Finds the entry mounted at `path`, ignoring entries flagged for teardown.
    pub fn find_live(&self, path: &str) -> Option<Arc<MountEntry>> {
        self.live().find(|e| e.mountpoint == path).cloned()
    }

    pub fn live_count(&self) -> usize {
        self.live().count()
    }
}

pub struct Registry {
    table: Mutex<MountTable>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Registry {
            table: Mutex::new(MountTable::new(capacity)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Locks the table. Only short bookkeeping happens under this lock.
    pub fn lock(&self) -> MutexGuard<'_, MountTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_id(&self) -> MountId {
        MountId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Frees the slot of an entry whose driver thread has finished.
    pub fn release(&self, entry: &Arc<MountEntry>) {
        entry.exited.store(true, Ordering::Release);
        let mut table = self.lock();
        let owned = table
            .get(entry.index)
            .is_some_and(|e| Arc::ptr_eq(e, entry));
        if owned {
            table.free(entry.index);
            debug!(slot = entry.index, mountpoint = %entry.mountpoint, "slot freed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn entry(index: usize, path: &str) -> Arc<MountEntry> {
        Arc::new(MountEntry::new(
            index,
            MountId(index as u64 + 100),
            path.to_string(),
            MountOptions::default(),
        ))
    }

    #[test]
    fn test_abort_in_flight_releases_pending_call() {
        let entry = entry(0, "/mnt/a");
        assert!(!entry.abort_in_flight());
        let seq = entry.begin(
            RequestContext::default(),
            Request::Getattr(crate::request::PathArgs {
                path: "/f".to_string(),
            }),
        );
        assert!(entry.abort_in_flight());
        assert!(matches!(
            entry.gate().wait(seq),
            crate::gate::GateOutcome::Aborted
        ));
    }

    #[test]
    fn test_abort_in_flight_spares_destroy() {
        let entry = entry(0, "/mnt/a");
        let seq = entry.begin(
            RequestContext::default(),
            Request::Destroy(crate::request::MountArgs {
                mountpoint: "/mnt/a".to_string(),
            }),
        );
        assert!(!entry.abort_in_flight());
        assert_eq!(entry.gate().in_flight(), Some(seq));
    }

    #[test]
    fn test_allocate_sequential() {
        let mut table = MountTable::new(4);
        assert_eq!(table.allocate().unwrap(), 0);
        assert_eq!(table.allocate().unwrap(), 1);
        assert_eq!(table.allocate().unwrap(), 2);
        assert_eq!(table.high_water(), 3);
    }

    #[test]
    fn test_allocate_reuses_lowest_free() {
        let mut table = MountTable::new(4);
        for _ in 0..3 {
            table.allocate().unwrap();
        }
        table.free(1);
        table.free(0);
        assert_eq!(table.allocate().unwrap(), 0);
        assert_eq!(table.allocate().unwrap(), 1);
        assert_eq!(table.allocate().unwrap(), 3);
    }

    #[test]
    fn test_free_shrinks_high_water() {
        let mut table = MountTable::new(4);
        for _ in 0..3 {
            table.allocate().unwrap();
        }
        table.free(1);
        assert_eq!(table.high_water(), 3);
        table.free(2);
        assert_eq!(table.high_water(), 1);
        table.free(0);
        assert_eq!(table.high_water(), 0);
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut table = MountTable::new(2);
        table.allocate().unwrap();
        table.allocate().unwrap();
        let err = table.allocate().unwrap_err();
        assert!(matches!(err, BridgeError::CapacityExceeded { max: 2 }));
    }

    #[test]
    fn test_find_live_skips_garbage() {
        let mut table = MountTable::new(4);
        let index = table.allocate().unwrap();
        let e = entry(index, "/mnt/a");
        table.install(index, Arc::clone(&e));

        assert!(table.find_live("/mnt/a").is_some());
        assert!(table.find_live("/mnt/b").is_none());

        e.mark_garbage();
        assert!(e.is_garbage());
        assert!(table.find_live("/mnt/a").is_none());
        assert_eq!(table.live_count(), 0);
        assert!(table.get(index).is_some());
    }

    #[test]
    fn test_release_frees_owned_slot_only() {
        let registry = Registry::new(4);
        let first = {
            let mut table = registry.lock();
            let index = table.allocate().unwrap();
            let e = entry(index, "/mnt/a");
            table.install(index, Arc::clone(&e));
            e
        };
        let impostor = entry(first.index(), "/mnt/a");
        registry.release(&impostor);
        assert!(registry.lock().get(0).is_some());

        registry.release(&first);
        assert!(first.has_exited());
        assert!(registry.lock().get(0).is_none());
        assert_eq!(registry.lock().high_water(), 0);
    }

    #[test]
    fn test_mount_ids_unique() {
        let registry = Registry::new(1);
        let a = registry.next_id();
        let b = registry.next_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_begin_take_complete() {
        let e = entry(0, "/mnt/a");
        let ctx = RequestContext::new(10, 20, 30);
        let seq = e.begin(
            ctx,
            Request::Getattr(crate::request::PathArgs {
                path: "/f".to_string(),
            }),
        );
        let (taken_ctx, req) = e.take_request(seq).unwrap();
        assert_eq!(taken_ctx, ctx);
        assert_eq!(req.kind(), OpKind::Getattr);

        assert!(e.complete(seq, OpKind::Getattr, Completion::error(-libc::ENOENT)));
        assert_eq!(e.last_result(), -libc::ENOENT);
        let stats = e.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_late_completion_is_rejected() {
        let e = entry(0, "/mnt/a");
        let seq = e.begin(
            RequestContext::default(),
            Request::Getattr(crate::request::PathArgs {
                path: "/f".to_string(),
            }),
        );
        e.gate().abort(seq);
        let _ = e.gate().wait(seq);
        e.mark_garbage();
        assert!(!e.complete(seq, OpKind::Getattr, Completion::error(0)));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Mount,
        Unmount(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![Just(Step::Mount), (0usize..16).prop_map(Step::Unmount)]
    }

    proptest! {
        #[test]
        fn prop_live_indices_unique(steps in proptest::collection::vec(step(), 0..200)) {
            let capacity = 8;
            let mut table = MountTable::new(capacity);
            let mut live: Vec<usize> = Vec::new();

            for s in steps {
                match s {
                    Step::Mount => match table.allocate() {
                        Ok(index) => {
                            prop_assert!(!live.contains(&index));
                            let lowest_free = (0..).find(|i| !live.contains(i)).unwrap();
                            prop_assert_eq!(index, lowest_free);
                            table.install(index, entry(index, &format!("/m{}", index)));
                            live.push(index);
                        }
                        Err(_) => prop_assert_eq!(live.len(), capacity),
                    },
                    Step::Unmount(n) => {
                        if !live.is_empty() {
                            let index = live.remove(n % live.len());
                            table.free(index);
                        }
                    }
                }
                let unique: HashSet<usize> = live.iter().copied().collect();
                prop_assert_eq!(unique.len(), live.len());
                prop_assert_eq!(table.live_count(), live.len());
                let expected_high_water = live.iter().max().map_or(0, |m| m + 1);
                prop_assert_eq!(table.high_water(), expected_high_water);
            }
        }
    }
}
