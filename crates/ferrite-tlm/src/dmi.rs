use std::fmt;
use std::sync::Mutex;

use ferrite_types::{Access, AddrRange, SimTime};
use tracing::trace;

/// Raw host pointer backing a DMI region.
///
/// The pointee is owned by the memory provider that granted the region; the
/// grant contract obliges every holder to stop using the pointer once the
/// region is invalidated.
#[derive(Clone, Copy, PartialEq, Eq)]
struct DmiPtr(*mut u8);

// SAFETY: the pointer is only dereferenced on the simulation thread while
// the grant is valid; the cache itself merely stores and compares it, and
// off-thread invalidation (the reason the cache crosses threads at all)
// never dereferences.
unsafe impl Send for DmiPtr {}

impl fmt::Debug for DmiPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0)
    }
}

/// Description of a direct-memory window: a host pointer covering an
/// address range with granted access rights and per-direction latencies.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DmiDescriptor {
    ptr: DmiPtr,
    range: AddrRange,
    access: Access,
    read_latency: SimTime,
    write_latency: SimTime,
}

impl DmiDescriptor {
    pub fn new(ptr: *mut u8, range: AddrRange, access: Access) -> DmiDescriptor {
        DmiDescriptor {
            ptr: DmiPtr(ptr),
            range,
            access,
            read_latency: SimTime::ZERO,
            write_latency: SimTime::ZERO,
        }
    }

    pub fn with_latencies(mut self, read: SimTime, write: SimTime) -> DmiDescriptor {
        self.read_latency = read;
        self.write_latency = write;
        self
    }

    pub fn range(&self) -> AddrRange {
        self.range
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn read_latency(&self) -> SimTime {
        self.read_latency
    }

    pub fn write_latency(&self) -> SimTime {
        self.write_latency
    }

    pub fn set_latencies(&mut self, read: SimTime, write: SimTime) {
        self.read_latency = read;
        self.write_latency = write;
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.0
    }

    /// Host pointer corresponding to bus address `addr` inside the window.
    pub fn ptr_at(&self, addr: u64) -> *mut u8 {
        debug_assert!(self.range.includes_addr(addr));
        self.ptr
            .0
            .wrapping_offset(addr.wrapping_sub(self.range.start) as isize)
    }

    /// Move the start of the window, keeping the pointer mapping intact.
    /// Works in both directions (the pointer is rebased accordingly).
    pub fn set_start(&mut self, start: u64) {
        self.ptr.0 = self
            .ptr
            .0
            .wrapping_offset(start.wrapping_sub(self.range.start) as isize);
        self.range.start = start;
        debug_assert!(self.range.start <= self.range.end);
    }

    pub fn set_end(&mut self, end: u64) {
        self.range.end = end;
        debug_assert!(self.range.start <= self.range.end);
    }

    /// Relabel the window's bus addresses by `delta` without moving the
    /// host pointer: address translation across a bridge.
    pub fn shift_range(&mut self, delta: i64) {
        self.range = AddrRange::new(
            self.range.start.wrapping_add(delta as u64),
            self.range.end.wrapping_add(delta as u64),
        );
    }

    /// Two windows are mergeable iff rights and latencies agree, the ranges
    /// touch or overlap, and the pointers describe one contiguous mapping.
    pub fn mergeable(&self, other: &DmiDescriptor) -> bool {
        if self.access != other.access
            || self.read_latency != other.read_latency
            || self.write_latency != other.write_latency
        {
            return false;
        }
        if !self.range.overlaps(other.range) && !self.range.connects(other.range) {
            return false;
        }
        let expected = self
            .ptr
            .0
            .wrapping_offset(other.range.start.wrapping_sub(self.range.start) as isize);
        expected == other.ptr.0
    }

    pub fn merge(&self, other: &DmiDescriptor) -> DmiDescriptor {
        debug_assert!(self.mergeable(other));
        let mut merged = *self;
        if other.range.end > merged.range.end {
            merged.set_end(other.range.end);
        }
        if other.range.start < merged.range.start {
            merged.set_start(other.range.start);
        }
        merged
    }

    /// Copy `dst.len()` bytes out of the window starting at bus address
    /// `addr`.
    ///
    /// # Safety
    ///
    /// The grant must still be valid (not invalidated) and `[addr,
    /// addr + dst.len())` must lie inside the window.
    pub unsafe fn copy_out(&self, addr: u64, dst: &mut [u8]) {
        debug_assert!(self
            .range
            .includes(AddrRange::with_size(addr, dst.len().max(1) as u64)));
        std::ptr::copy_nonoverlapping(self.ptr_at(addr), dst.as_mut_ptr(), dst.len());
    }

    /// Copy `src` into the window starting at bus address `addr`.
    ///
    /// # Safety
    ///
    /// Same contract as [`DmiDescriptor::copy_out`].
    pub unsafe fn copy_in(&self, addr: u64, src: &[u8]) {
        debug_assert!(self
            .range
            .includes(AddrRange::with_size(addr, src.len().max(1) as u64)));
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr_at(addr), src.len());
    }
}

pub const DMI_CACHE_DEFAULT_LIMIT: usize = 16;

struct CacheInner {
    limit: usize,
    entries: Vec<DmiDescriptor>,
}

/// Bounded per-socket cache of DMI windows, most-recently-used first.
///
/// Insertion merges the new window with every mergeable resident entry
/// (transitively), then evicts least-recently-used entries beyond the
/// capacity. Invalidation splits overlapped entries into their surviving
/// prefix and suffix. A mutex serializes mutations because invalidation may
/// arrive from outside the simulation thread.
pub struct DmiCache {
    inner: Mutex<CacheInner>,
}

impl Default for DmiCache {
    fn default() -> DmiCache {
        DmiCache::new()
    }
}

impl DmiCache {
    pub fn new() -> DmiCache {
        DmiCache::with_limit(DMI_CACHE_DEFAULT_LIMIT)
    }

    pub fn with_limit(limit: usize) -> DmiCache {
        assert!(limit > 0, "dmi cache needs a non-zero capacity");
        DmiCache {
            inner: Mutex::new(CacheInner {
                limit,
                entries: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().expect("dmi cache mutex poisoned")
    }

    pub fn limit(&self) -> usize {
        self.lock().limit
    }

    pub fn set_limit(&self, limit: usize) {
        assert!(limit > 0, "dmi cache needs a non-zero capacity");
        self.lock().limit = limit;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Snapshot of the resident entries, most-recently-used first.
    pub fn entries(&self) -> Vec<DmiDescriptor> {
        self.lock().entries.clone()
    }

    fn insert_locked(inner: &mut CacheInner, dmi: DmiDescriptor) {
        let mut merged = dmi;
        loop {
            match inner.entries.iter().position(|e| merged.mergeable(e)) {
                Some(idx) => {
                    merged = merged.merge(&inner.entries.remove(idx));
                }
                None => {
                    inner.entries.insert(0, merged);
                    break;
                }
            }
        }
        inner.entries.truncate(inner.limit);
    }

    pub fn insert(&self, dmi: DmiDescriptor) {
        trace!(range = %dmi.range(), "dmi insert");
        Self::insert_locked(&mut self.lock(), dmi);
    }

    /// Drop every byte of `r` from the cache, keeping the non-overlapping
    /// remainders of split entries. Returns whether anything was dropped.
    pub fn invalidate(&self, r: AddrRange) -> bool {
        let mut inner = self.lock();
        let mut entries = std::mem::take(&mut inner.entries);
        entries.reverse();

        let mut invalidations = 0;
        for dmi in entries {
            if !r.overlaps(dmi.range()) {
                Self::insert_locked(&mut inner, dmi);
                continue;
            }

            invalidations += 1;

            if r.start > dmi.range().start {
                let mut front = dmi;
                front.set_end(r.start - 1);
                Self::insert_locked(&mut inner, front);
            }
            if r.end < dmi.range().end {
                let mut back = dmi;
                back.set_start(r.end + 1);
                Self::insert_locked(&mut inner, back);
            }
        }

        if invalidations > 0 {
            trace!(range = %r, count = invalidations, "dmi invalidate");
        }
        invalidations > 0
    }

    /// First entry whose window contains `r` with at least `access` rights,
    /// promoted to the most-recently-used position. A miss is not an error.
    pub fn lookup(&self, r: AddrRange, access: Access) -> Option<DmiDescriptor> {
        let mut inner = self.lock();
        let idx = inner
            .entries
            .iter()
            .position(|e| r.inside(e.range()) && e.access().covers(access))?;
        inner.entries.swap(0, idx);
        Some(inner.entries[0])
    }

    /// Retarget resident entries to new latencies, returning the windows
    /// whose latencies actually changed (their holders must be told to
    /// re-fetch).
    pub fn remap_latencies(&self, read: SimTime, write: SimTime) -> Vec<AddrRange> {
        let mut inner = self.lock();
        let mut changed = Vec::new();
        for entry in &mut inner.entries {
            if entry.read_latency() != read || entry.write_latency() != write {
                changed.push(entry.range());
                entry.set_latencies(read, write);
            }
        }
        changed
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }
}
