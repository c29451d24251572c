use ferrite_types::AddrRange;
use tracing::trace;

use crate::dmi::DmiDescriptor;
use crate::transaction::Transaction;

/// A load-linked reservation: one initiator, one address window.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ExclusiveLock {
    pub cpu: u64,
    pub addr: AddrRange,
}

/// Per-socket reservation table for load-linked / store-conditional
/// sequences. Runs on the simulation thread only.
#[derive(Default)]
pub struct ExclusiveMonitor {
    locks: Vec<ExclusiveLock>,
}

impl ExclusiveMonitor {
    pub fn new() -> ExclusiveMonitor {
        ExclusiveMonitor::default()
    }

    pub fn locks(&self) -> &[ExclusiveLock] {
        &self.locks
    }

    /// Does some reservation of `cpu` cover all of `r`?
    pub fn has_lock(&self, cpu: u64, r: AddrRange) -> bool {
        self.locks
            .iter()
            .any(|lock| lock.cpu == cpu && lock.addr.includes(r))
    }

    /// Record a reservation for `cpu`, dropping any it already holds (an
    /// initiator holds at most one).
    pub fn add_lock(&mut self, cpu: u64, r: AddrRange) {
        self.break_locks_for(cpu);
        trace!(cpu, range = %r, "exclusive reservation");
        self.locks.push(ExclusiveLock { cpu, addr: r });
    }

    pub fn break_locks_for(&mut self, cpu: u64) {
        self.locks.retain(|lock| lock.cpu != cpu);
    }

    pub fn break_locks_in(&mut self, r: AddrRange) {
        self.locks.retain(|lock| !lock.addr.overlaps(r));
    }

    pub fn clear(&mut self) {
        self.locks.clear();
    }

    /// Apply the monitor's side effects to an in-flight transaction:
    ///
    /// - any reservation overlapping the access forces the non-DMI path;
    /// - an exclusive read takes a reservation for its initiator;
    /// - an exclusive write only stays exclusive if a matching reservation
    ///   exists; otherwise its `excl` flag is stripped and the write is not
    ///   performed (it completes with an ok response);
    /// - any write breaks every reservation it overlaps.
    ///
    /// Returns whether the transaction should proceed to the target.
    pub fn update(&mut self, tx: &mut Transaction) -> bool {
        let range = tx.range();

        if self.locks.iter().any(|lock| lock.addr.overlaps(range)) {
            tx.dmi_allowed = false;
        }

        let mut proceed = true;
        if tx.sideband.is_excl() {
            if tx.is_read() {
                self.add_lock(tx.sideband.cpuid, range);
            }
            if tx.is_write() {
                let held = self.has_lock(tx.sideband.cpuid, range);
                if !held {
                    trace!(cpu = tx.sideband.cpuid, range = %range, "store-conditional failed");
                }
                tx.sideband.set_excl(held);
                proceed = held;
            }
        }

        if tx.is_write() {
            self.break_locks_in(range);
        }

        proceed
    }

    /// Narrow a DMI grant around the active reservations so that reserved
    /// addresses can never be reached through direct memory. Narrowing is
    /// symmetric: reservations below the accessed address raise the window
    /// start, reservations above it lower the window end. Returns `false`
    /// (deny the grant) when a reservation covers the accessed address
    /// itself.
    pub fn override_dmi(&self, tx: &Transaction, dmi: &mut DmiDescriptor) -> bool {
        if self
            .locks
            .iter()
            .any(|lock| lock.addr.includes_addr(tx.address))
        {
            return false;
        }

        for lock in &self.locks {
            if lock.addr.end < tx.address && dmi.range().start <= lock.addr.end {
                dmi.set_start(lock.addr.end + 1);
            }
            if lock.addr.start > tx.address && dmi.range().end >= lock.addr.start {
                dmi.set_end(lock.addr.start - 1);
            }
        }

        true
    }
}
