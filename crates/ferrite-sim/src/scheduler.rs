use std::cell::Cell;
use std::rc::Rc;

use ferrite_types::SimTime;
use tracing::trace;

/// Identity of a schedulable process, as assigned by the hosting kernel.
///
/// The transport layer only ever compares process ids; it never interprets
/// them. Id 0 is the kernel's main (elaboration/test) context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct ProcessId(pub u64);

impl ProcessId {
    pub const MAIN: ProcessId = ProcessId(0);
}

/// Handle onto the hosting discrete-event kernel.
///
/// Shared via `Rc` by every socket and peripheral of a platform. All state
/// is interior-mutable so the handle can be consulted from any depth of a
/// transport call chain.
pub struct Scheduler {
    now: Cell<SimTime>,
    quantum: Cell<SimTime>,
    process: Cell<ProcessId>,
    syncs: Cell<u64>,
}

impl Scheduler {
    pub fn new() -> Rc<Scheduler> {
        Rc::new(Scheduler {
            now: Cell::new(SimTime::ZERO),
            quantum: Cell::new(SimTime::ZERO),
            process: Cell::new(ProcessId::MAIN),
            syncs: Cell::new(0),
        })
    }

    /// Current global simulation time.
    pub fn time_stamp(&self) -> SimTime {
        self.now.get()
    }

    /// Advance the global clock. Called by the kernel's event loop, not by
    /// models; models accrue local offsets and `sync` them instead.
    pub fn advance(&self, delta: SimTime) {
        self.now.set(self.now.get() + delta);
    }

    pub fn quantum(&self) -> SimTime {
        self.quantum.get()
    }

    /// Bound on how far a process may run ahead of global time before it
    /// must yield. Zero (the default) disables decoupling entirely: every
    /// non-debug transport synchronizes.
    pub fn set_quantum(&self, quantum: SimTime) {
        self.quantum.set(quantum);
    }

    /// Has `offset` outrun the quantum?
    pub fn needs_sync(&self, offset: SimTime) -> bool {
        offset >= self.quantum.get()
    }

    /// Yield to the kernel, consuming `offset` into global time. On return
    /// the caller's local offset is zero and global time has caught up.
    pub fn sync(&self, offset: &mut SimTime) {
        if !offset.is_zero() {
            trace!(offset = %*offset, "sync");
        }
        self.now.set(self.now.get() + *offset);
        *offset = SimTime::ZERO;
        self.syncs.set(self.syncs.get() + 1);
    }

    /// Number of yields so far. Lets tests assert that a path (e.g. debug
    /// transport) never synchronized.
    pub fn sync_count(&self) -> u64 {
        self.syncs.get()
    }

    pub fn current_process(&self) -> ProcessId {
        self.process.get()
    }

    /// Mark `process` as the running process for the duration of the
    /// returned guard. The kernel wraps each process activation in one of
    /// these; tests use it to emulate multiple initiator processes.
    pub fn enter_process(&self, process: ProcessId) -> ProcessGuard<'_> {
        let prev = self.process.replace(process);
        ProcessGuard { sched: self, prev }
    }
}

pub struct ProcessGuard<'a> {
    sched: &'a Scheduler,
    prev: ProcessId,
}

impl Drop for ProcessGuard<'_> {
    fn drop(&mut self) {
        self.sched.process.set(self.prev);
    }
}
