use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use ferrite_sim::{ProcessId, Scheduler};
use ferrite_types::{Access, AddrRange, AddressSpace, SimTime};
use tracing::{debug, warn};

use crate::dmi::DmiCache;
use crate::exmon::ExclusiveMonitor;
use crate::sideband::Sideband;
use crate::transaction::{Command, Response, Transaction};
use crate::DmiDescriptor;

/// Callback invoked on an upstream component when a downstream DMI window
/// dies. Registered at bind time, called with the invalidated range in the
/// upstream's address coordinates.
pub type InvalidateHook = Box<dyn Fn(AddrRange)>;

/// Capability set of a target endpoint: blocking transport, debug
/// transport and DMI negotiation, each addressed to one of the device's
/// target sockets. Buses, width adapters, stubs and peripherals all answer
/// this same interface.
pub trait TlmDevice {
    fn b_transport(&mut self, socket: usize, tx: &mut Transaction, offset: &mut SimTime);

    /// Synchronous debugger access; must not consume simulated time.
    fn transport_dbg(&mut self, socket: usize, tx: &mut Transaction) -> usize;

    fn get_direct_mem_ptr(&mut self, socket: usize, tx: &Transaction) -> Option<DmiDescriptor>;

    /// Attach an upstream invalidation hook to `socket`.
    fn register_upstream(&mut self, socket: usize, hook: InvalidateHook);

    /// Word width of `socket` in bytes.
    fn socket_width(&self, socket: usize) -> usize;
}

/// A bound target endpoint: shared handle onto a device plus the index of
/// the target socket the binding goes to.
#[derive(Clone)]
pub struct TargetPort {
    dev: Rc<RefCell<dyn TlmDevice>>,
    socket: usize,
}

impl TargetPort {
    pub fn new<D: TlmDevice + 'static>(dev: Rc<RefCell<D>>, socket: usize) -> TargetPort {
        TargetPort { dev, socket }
    }

    pub fn b_transport(&self, tx: &mut Transaction, offset: &mut SimTime) {
        self.dev.borrow_mut().b_transport(self.socket, tx, offset);
    }

    pub fn transport_dbg(&self, tx: &mut Transaction) -> usize {
        self.dev.borrow_mut().transport_dbg(self.socket, tx)
    }

    pub fn get_direct_mem_ptr(&self, tx: &Transaction) -> Option<DmiDescriptor> {
        self.dev.borrow_mut().get_direct_mem_ptr(self.socket, tx)
    }

    pub fn register_upstream(&self, hook: InvalidateHook) {
        self.dev.borrow_mut().register_upstream(self.socket, hook);
    }

    pub fn width(&self) -> usize {
        self.dev.borrow().socket_width(self.socket)
    }

    /// Do two ports name the same socket of the same device?
    pub fn same_endpoint(&self, other: &TargetPort) -> bool {
        Rc::ptr_eq(&self.dev, &other.dev) && self.socket == other.socket
    }
}

/// Snapshot of the transaction a target socket is currently servicing,
/// readable by the device while its callbacks run.
#[derive(Clone, Copy, Debug)]
pub struct CurrentTransaction {
    pub sideband: Sideband,
    pub addr: AddrRange,
    pub size: usize,
    pub debug: bool,
}

/// Target-side endpoint of a device.
///
/// Serializes inbound transactions in FIFO arrival order with a ticket
/// counter, runs the exclusive monitor, maintains the target-side DMI cache
/// and fans invalidations out to bound upstream initiators. All transport
/// entry points take `&self`; the mutable state is interior so a device can
/// keep the socket as a plain field next to the state its dispatch mutates.
pub struct TargetSocket {
    name: String,
    space: AddressSpace,
    width: usize,
    allow_dmi: bool,
    sched: Rc<Scheduler>,
    dmi_cache: Arc<DmiCache>,
    exmon: RefCell<ExclusiveMonitor>,
    curr: Cell<u64>,
    next: Cell<u64>,
    holder: Cell<Option<ProcessId>>,
    depth: Cell<u32>,
    current: RefCell<Vec<CurrentTransaction>>,
    upstream: RefCell<Vec<InvalidateHook>>,
}

impl TargetSocket {
    pub fn new(name: impl Into<String>, space: AddressSpace, sched: Rc<Scheduler>) -> TargetSocket {
        TargetSocket {
            name: name.into(),
            space,
            width: 8,
            allow_dmi: true,
            sched,
            dmi_cache: Arc::new(DmiCache::new()),
            exmon: RefCell::new(ExclusiveMonitor::new()),
            curr: Cell::new(0),
            next: Cell::new(0),
            holder: Cell::new(None),
            depth: Cell::new(0),
            current: RefCell::new(Vec::new()),
            upstream: RefCell::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn set_width(&mut self, width: usize) {
        assert!(width > 0);
        self.width = width;
    }

    pub fn set_allow_dmi(&mut self, allow: bool) {
        self.allow_dmi = allow;
    }

    pub fn dmi_cache(&self) -> &DmiCache {
        &self.dmi_cache
    }

    /// Shared handle to the cache, e.g. for an off-thread invalidator.
    pub fn dmi_cache_handle(&self) -> Arc<DmiCache> {
        Arc::clone(&self.dmi_cache)
    }

    pub fn exmon(&self) -> &RefCell<ExclusiveMonitor> {
        &self.exmon
    }

    pub fn add_upstream(&self, hook: InvalidateHook) {
        self.upstream.borrow_mut().push(hook);
    }

    // -- current transaction introspection ---------------------------------

    pub fn in_transaction(&self) -> bool {
        !self.current.borrow().is_empty()
    }

    pub fn in_debug_transaction(&self) -> bool {
        self.current.borrow().last().is_some_and(|c| c.debug)
    }

    pub fn current_transaction(&self) -> Option<CurrentTransaction> {
        self.current.borrow().last().copied()
    }

    pub fn current_sideband(&self) -> Sideband {
        self.current
            .borrow()
            .last()
            .map(|c| c.sideband)
            .unwrap_or(Sideband::NONE)
    }

    // -- serialization ------------------------------------------------------

    fn acquire(&self, snapshot: CurrentTransaction) {
        let me = self.sched.current_process();
        if self.depth.get() > 0 && self.holder.get() == Some(me) {
            // Re-entry by the ticket holder. The FIFO is a ticket queue,
            // not a lock, so a transaction dispatched from within the
            // current one passes straight through.
            self.depth.set(self.depth.get() + 1);
        } else {
            let ticket = self.next.get();
            self.next.set(ticket + 1);
            // A suspending kernel parks the process here until its ticket
            // comes up; with a run-to-completion kernel an out-of-turn
            // arrival cannot happen.
            assert_eq!(
                self.curr.get(),
                ticket,
                "socket '{}': FIFO wait requires a suspending scheduler",
                self.name
            );
            self.holder.set(Some(me));
            self.depth.set(1);
        }
        self.current.borrow_mut().push(snapshot);
    }

    fn release(&self) {
        self.current.borrow_mut().pop();
        let depth = self.depth.get() - 1;
        self.depth.set(depth);
        if depth == 0 {
            self.holder.set(None);
            self.curr.set(self.curr.get() + 1);
        }
    }

    // -- transport ----------------------------------------------------------

    /// Admit a transaction for dispatch. Returns `true` when the caller
    /// should forward the transaction to the host (and afterwards call
    /// [`TargetSocket::end_transport`]); `false` when the socket already
    /// completed it (response is set, no balancing call needed).
    pub fn begin_transport(&self, tx: &mut Transaction) -> bool {
        if tx.size() > self.width {
            tx.response = Response::BurstError;
            return false;
        }

        self.acquire(CurrentTransaction {
            sideband: tx.sideband,
            addr: tx.range(),
            size: tx.size(),
            debug: false,
        });

        if tx.sideband.is_excl() && tx.is_read() {
            self.unmap_dmi(tx.range());
        }

        tx.dmi_allowed = false;
        if self.allow_dmi
            && self
                .dmi_cache
                .lookup(tx.range(), tx.command.access())
                .is_some()
        {
            tx.dmi_allowed = true;
        }

        if !self.exmon.borrow_mut().update(tx) {
            // Failed store-conditional: completes ok, performs nothing.
            tx.response = Response::Ok;
            self.release();
            return false;
        }

        true
    }

    pub fn end_transport(&self) {
        self.release();
    }

    /// Bracket a debug dispatch: bypasses the FIFO, leaves the monitor and
    /// the caches alone, and publishes the snapshot with the debug flag.
    pub fn begin_debug(&self, tx: &Transaction) {
        self.current.borrow_mut().push(CurrentTransaction {
            sideband: tx.sideband | Sideband::DEBUG,
            addr: tx.range(),
            size: tx.size(),
            debug: true,
        });
    }

    pub fn end_debug(&self) {
        self.current.borrow_mut().pop();
    }

    /// Answer a DMI request: consult the target-side cache, then the
    /// host-provided fallback, then let the exclusive monitor veto or
    /// narrow the window.
    pub fn grant_dmi(
        &self,
        tx: &Transaction,
        host: impl FnOnce() -> Option<DmiDescriptor>,
    ) -> Option<DmiDescriptor> {
        if !self.allow_dmi {
            return None;
        }
        let mut dmi = self
            .dmi_cache
            .lookup(tx.range(), tx.command.access())
            .or_else(host)?;
        if self.exmon.borrow().override_dmi(tx, &mut dmi) {
            Some(dmi)
        } else {
            None
        }
    }

    // -- dmi management -----------------------------------------------------

    pub fn map_dmi(&self, dmi: DmiDescriptor) {
        self.dmi_cache.insert(dmi);
    }

    /// Invalidate `range` here and in every bound upstream cache.
    pub fn unmap_dmi(&self, range: AddrRange) {
        self.dmi_cache.invalidate(range);
        for hook in self.upstream.borrow().iter() {
            hook(range);
        }
    }

    /// Re-stamp resident DMI windows with new latencies; upstream holders
    /// of a changed window are invalidated so they re-fetch.
    pub fn remap_dmi(&self, read: SimTime, write: SimTime) {
        for range in self.dmi_cache.remap_latencies(read, write) {
            for hook in self.upstream.borrow().iter() {
                hook(range);
            }
        }
    }

    /// Tell every upstream holder to drop all windows granted through this
    /// socket.
    pub fn invalidate_dmi(&self) {
        for entry in self.dmi_cache.entries() {
            for hook in self.upstream.borrow().iter() {
                hook(entry.range());
            }
        }
    }

    /// Reset hook: clears the DMI cache (upstream included) and the
    /// exclusive monitor.
    pub fn reset(&self) {
        self.invalidate_dmi();
        self.dmi_cache.clear();
        self.exmon.borrow_mut().clear();
    }
}

/// Initiator-side endpoint.
///
/// Owns a private DMI cache, a default sideband merged into every request,
/// and the bound downstream port. Typed accesses first try direct memory,
/// then fall back to transactions split at the socket width.
pub struct InitiatorSocket {
    name: String,
    width: usize,
    sbi: Sideband,
    allow_dmi: bool,
    sched: Rc<Scheduler>,
    dmi_cache: Arc<DmiCache>,
    target: Option<TargetPort>,
    on_invalidate: Rc<RefCell<Option<Box<dyn Fn(AddrRange)>>>>,
}

impl InitiatorSocket {
    pub fn new(name: impl Into<String>, sched: Rc<Scheduler>) -> InitiatorSocket {
        InitiatorSocket {
            name: name.into(),
            width: 8,
            sbi: Sideband::NONE,
            allow_dmi: true,
            sched,
            dmi_cache: Arc::new(DmiCache::new()),
            target: None,
            on_invalidate: Rc::new(RefCell::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn set_width(&mut self, width: usize) {
        assert!(width > 0);
        self.width = width;
    }

    pub fn cpuid(&self) -> u64 {
        self.sbi.cpuid
    }

    pub fn set_cpuid(&mut self, cpuid: u64) {
        self.sbi.cpuid = cpuid;
    }

    pub fn set_privilege(&mut self, privilege: u64) {
        self.sbi.privilege = privilege;
    }

    pub fn set_allow_dmi(&mut self, allow: bool) {
        self.allow_dmi = allow;
    }

    pub fn dmi_cache(&self) -> &DmiCache {
        &self.dmi_cache
    }

    pub fn dmi_cache_handle(&self) -> Arc<DmiCache> {
        Arc::clone(&self.dmi_cache)
    }

    pub fn is_bound(&self) -> bool {
        self.target.is_some()
    }

    /// Hook called (after the local cache purge) whenever the downstream
    /// target invalidates a DMI window this socket may hold.
    pub fn set_on_invalidate(&self, hook: impl Fn(AddrRange) + 'static) {
        *self.on_invalidate.borrow_mut() = Some(Box::new(hook));
    }

    /// Bind to a target endpoint and register the backward (invalidation)
    /// path with it. A width adapter is inserted automatically when the
    /// two ends disagree on the word width.
    pub fn bind(&mut self, port: TargetPort) {
        assert!(
            self.target.is_none(),
            "initiator socket '{}' already bound",
            self.name
        );
        let down_width = port.width();
        let port = if down_width != usize::MAX && down_width != self.width {
            let adapter = crate::adapter::BusWidthAdapter::new(
                format!("{}.bwa", self.name),
                self.width,
                port,
            );
            TargetPort::new(Rc::new(RefCell::new(adapter)), 0)
        } else {
            port
        };
        let cache = Arc::clone(&self.dmi_cache);
        let notify = Rc::clone(&self.on_invalidate);
        port.register_upstream(Box::new(move |range| {
            cache.invalidate(range);
            if let Some(hook) = notify.borrow().as_ref() {
                hook(range);
            }
        }));
        self.target = Some(port);
    }

    /// Terminate the socket with a stub target answering every transaction
    /// with `response` and granting no DMI.
    pub fn stub(&mut self, response: Response) {
        let stub = Rc::new(RefCell::new(crate::stubs::TargetStub::new(response)));
        self.bind(TargetPort::new(stub, 0));
    }

    fn target(&self) -> &TargetPort {
        self.target
            .as_ref()
            .unwrap_or_else(|| panic!("initiator socket '{}' is not bound", self.name))
    }

    pub fn map_dmi(&self, dmi: DmiDescriptor) {
        self.dmi_cache.insert(dmi);
    }

    pub fn unmap_dmi(&self, range: AddrRange) {
        self.dmi_cache.invalidate(range);
    }

    /// Transmit exactly one transaction. Returns the number of bytes the
    /// target serviced (0 on failure or a failed store-conditional).
    pub fn send(&self, tx: &mut Transaction, info: Sideband, offset: &mut SimTime) -> usize {
        let size = tx.size();
        let width = tx.streaming_width;

        if width == 0 || width > size || size % width != 0 {
            tx.response = Response::BurstError;
            return 0;
        }
        if tx.byte_enable.as_ref().is_some_and(|be| be.is_empty()) {
            tx.response = Response::ByteEnableError;
            return 0;
        }

        tx.reset();
        tx.sideband = self.sbi | info;

        let mut bytes;
        if tx.sideband.is_debug() {
            let stamp = self.sched.time_stamp();
            bytes = self.target().transport_dbg(tx);
            assert_eq!(
                stamp,
                self.sched.time_stamp(),
                "time advanced during debug access via '{}'",
                self.name
            );
        } else {
            if tx.sideband.is_sync() || self.sched.needs_sync(*offset) {
                self.sched.sync(offset);
            }

            self.target().b_transport(tx, offset);

            if tx.sideband.is_sync() || self.sched.needs_sync(*offset) {
                self.sched.sync(offset);
            }
            bytes = if tx.response.is_ok() { tx.size() } else { 0 };
        }

        // A store-conditional that lost its reservation reports 0 bytes.
        if info.is_excl() && !tx.sideband.is_excl() {
            bytes = 0;
        }

        if self.allow_dmi && tx.dmi_allowed {
            if let Some(dmi) = self.target().get_direct_mem_ptr(tx) {
                debug!(socket = %self.name, range = %dmi.range(), "dmi granted");
                self.dmi_cache.insert(dmi);
            }
        }

        bytes
    }

    fn dmi_read(&self, addr: u64, data: &mut [u8], info: Sideband, offset: &mut SimTime) -> bool {
        if !self.allow_dmi || info.is_nodmi() || info.is_excl() || data.is_empty() {
            return false;
        }
        let range = AddrRange::with_size(addr, data.len() as u64);
        let Some(dmi) = self.dmi_cache.lookup(range, Access::Read) else {
            return false;
        };

        if info.is_sync() && !info.is_debug() {
            self.sched.sync(offset);
        }

        // SAFETY: the cache only holds windows that have not been
        // invalidated; lookup checked that the window covers `range`.
        unsafe { dmi.copy_out(addr, data) };

        if !info.is_debug() {
            *offset += dmi.read_latency();
            if info.is_sync() {
                self.sched.sync(offset);
            }
        }
        true
    }

    fn dmi_write(&self, addr: u64, data: &[u8], info: Sideband, offset: &mut SimTime) -> bool {
        if !self.allow_dmi || info.is_nodmi() || info.is_excl() || data.is_empty() {
            return false;
        }
        let range = AddrRange::with_size(addr, data.len() as u64);
        // Debug accesses may reuse a read-granting window for writes.
        let needed = if info.is_debug() {
            Access::Read
        } else {
            Access::Write
        };
        let Some(dmi) = self.dmi_cache.lookup(range, needed) else {
            return false;
        };

        if info.is_sync() && !info.is_debug() {
            self.sched.sync(offset);
        }

        // SAFETY: as in dmi_read.
        unsafe { dmi.copy_in(addr, data) };

        if !info.is_debug() {
            *offset += dmi.write_latency();
            if info.is_sync() {
                self.sched.sync(offset);
            }
        }
        true
    }

    /// Typed read: DMI fast path, else transactions split at the socket
    /// width. Stops at the first failing beat; the byte count reports how
    /// far it got.
    pub fn read(
        &self,
        addr: u64,
        data: &mut [u8],
        info: Sideband,
        offset: &mut SimTime,
    ) -> (Response, usize) {
        if self.dmi_read(addr, data, info, offset) {
            return (Response::Ok, data.len());
        }

        if info.is_debug() {
            // Debug transactions may be arbitrarily wide.
            let mut tx = Transaction::read(addr, data.len());
            let n = self.send(&mut tx, info, offset);
            data[..n].copy_from_slice(&tx.data[..n]);
            let response = if tx.response == Response::Incomplete {
                Response::Ok
            } else {
                tx.response
            };
            return (response, n);
        }

        let mut done = 0;
        let mut response = Response::Incomplete;
        while done < data.len() {
            let beat = (data.len() - done).min(self.width);
            let mut tx = Transaction::read(addr + done as u64, beat);
            let bytes = self.send(&mut tx, info, offset);

            if tx.response.is_ok() {
                data[done..done + beat].copy_from_slice(&tx.data);
            }
            response = tx.response;
            done += bytes;

            if response == Response::Incomplete {
                warn!(socket = %self.name, "incomplete response from target at {addr:#x}");
                break;
            }
            if bytes == 0 || response.is_error() {
                break;
            }
        }
        (response, done)
    }

    /// Typed write; the same splitting and partial-failure rules as
    /// [`InitiatorSocket::read`].
    pub fn write(
        &self,
        addr: u64,
        data: &[u8],
        info: Sideband,
        offset: &mut SimTime,
    ) -> (Response, usize) {
        if self.dmi_write(addr, data, info, offset) {
            return (Response::Ok, data.len());
        }

        if info.is_debug() {
            let mut tx = Transaction::write(addr, data);
            let n = self.send(&mut tx, info, offset);
            let response = if tx.response == Response::Incomplete {
                Response::Ok
            } else {
                tx.response
            };
            return (response, n);
        }

        let mut done = 0;
        let mut response = Response::Incomplete;
        while done < data.len() {
            let beat = (data.len() - done).min(self.width);
            let mut tx = Transaction::write(addr + done as u64, &data[done..done + beat]);
            let bytes = self.send(&mut tx, info, offset);

            response = tx.response;
            done += bytes;

            if response == Response::Incomplete {
                warn!(socket = %self.name, "incomplete response from target at {addr:#x}");
                break;
            }
            if bytes == 0 || response.is_error() {
                break;
            }
        }
        (response, done)
    }

    /// Obtain a DMI window covering `range` with `access` rights, fetching
    /// and caching a fresh grant if necessary. Used by models that want a
    /// raw pointer for bulk transfers.
    pub fn dmi_probe(&self, range: AddrRange, access: Access) -> Option<DmiDescriptor> {
        if !self.allow_dmi {
            return None;
        }
        if let Some(dmi) = self.dmi_cache.lookup(range, access) {
            return Some(dmi);
        }

        let mut tx = Transaction::probe(range.start, range.length() as usize);
        tx.command = match access {
            Access::Write | Access::ReadWrite => Command::Write,
            Access::Read => Command::Read,
            Access::None => Command::Ignore,
        };
        tx.sideband = self.sbi;

        let dmi = self.target().get_direct_mem_ptr(&tx)?;
        self.dmi_cache.insert(dmi);

        // The grant may cover less or allow less than what was asked for.
        if !dmi.access().covers(access) || !range.inside(dmi.range()) {
            return None;
        }
        Some(dmi)
    }
}

macro_rules! scalar_access {
    ($read:ident, $write:ident, $t:ty) => {
        impl InitiatorSocket {
            #[doc = concat!("Read one naturally-sized `", stringify!($t), "` in host byte order.")]
            pub fn $read(
                &self,
                addr: u64,
                info: Sideband,
                offset: &mut SimTime,
            ) -> (Response, $t) {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                let (response, _) = self.read(addr, &mut buf, info, offset);
                (response, <$t>::from_ne_bytes(buf))
            }

            #[doc = concat!("Write one naturally-sized `", stringify!($t), "` in host byte order.")]
            pub fn $write(
                &self,
                addr: u64,
                value: $t,
                info: Sideband,
                offset: &mut SimTime,
            ) -> Response {
                self.write(addr, &value.to_ne_bytes(), info, offset).0
            }
        }
    };
}

scalar_access!(read_u8, write_u8, u8);
scalar_access!(read_u16, write_u16, u16);
scalar_access!(read_u32, write_u32, u32);
scalar_access!(read_u64, write_u64, u64);
