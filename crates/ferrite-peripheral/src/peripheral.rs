use std::rc::Rc;

use ferrite_sim::{clock_cycles, Scheduler};
use ferrite_tlm::{
    Command, DmiDescriptor, InvalidateHook, Response, Sideband, TargetSocket, Transaction,
};
use ferrite_types::{swap_cell_buffer, Access, AddrRange, AddressSpace, Endian, SimTime};
use tracing::debug;

use crate::register::Register;

#[derive(thiserror::Error, Debug)]
pub enum RegisterError {
    #[error("register '{new}' overlaps '{existing}' in {space}")]
    Overlap {
        new: String,
        existing: String,
        space: AddressSpace,
    },
}

/// Host side of a memory-mapped peripheral: the ordered register file, the
/// target sockets (one per address space), the peripheral's byte order and
/// its read/write latencies in clock cycles.
///
/// Device models embed a `Peripheral` and implement [`PeripheralDevice`];
/// the transport glue in this module then turns bus transactions into
/// register dispatch with endian conversion and latency accrual.
pub struct Peripheral {
    name: String,
    sched: Rc<Scheduler>,
    endian: Endian,
    read_latency: u64,
    write_latency: u64,
    clock_hz: u64,
    read_cycle_time: SimTime,
    write_cycle_time: SimTime,
    current_cpu: u64,
    registers: Vec<Register>,
    sockets: Vec<TargetSocket>,
}

/// Default peripheral clock: latencies count cycles of this unless a model
/// sets its own rate.
pub const DEFAULT_CLOCK_HZ: u64 = 1_000_000_000;

impl Peripheral {
    pub fn new(name: impl Into<String>, sched: Rc<Scheduler>) -> Peripheral {
        let mut p = Peripheral {
            name: name.into(),
            sched,
            endian: Endian::host(),
            read_latency: 0,
            write_latency: 0,
            clock_hz: DEFAULT_CLOCK_HZ,
            read_cycle_time: SimTime::ZERO,
            write_cycle_time: SimTime::ZERO,
            current_cpu: 0,
            registers: Vec::new(),
            sockets: Vec::new(),
        };
        p.add_socket(AddressSpace::DEFAULT);
        p
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scheduler(&self) -> Rc<Scheduler> {
        Rc::clone(&self.sched)
    }

    // -- configuration ------------------------------------------------------

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    pub fn set_little_endian(&mut self) {
        self.endian = Endian::Little;
    }

    pub fn set_big_endian(&mut self) {
        self.endian = Endian::Big;
    }

    /// Latencies in clock cycles, converted once into times and re-derived
    /// on every clock change.
    pub fn set_latencies(&mut self, read_cycles: u64, write_cycles: u64) {
        self.read_latency = read_cycles;
        self.write_latency = write_cycles;
        self.update_cycle_times();
    }

    pub fn set_clock(&mut self, hz: u64) {
        let old = self.clock_hz;
        self.handle_clock_update(old, hz);
    }

    pub fn clock_hz(&self) -> u64 {
        self.clock_hz
    }

    pub fn read_cycle_time(&self) -> SimTime {
        self.read_cycle_time
    }

    pub fn write_cycle_time(&self) -> SimTime {
        self.write_cycle_time
    }

    fn update_cycle_times(&mut self) {
        self.read_cycle_time = clock_cycles(self.clock_hz, self.read_latency);
        self.write_cycle_time = clock_cycles(self.clock_hz, self.write_latency);
    }

    /// Initiator id of the transaction currently being serviced; scratch
    /// used by banked register access.
    pub fn current_cpu(&self) -> u64 {
        self.current_cpu
    }

    // -- sockets ------------------------------------------------------------

    /// Add a target socket serving `space`. Socket 0 (the default address
    /// space) exists from construction.
    pub fn add_socket(&mut self, space: AddressSpace) -> usize {
        let idx = self.sockets.len();
        let name = format!("{}.in{}", self.name, idx);
        self.sockets
            .push(TargetSocket::new(name, space, Rc::clone(&self.sched)));
        idx
    }

    pub fn socket(&self, idx: usize) -> &TargetSocket {
        &self.sockets[idx]
    }

    pub fn socket_mut(&mut self, idx: usize) -> &mut TargetSocket {
        &mut self.sockets[idx]
    }

    pub fn sockets(&self) -> &[TargetSocket] {
        &self.sockets
    }

    // -- registers ----------------------------------------------------------

    /// Register `reg`, keeping registration order for dispatch. Windows of
    /// registers sharing an address space must not overlap.
    pub fn add_register(&mut self, reg: Register) -> Result<usize, RegisterError> {
        if let Some(existing) = self
            .registers
            .iter()
            .find(|r| r.space() == reg.space() && r.range().overlaps(reg.range()))
        {
            return Err(RegisterError::Overlap {
                new: reg.name().to_string(),
                existing: existing.name().to_string(),
                space: reg.space(),
            });
        }
        self.registers.push(reg);
        Ok(self.registers.len() - 1)
    }

    /// Remove a register by name. Indices handed out by
    /// [`Peripheral::add_register`] for later registers shift down.
    pub fn remove_register(&mut self, name: &str) -> Option<Register> {
        let idx = self.registers.iter().position(|r| r.name() == name)?;
        Some(self.registers.remove(idx))
    }

    pub fn register(&self, idx: usize) -> &Register {
        &self.registers[idx]
    }

    pub fn register_mut(&mut self, idx: usize) -> &mut Register {
        &mut self.registers[idx]
    }

    pub fn registers(&self) -> impl Iterator<Item = &Register> {
        self.registers.iter()
    }

    pub fn natural_accesses_only(&mut self, only: bool) {
        for reg in &mut self.registers {
            reg.natural_accesses_only(only);
        }
    }

    fn find_register(&self, space: AddressSpace, range: AddrRange) -> Option<usize> {
        self.registers
            .iter()
            .position(|r| r.space() == space && r.range().overlaps(range))
    }

    // -- dmi ----------------------------------------------------------------

    /// Install a direct-memory window into every target socket's cache,
    /// stamped with the peripheral's current latencies.
    pub fn map_dmi(&self, ptr: *mut u8, range: AddrRange, access: Access) {
        let dmi = DmiDescriptor::new(ptr, range, access)
            .with_latencies(self.read_cycle_time, self.write_cycle_time);
        self.map_dmi_descriptor(dmi);
    }

    pub fn map_dmi_descriptor(&self, dmi: DmiDescriptor) {
        for socket in &self.sockets {
            socket.map_dmi(dmi);
        }
    }

    /// Withdraw direct-memory coverage of `range` from every socket and
    /// every upstream holder.
    pub fn unmap_dmi(&self, range: AddrRange) {
        for socket in &self.sockets {
            socket.unmap_dmi(range);
        }
    }

    // -- module-tree hooks --------------------------------------------------

    /// Restore every register to its initial values (all banks), drop all
    /// DMI grants and clear the exclusive monitors.
    pub fn reset(&mut self) {
        debug!(peripheral = %self.name, "reset");
        for reg in &mut self.registers {
            reg.reset();
        }
        for socket in &self.sockets {
            socket.reset();
        }
    }

    /// Clock-change hook: re-derive the latency times and re-stamp every
    /// granted DMI window with them.
    pub fn handle_clock_update(&mut self, old_hz: u64, new_hz: u64) {
        debug!(peripheral = %self.name, old_hz, new_hz, "clock update");
        self.clock_hz = new_hz;
        self.update_cycle_times();
        for socket in &self.sockets {
            socket.remap_dmi(self.read_cycle_time, self.write_cycle_time);
        }
    }
}

/// A device model built around a [`Peripheral`].
///
/// The fallback accessors serve the parts of the device's address windows
/// that no register claims (bulk memory, FIFOs); the default rejects them
/// with an address error.
pub trait PeripheralDevice {
    fn peripheral(&self) -> &Peripheral;
    fn peripheral_mut(&mut self) -> &mut Peripheral;

    fn fallback_read(
        &mut self,
        addr: AddrRange,
        data: &mut [u8],
        sbi: &Sideband,
        space: AddressSpace,
    ) -> Response {
        let _ = (addr, data, sbi, space);
        Response::AddressError
    }

    fn fallback_write(
        &mut self,
        addr: AddrRange,
        data: &[u8],
        sbi: &Sideband,
        space: AddressSpace,
    ) -> Response {
        let _ = (addr, data, sbi, space);
        Response::AddressError
    }
}

/// Blocking-transport entry for a peripheral device's `TlmDevice` impl:
/// socket serialization and monitoring around the register dispatch.
pub fn b_transport<D: PeripheralDevice + ?Sized>(
    dev: &mut D,
    socket: usize,
    tx: &mut Transaction,
    offset: &mut SimTime,
) {
    assert_eq!(
        tx.response,
        Response::Incomplete,
        "in-bound transaction already carries a response"
    );
    if !dev.peripheral().socket(socket).begin_transport(tx) {
        return;
    }
    transport(dev, socket, tx, offset, false);
    dev.peripheral().socket(socket).end_transport();
    assert_ne!(
        tx.response,
        Response::Incomplete,
        "target left the response incomplete"
    );
}

/// Debug-transport entry: bypasses the FIFO and must leave simulated time
/// untouched, so it runs against a throwaway zero offset.
pub fn transport_dbg<D: PeripheralDevice + ?Sized>(
    dev: &mut D,
    socket: usize,
    tx: &mut Transaction,
) -> usize {
    dev.peripheral().socket(socket).begin_debug(tx);
    let mut frozen = SimTime::ZERO;
    let n = transport(dev, socket, tx, &mut frozen, true);
    dev.peripheral().socket(socket).end_debug();
    n
}

/// DMI-request entry: serves grants out of the socket cache (populated via
/// [`Peripheral::map_dmi`]), subject to the exclusive monitor.
pub fn get_direct_mem_ptr<D: PeripheralDevice + ?Sized>(
    dev: &mut D,
    socket: usize,
    tx: &Transaction,
) -> Option<DmiDescriptor> {
    dev.peripheral().socket(socket).grant_dmi(tx, || None)
}

pub fn register_upstream<D: PeripheralDevice + ?Sized>(
    dev: &mut D,
    socket: usize,
    hook: InvalidateHook,
) {
    dev.peripheral().socket(socket).add_upstream(hook);
}

pub fn socket_width<D: PeripheralDevice + ?Sized>(dev: &D, socket: usize) -> usize {
    dev.peripheral().socket(socket).width()
}

/// The host dispatch: find the register claiming the transaction's window,
/// byte-swap for a foreign-endian peripheral, dispatch, swap back, accrue
/// latency. Falls back to the device's bulk accessors when no register
/// matches.
fn transport<D: PeripheralDevice + ?Sized>(
    dev: &mut D,
    socket: usize,
    tx: &mut Transaction,
    offset: &mut SimTime,
    debug: bool,
) -> usize {
    let space = dev.peripheral().socket(socket).space();
    let range = tx.range();
    let sbi = tx.sideband;

    match dev.peripheral().find_register(space, range) {
        Some(idx) => {
            let sched = dev.peripheral().scheduler();
            let p = dev.peripheral_mut();
            p.current_cpu = sbi.cpuid;

            let sync_before = {
                let reg = &p.registers[idx];
                !debug
                    && ((tx.is_read() && reg.needs_read_sync())
                        || (tx.is_write() && reg.needs_write_sync()))
            };
            if sync_before {
                sched.sync(offset);
            }

            let reg = &mut p.registers[idx];
            let cell = reg.cell_size();
            let span = range
                .intersect(reg.range())
                .expect("register selected by overlap");
            let window = (span.start - tx.address) as usize..(span.end - tx.address) as usize + 1;

            // Callbacks see host-endian values: swap the serviced window
            // per cell when the peripheral's byte order differs from the
            // host's. Partial-cell windows pass through unswapped.
            let rel_start = span.start - reg.range().start;
            let do_swap = !p.endian.is_host()
                && rel_start % cell as u64 == 0
                && window.len() % cell == 0;

            if do_swap {
                swap_cell_buffer(&mut tx.data[window.clone()], cell);
            }
            let n = reg.receive(tx, debug, sbi.cpuid);
            if do_swap {
                swap_cell_buffer(&mut tx.data[window], cell);
            }

            if tx.response.is_ok() && !debug {
                *offset += if tx.is_write() {
                    p.write_cycle_time
                } else {
                    p.read_cycle_time
                };
            }
            n
        }
        None => {
            let response = match tx.command {
                Command::Read => {
                    let mut data = std::mem::take(&mut tx.data);
                    let r = dev.fallback_read(range, &mut data, &sbi, space);
                    tx.data = data;
                    r
                }
                Command::Write => dev.fallback_write(range, &tx.data, &sbi, space),
                Command::Ignore => Response::Ok,
            };
            tx.response = response;

            if response.is_ok() && !debug {
                let p = dev.peripheral();
                *offset += if tx.is_write() {
                    p.write_cycle_time
                } else {
                    p.read_cycle_time
                };
            }
            if response.is_ok() {
                tx.size()
            } else {
                0
            }
        }
    }
}
