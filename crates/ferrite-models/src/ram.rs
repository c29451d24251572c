use std::rc::Rc;

use ferrite_peripheral::{Peripheral, PeripheralDevice};
use ferrite_sim::Scheduler;
use ferrite_tlm::{
    HostMemory, InvalidateHook, MemoryError, Response, Sideband, TlmDevice, Transaction,
};
use ferrite_types::{Access, AddrRange, AddressSpace, SimTime};
use tracing::debug;

/// Plain RAM: a peripheral without registers whose whole window is served
/// by a host-memory arena, granted to initiators as one DMI region.
///
/// Doubles as the memory end of exclusive load-linked/store-conditional
/// sequences: the exclusive monitor lives in the target socket, so the
/// model itself stays a byte store.
pub struct Ram {
    peripheral: Peripheral,
    mem: HostMemory,
    poison: u8,
    read_only: bool,
}

impl Ram {
    pub fn new(
        name: impl Into<String>,
        sched: Rc<Scheduler>,
        size: usize,
        read_only: bool,
        read_cycles: u64,
        write_cycles: u64,
    ) -> Result<Ram, MemoryError> {
        let mut peripheral = Peripheral::new(name, sched);
        peripheral.set_latencies(read_cycles, write_cycles);

        let mut mem = HostMemory::new(size)?;
        mem.set_access(if read_only {
            Access::Read
        } else {
            Access::ReadWrite
        });
        mem.set_latencies(peripheral.read_cycle_time(), peripheral.write_cycle_time());

        let ram = Ram {
            peripheral,
            mem,
            poison: 0,
            read_only,
        };
        ram.map_whole_window();
        Ok(ram)
    }

    fn map_whole_window(&self) {
        let access = if self.read_only {
            Access::Read
        } else {
            Access::ReadWrite
        };
        self.peripheral.map_dmi(
            self.mem.as_ptr(),
            AddrRange::with_size(0, self.mem.len() as u64),
            access,
        );
    }

    pub fn size(&self) -> usize {
        self.mem.len()
    }

    pub fn mem(&self) -> &HostMemory {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut HostMemory {
        &mut self.mem
    }

    /// Byte the arena is filled with at construction-time reset.
    pub fn set_poison(&mut self, poison: u8) {
        self.poison = poison;
    }

    pub fn reset(&mut self) {
        debug!(ram = %self.peripheral.name(), "reset");
        self.mem.fill(self.poison);
        self.peripheral.reset();
        // Reset dropped the DMI windows along with everything else; the
        // arena itself is still valid, so re-grant it.
        self.map_whole_window();
    }
}

impl PeripheralDevice for Ram {
    fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    fn peripheral_mut(&mut self) -> &mut Peripheral {
        &mut self.peripheral
    }

    fn fallback_read(
        &mut self,
        addr: AddrRange,
        data: &mut [u8],
        sbi: &Sideband,
        _space: AddressSpace,
    ) -> Response {
        self.mem.read(addr, data, sbi.is_debug())
    }

    fn fallback_write(
        &mut self,
        addr: AddrRange,
        data: &[u8],
        sbi: &Sideband,
        _space: AddressSpace,
    ) -> Response {
        self.mem.write(addr, data, sbi.is_debug())
    }
}

impl TlmDevice for Ram {
    fn b_transport(&mut self, socket: usize, tx: &mut Transaction, offset: &mut SimTime) {
        ferrite_peripheral::b_transport(self, socket, tx, offset);
    }

    fn transport_dbg(&mut self, socket: usize, tx: &mut Transaction) -> usize {
        ferrite_peripheral::transport_dbg(self, socket, tx)
    }

    fn get_direct_mem_ptr(&mut self, socket: usize, tx: &Transaction) -> Option<ferrite_tlm::DmiDescriptor> {
        ferrite_peripheral::get_direct_mem_ptr(self, socket, tx)
    }

    fn register_upstream(&mut self, socket: usize, hook: InvalidateHook) {
        ferrite_peripheral::register_upstream(self, socket, hook);
    }

    fn socket_width(&self, socket: usize) -> usize {
        ferrite_peripheral::socket_width(self, socket)
    }
}
