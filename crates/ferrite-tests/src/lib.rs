//! Shared helpers for the end-to-end platform tests.

use std::rc::Rc;

use ferrite_peripheral::{Peripheral, PeripheralDevice};
use ferrite_sim::Scheduler;
use ferrite_tlm::{DmiDescriptor, InvalidateHook, TargetPort, TlmDevice, Transaction};
use ferrite_types::SimTime;

/// Pass-through endpoint counting the transport calls that reach it. Sits
/// between an initiator and a real target to observe which path (DMI or
/// transport) served an access.
pub struct CountingPort {
    inner: TargetPort,
    pub b_calls: usize,
    pub dbg_calls: usize,
    pub dmi_calls: usize,
}

impl CountingPort {
    pub fn new(inner: TargetPort) -> CountingPort {
        CountingPort {
            inner,
            b_calls: 0,
            dbg_calls: 0,
            dmi_calls: 0,
        }
    }
}

impl TlmDevice for CountingPort {
    fn b_transport(&mut self, _socket: usize, tx: &mut Transaction, offset: &mut SimTime) {
        self.b_calls += 1;
        self.inner.b_transport(tx, offset);
    }

    fn transport_dbg(&mut self, _socket: usize, tx: &mut Transaction) -> usize {
        self.dbg_calls += 1;
        self.inner.transport_dbg(tx)
    }

    fn get_direct_mem_ptr(&mut self, _socket: usize, tx: &Transaction) -> Option<DmiDescriptor> {
        self.dmi_calls += 1;
        self.inner.get_direct_mem_ptr(tx)
    }

    fn register_upstream(&mut self, _socket: usize, hook: InvalidateHook) {
        self.inner.register_upstream(hook);
    }

    fn socket_width(&self, _socket: usize) -> usize {
        self.inner.width()
    }
}

/// Bare register-file device; tests add registers straight on the embedded
/// peripheral.
pub struct ScratchDevice {
    pub peripheral: Peripheral,
}

impl ScratchDevice {
    pub fn new(name: &str, sched: Rc<Scheduler>) -> ScratchDevice {
        ScratchDevice {
            peripheral: Peripheral::new(name, sched),
        }
    }
}

impl PeripheralDevice for ScratchDevice {
    fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    fn peripheral_mut(&mut self) -> &mut Peripheral {
        &mut self.peripheral
    }
}

impl TlmDevice for ScratchDevice {
    fn b_transport(&mut self, socket: usize, tx: &mut Transaction, offset: &mut SimTime) {
        ferrite_peripheral::b_transport(self, socket, tx, offset);
    }

    fn transport_dbg(&mut self, socket: usize, tx: &mut Transaction) -> usize {
        ferrite_peripheral::transport_dbg(self, socket, tx)
    }

    fn get_direct_mem_ptr(&mut self, socket: usize, tx: &Transaction) -> Option<DmiDescriptor> {
        ferrite_peripheral::get_direct_mem_ptr(self, socket, tx)
    }

    fn register_upstream(&mut self, socket: usize, hook: InvalidateHook) {
        ferrite_peripheral::register_upstream(self, socket, hook);
    }

    fn socket_width(&self, socket: usize) -> usize {
        ferrite_peripheral::socket_width(self, socket)
    }
}
