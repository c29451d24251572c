use std::cell::RefCell;
use std::rc::Rc;

use ferrite_peripheral::{Peripheral, PeripheralDevice, Register};
use ferrite_sim::Scheduler;
use ferrite_tlm::{InvalidateHook, TlmDevice, Transaction};
use ferrite_types::{Access, SimTime};
use rand::{Rng as _, SeedableRng};

/// Hardware random-number generator: a single read-only register yielding
/// a fresh 32-bit value on every read. Seeded, so a platform run is
/// reproducible; reset rewinds the stream.
pub struct Rng {
    peripheral: Peripheral,
    seed: u64,
    prng: Rc<RefCell<rand::rngs::StdRng>>,
}

impl Rng {
    pub fn new(name: impl Into<String>, sched: Rc<Scheduler>, seed: u64) -> Rng {
        let mut peripheral = Peripheral::new(name, sched);
        let prng = Rc::new(RefCell::new(rand::rngs::StdRng::seed_from_u64(seed)));

        let mut rng = Register::new("rng", 0x0, 4, 0);
        rng.set_access(Access::Read);
        let stream = Rc::clone(&prng);
        rng.on_read(move |_| stream.borrow_mut().gen::<u32>() as u64);
        peripheral
            .add_register(rng)
            .expect("first register cannot overlap");

        Rng {
            peripheral,
            seed,
            prng,
        }
    }

    pub fn reset(&mut self) {
        self.peripheral.reset();
        *self.prng.borrow_mut() = rand::rngs::StdRng::seed_from_u64(self.seed);
    }
}

impl PeripheralDevice for Rng {
    fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    fn peripheral_mut(&mut self) -> &mut Peripheral {
        &mut self.peripheral
    }
}

impl TlmDevice for Rng {
    fn b_transport(&mut self, socket: usize, tx: &mut Transaction, offset: &mut SimTime) {
        ferrite_peripheral::b_transport(self, socket, tx, offset);
    }

    fn transport_dbg(&mut self, socket: usize, tx: &mut Transaction) -> usize {
        ferrite_peripheral::transport_dbg(self, socket, tx)
    }

    fn get_direct_mem_ptr(
        &mut self,
        socket: usize,
        tx: &Transaction,
    ) -> Option<ferrite_tlm::DmiDescriptor> {
        ferrite_peripheral::get_direct_mem_ptr(self, socket, tx)
    }

    fn register_upstream(&mut self, socket: usize, hook: InvalidateHook) {
        ferrite_peripheral::register_upstream(self, socket, hook);
    }

    fn socket_width(&self, socket: usize) -> usize {
        ferrite_peripheral::socket_width(self, socket)
    }
}
