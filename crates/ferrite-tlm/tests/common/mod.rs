use std::cell::RefCell;
use std::rc::Rc;

use ferrite_tlm::{
    DmiDescriptor, InvalidateHook, Response, TargetPort, TlmDevice, Transaction,
};
use ferrite_types::SimTime;

/// Scripted target endpoint: answers with a configured response, optionally
/// advertises and grants DMI, and records everything it sees.
pub struct ScriptedTarget {
    pub response: Response,
    pub advertise_dmi: bool,
    pub grant: Option<DmiDescriptor>,
    pub latency: SimTime,
    pub read_data: Vec<u8>,
    pub width: usize,
    /// Strip the exclusive flag from writes, like a monitor that found no
    /// matching reservation.
    pub clear_excl: bool,

    pub b_calls: usize,
    pub dbg_calls: usize,
    pub dmi_calls: usize,
    pub writes: Vec<(u64, Vec<u8>)>,
    pub hooks: Vec<InvalidateHook>,
}

impl ScriptedTarget {
    pub fn new(response: Response) -> Rc<RefCell<ScriptedTarget>> {
        Rc::new(RefCell::new(ScriptedTarget {
            response,
            advertise_dmi: false,
            grant: None,
            latency: SimTime::ZERO,
            read_data: Vec::new(),
            width: 8,
            clear_excl: false,
            b_calls: 0,
            dbg_calls: 0,
            dmi_calls: 0,
            writes: Vec::new(),
            hooks: Vec::new(),
        }))
    }

    pub fn port(this: &Rc<RefCell<ScriptedTarget>>) -> TargetPort {
        TargetPort::new(Rc::clone(this), 0)
    }

    fn fill_read(&self, tx: &mut Transaction) {
        if tx.is_read() && !self.read_data.is_empty() {
            let base = tx.address as usize;
            for (i, byte) in tx.data.iter_mut().enumerate() {
                *byte = self.read_data[(base + i) % self.read_data.len()];
            }
        }
    }

    /// Invoke the registered upstream hooks, as a real target would on an
    /// invalidation.
    pub fn invalidate_upstream(&self, range: ferrite_types::AddrRange) {
        for hook in &self.hooks {
            hook(range);
        }
    }
}

impl TlmDevice for ScriptedTarget {
    fn b_transport(&mut self, _socket: usize, tx: &mut Transaction, offset: &mut SimTime) {
        self.b_calls += 1;
        *offset += self.latency;
        self.fill_read(tx);
        if tx.is_write() {
            self.writes.push((tx.address, tx.data.clone()));
            if self.clear_excl {
                tx.sideband.set_excl(false);
            }
        }
        tx.response = self.response;
        tx.dmi_allowed = self.advertise_dmi;
    }

    fn transport_dbg(&mut self, _socket: usize, tx: &mut Transaction) -> usize {
        self.dbg_calls += 1;
        self.fill_read(tx);
        if tx.is_write() {
            self.writes.push((tx.address, tx.data.clone()));
        }
        // Response::Incomplete scripts a target that does not touch the
        // debug response at all.
        if self.response != Response::Incomplete {
            tx.response = self.response;
        }
        if self.response == Response::Ok || self.response == Response::Incomplete {
            tx.size()
        } else {
            0
        }
    }

    fn get_direct_mem_ptr(&mut self, _socket: usize, _tx: &Transaction) -> Option<DmiDescriptor> {
        self.dmi_calls += 1;
        self.grant
    }

    fn register_upstream(&mut self, _socket: usize, hook: InvalidateHook) {
        self.hooks.push(hook);
    }

    fn socket_width(&self, _socket: usize) -> usize {
        self.width
    }
}
