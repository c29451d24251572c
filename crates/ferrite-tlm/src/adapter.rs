use std::cell::RefCell;
use std::rc::Rc;

use ferrite_types::SimTime;

use crate::socket::{InvalidateHook, TargetPort, TlmDevice};
use crate::transaction::Transaction;
use crate::DmiDescriptor;

/// Two-port module gluing sockets of different word widths together.
///
/// Transport calls are forwarded verbatim (the initiator is responsible
/// for issuing transactions legal on both sides) and DMI invalidations
/// from downstream propagate upstream unchanged.
pub struct BusWidthAdapter {
    name: String,
    in_width: usize,
    out: TargetPort,
    upstream: Rc<RefCell<Vec<InvalidateHook>>>,
}

impl BusWidthAdapter {
    pub fn new(name: impl Into<String>, in_width: usize, out: TargetPort) -> BusWidthAdapter {
        let upstream: Rc<RefCell<Vec<InvalidateHook>>> = Rc::new(RefCell::new(Vec::new()));
        let hooks = Rc::clone(&upstream);
        out.register_upstream(Box::new(move |range| {
            for hook in hooks.borrow().iter() {
                hook(range);
            }
        }));
        BusWidthAdapter {
            name: name.into(),
            in_width,
            out,
            upstream,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn out_width(&self) -> usize {
        self.out.width()
    }
}

impl TlmDevice for BusWidthAdapter {
    fn b_transport(&mut self, _socket: usize, tx: &mut Transaction, offset: &mut SimTime) {
        self.out.b_transport(tx, offset);
    }

    fn transport_dbg(&mut self, _socket: usize, tx: &mut Transaction) -> usize {
        self.out.transport_dbg(tx)
    }

    fn get_direct_mem_ptr(&mut self, _socket: usize, tx: &Transaction) -> Option<DmiDescriptor> {
        self.out.get_direct_mem_ptr(tx)
    }

    fn register_upstream(&mut self, _socket: usize, hook: InvalidateHook) {
        self.upstream.borrow_mut().push(hook);
    }

    fn socket_width(&self, _socket: usize) -> usize {
        self.in_width
    }
}
