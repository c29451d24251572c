use ferrite_types::SimTime;

use crate::socket::{InvalidateHook, TlmDevice};
use crate::transaction::{Response, Transaction};
use crate::DmiDescriptor;

/// Terminates an unconnected initiator socket: answers every transaction
/// with a fixed response (address-error by default) and never grants DMI.
///
/// The initiator-side counterpart needs no type of its own: an upstream
/// that registered no invalidation hooks already absorbs all backward
/// calls.
pub struct TargetStub {
    response: Response,
}

impl TargetStub {
    pub fn new(response: Response) -> TargetStub {
        TargetStub { response }
    }
}

impl Default for TargetStub {
    fn default() -> TargetStub {
        TargetStub::new(Response::AddressError)
    }
}

impl TlmDevice for TargetStub {
    fn b_transport(&mut self, _socket: usize, tx: &mut Transaction, _offset: &mut SimTime) {
        tx.response = self.response;
    }

    fn transport_dbg(&mut self, _socket: usize, tx: &mut Transaction) -> usize {
        tx.response = self.response;
        if tx.response.is_ok() {
            tx.size()
        } else {
            0
        }
    }

    fn get_direct_mem_ptr(&mut self, _socket: usize, _tx: &Transaction) -> Option<DmiDescriptor> {
        None
    }

    fn register_upstream(&mut self, _socket: usize, _hook: InvalidateHook) {
        // A stub never invalidates anything.
    }

    fn socket_width(&self, _socket: usize) -> usize {
        usize::MAX
    }
}
