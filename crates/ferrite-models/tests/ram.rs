use std::cell::RefCell;
use std::rc::Rc;

use ferrite_models::Ram;
use ferrite_sim::Scheduler;
use ferrite_tlm::{InitiatorSocket, Response, Sideband, TargetPort};
use ferrite_types::SimTime;
use pretty_assertions::assert_eq;

fn ram_and_socket(read_only: bool) -> (Rc<RefCell<Ram>>, InitiatorSocket) {
    let sched = Scheduler::new();
    sched.set_quantum(SimTime::from_ms(1));
    let ram = Rc::new(RefCell::new(
        Ram::new("ram", Rc::clone(&sched), 0x200, read_only, 0, 0).unwrap(),
    ));
    let mut socket = InitiatorSocket::new("cpu", sched);
    socket.set_allow_dmi(false); // exercise the transport path
    socket.bind(TargetPort::new(Rc::clone(&ram), 0));
    (ram, socket)
}

#[test]
fn bytes_round_trip_through_transport() {
    let (_ram, socket) = ram_and_socket(false);
    let mut offset = SimTime::ZERO;

    let pattern: Vec<u8> = (0..32).collect();
    let (response, n) = socket.write(0x40, &pattern, Sideband::NONE, &mut offset);
    assert_eq!((response, n), (Response::Ok, 32));

    let mut back = vec![0u8; 32];
    let (response, _) = socket.read(0x40, &mut back, Sideband::NONE, &mut offset);
    assert_eq!(response, Response::Ok);
    assert_eq!(back, pattern);
}

#[test]
fn accesses_past_the_end_are_address_errors() {
    let (_ram, socket) = ram_and_socket(false);
    let mut offset = SimTime::ZERO;
    let mut buf = [0u8; 4];
    let (response, n) = socket.read(0x1fe, &mut buf, Sideband::NONE, &mut offset);
    // The first beat straddles the end of the window.
    assert_eq!((response, n), (Response::AddressError, 0));
}

#[test]
fn read_only_ram_rejects_stores() {
    let (ram, socket) = ram_and_socket(true);
    let mut offset = SimTime::ZERO;
    let (response, n) = socket.write(0x0, &[1, 2, 3, 4], Sideband::NONE, &mut offset);
    assert_eq!((response, n), (Response::CommandError, 0));
    assert_eq!(&ram.borrow().mem().as_slice()[..4], &[0, 0, 0, 0]);
}

#[test]
fn poison_shows_up_after_reset() {
    let (ram, socket) = ram_and_socket(false);
    ram.borrow_mut().set_poison(0xcc);
    ram.borrow_mut().reset();

    let mut buf = [0u8; 8];
    let mut offset = SimTime::ZERO;
    socket.read(0x100, &mut buf, Sideband::NONE, &mut offset);
    assert_eq!(buf, [0xcc; 8]);
}
