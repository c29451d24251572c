use std::cell::RefCell;
use std::rc::Rc;

use ferrite_sim::{ProcessId, Scheduler};
use ferrite_tlm::{HostMemory, Response, Sideband, TargetSocket, Transaction};
use ferrite_types::{Access, AddrRange, AddressSpace, SimTime};

fn socket(sched: &Rc<Scheduler>) -> TargetSocket {
    TargetSocket::new("tgt", AddressSpace::DEFAULT, Rc::clone(sched))
}

#[test]
fn overwide_transactions_fail_with_burst_error() {
    let sched = Scheduler::new();
    let mut s = socket(&sched);
    s.set_width(4);

    let mut tx = Transaction::read(0x0, 8);
    assert!(!s.begin_transport(&mut tx));
    assert_eq!(tx.response, Response::BurstError);
    assert!(!s.in_transaction());
}

#[test]
fn tickets_serialize_and_holder_may_reenter() {
    let sched = Scheduler::new();
    let s = socket(&sched);
    let _guard = sched.enter_process(ProcessId(1));

    let mut outer = Transaction::read(0x0, 4);
    assert!(s.begin_transport(&mut outer));
    assert!(s.in_transaction());

    // A nested transaction from the same process passes the ticket queue.
    let mut inner = Transaction::write(0x4, &[0; 4]);
    assert!(s.begin_transport(&mut inner));
    let snap = s.current_transaction().unwrap();
    assert_eq!(snap.addr, AddrRange::new(0x4, 0x7));
    s.end_transport();

    // Back to the outer snapshot.
    assert_eq!(
        s.current_transaction().unwrap().addr,
        AddrRange::new(0x0, 0x3)
    );
    s.end_transport();
    assert!(!s.in_transaction());
}

#[test]
fn exclusive_read_reserves_and_invalidates_upstream_dmi() {
    let sched = Scheduler::new();
    let mem = HostMemory::new(0x100).unwrap();
    let s = socket(&sched);
    s.map_dmi(mem.dmi(0x0));

    let invalidated: Rc<RefCell<Vec<AddrRange>>> = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&invalidated);
    s.add_upstream(Box::new(move |r| log.borrow_mut().push(r)));

    let mut tx = Transaction::read(0x10, 4);
    tx.sideband = Sideband::EXCL | Sideband::with_cpuid(3);
    assert!(s.begin_transport(&mut tx));
    s.end_transport();

    assert!(s.exmon().borrow().has_lock(3, AddrRange::new(0x10, 0x13)));
    assert_eq!(*invalidated.borrow(), vec![AddrRange::new(0x10, 0x13)]);
    // The socket's own cache lost the bytes as well.
    assert!(s
        .dmi_cache()
        .lookup(AddrRange::new(0x10, 0x13), Access::Read)
        .is_none());
}

#[test]
fn store_conditional_without_reservation_completes_without_dispatch() {
    let sched = Scheduler::new();
    let s = socket(&sched);

    let mut tx = Transaction::write(0x10, &[1, 2, 3, 4]);
    tx.sideband = Sideband::EXCL | Sideband::with_cpuid(9);

    // No matching reservation: the socket answers ok itself and tells the
    // caller not to dispatch into the host.
    assert!(!s.begin_transport(&mut tx));
    assert_eq!(tx.response, Response::Ok);
    assert!(!tx.sideband.is_excl());
    assert!(!s.in_transaction());
}

#[test]
fn dmi_hint_reflects_the_target_cache() {
    let sched = Scheduler::new();
    let mem = HostMemory::new(0x100).unwrap();
    let s = socket(&sched);

    let mut tx = Transaction::read(0x0, 4);
    assert!(s.begin_transport(&mut tx));
    assert!(!tx.dmi_allowed);
    s.end_transport();

    s.map_dmi(mem.dmi(0x0));
    let mut tx = Transaction::read(0x0, 4);
    assert!(s.begin_transport(&mut tx));
    assert!(tx.dmi_allowed);
    s.end_transport();
}

#[test]
fn grants_pass_through_the_exclusive_monitor() {
    let sched = Scheduler::new();
    let mem = HostMemory::new(0x1000).unwrap();
    let s = socket(&sched);
    s.map_dmi(mem.dmi(0x0));

    s.exmon()
        .borrow_mut()
        .add_lock(1, AddrRange::new(0x100, 0x103));

    // Request away from the reservation: granted, but narrowed around it.
    let tx = Transaction::read(0x200, 4);
    let dmi = s.grant_dmi(&tx, || None).expect("grant expected");
    assert_eq!(dmi.range(), AddrRange::new(0x104, 0xfff));

    // Request at the reserved address: denied outright.
    let tx = Transaction::read(0x100, 4);
    assert!(s.grant_dmi(&tx, || None).is_none());
}

#[test]
fn debug_snapshot_is_marked_and_stacked() {
    let sched = Scheduler::new();
    let s = socket(&sched);

    let tx = Transaction::read(0x40, 8);
    s.begin_debug(&tx);
    assert!(s.in_transaction());
    assert!(s.in_debug_transaction());
    assert!(s.current_sideband().is_debug());
    assert_eq!(s.current_transaction().unwrap().size, 8);
    s.end_debug();
    assert!(!s.in_transaction());
}

#[test]
fn remap_dmi_invalidates_upstream_holders_of_changed_windows() {
    let sched = Scheduler::new();
    let mem = HostMemory::new(0x100).unwrap();
    let s = socket(&sched);
    s.map_dmi(mem.dmi(0x0));

    let invalidated: Rc<RefCell<Vec<AddrRange>>> = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&invalidated);
    s.add_upstream(Box::new(move |r| log.borrow_mut().push(r)));

    // Same latencies: nothing to do.
    s.remap_dmi(SimTime::ZERO, SimTime::ZERO);
    assert!(invalidated.borrow().is_empty());

    s.remap_dmi(SimTime::from_ns(5), SimTime::from_ns(5));
    assert_eq!(invalidated.borrow().len(), 1);
    // The resident entry now carries the new latency.
    let entry = s
        .dmi_cache()
        .lookup(AddrRange::new(0x0, 0x0), Access::Read)
        .unwrap();
    assert_eq!(entry.read_latency(), SimTime::from_ns(5));
}

#[test]
fn reset_clears_cache_and_monitor() {
    let sched = Scheduler::new();
    let mem = HostMemory::new(0x100).unwrap();
    let s = socket(&sched);
    s.map_dmi(mem.dmi(0x0));
    s.exmon().borrow_mut().add_lock(1, AddrRange::new(0x0, 0xf));

    s.reset();
    assert!(s.dmi_cache().is_empty());
    assert!(s.exmon().borrow().locks().is_empty());
}
