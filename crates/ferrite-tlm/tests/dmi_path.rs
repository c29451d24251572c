mod common;

use common::ScriptedTarget;
use ferrite_sim::Scheduler;
use ferrite_tlm::{HostMemory, InitiatorSocket, Response, Sideband, Transaction};
use ferrite_types::{Access, AddrRange, SimTime};
use pretty_assertions::assert_eq;

fn arena() -> HostMemory {
    let mut mem = HostMemory::new(0x1000).unwrap();
    mem.set_latencies(SimTime::from_ns(1), SimTime::from_ns(2));
    for (i, b) in mem.as_mut_slice().iter_mut().enumerate() {
        *b = i as u8;
    }
    mem
}

#[test]
fn typed_read_uses_cached_dmi_and_accrues_latency() {
    let mem = arena();
    let target = ScriptedTarget::new(Response::Ok);
    let mut socket = InitiatorSocket::new("ini", Scheduler::new());
    socket.bind(ScriptedTarget::port(&target));
    socket.map_dmi(mem.dmi(0x0));

    let mut buf = [0u8; 4];
    let mut offset = SimTime::ZERO;
    let (response, n) = socket.read(0x100, &mut buf, Sideband::NONE, &mut offset);

    assert_eq!((response, n), (Response::Ok, 4));
    assert_eq!(buf, [0x00, 0x01, 0x02, 0x03]);
    assert_eq!(offset, SimTime::from_ns(1));
    // Served straight from the host pointer.
    assert_eq!(target.borrow().b_calls, 0);
}

#[test]
fn typed_write_goes_through_dmi_into_the_arena() {
    let mem = arena();
    let target = ScriptedTarget::new(Response::Ok);
    let mut socket = InitiatorSocket::new("ini", Scheduler::new());
    socket.bind(ScriptedTarget::port(&target));
    socket.map_dmi(mem.dmi(0x0));

    let mut offset = SimTime::ZERO;
    let (response, n) = socket.write(0x20, &[0xaa, 0xbb], Sideband::NONE, &mut offset);
    assert_eq!((response, n), (Response::Ok, 2));
    assert_eq!(&mem.as_slice()[0x20..0x22], &[0xaa, 0xbb]);
    assert_eq!(offset, SimTime::from_ns(2));
    assert_eq!(target.borrow().b_calls, 0);
}

#[test]
fn grant_is_fetched_after_target_advertises_dmi() {
    let mem = arena();
    let target = ScriptedTarget::new(Response::Ok);
    {
        let mut t = target.borrow_mut();
        t.advertise_dmi = true;
        t.grant = Some(mem.dmi(0x0));
    }
    let socket = {
        let mut s = InitiatorSocket::new("ini", Scheduler::new());
        s.bind(ScriptedTarget::port(&target));
        s
    };

    assert!(socket.dmi_cache().is_empty());
    let mut tx = Transaction::read(0x100, 4);
    let mut offset = SimTime::ZERO;
    socket.send(&mut tx, Sideband::NONE, &mut offset);
    assert_eq!(target.borrow().dmi_calls, 1);
    assert_eq!(socket.dmi_cache().len(), 1);

    // The next typed access short-circuits.
    let mut buf = [0u8; 4];
    let (response, _) = socket.read(0x100, &mut buf, Sideband::NONE, &mut offset);
    assert_eq!(response, Response::Ok);
    assert_eq!(target.borrow().b_calls, 1);
}

#[test]
fn downstream_invalidation_purges_the_initiator_cache() {
    let mem = arena();
    let target = ScriptedTarget::new(Response::Ok);
    let mut socket = InitiatorSocket::new("ini", Scheduler::new());
    socket.bind(ScriptedTarget::port(&target));
    socket.map_dmi(mem.dmi(0x0));

    target
        .borrow()
        .invalidate_upstream(AddrRange::new(0x100, 0x103));

    // Nothing covering the invalidated bytes survives.
    assert!(socket
        .dmi_cache()
        .lookup(AddrRange::new(0x100, 0x103), Access::Read)
        .is_none());
    assert!(socket
        .dmi_cache()
        .lookup(AddrRange::new(0x102, 0x102), Access::Read)
        .is_none());

    // A read now travels the transport path again.
    let mut buf = [0u8; 4];
    let mut offset = SimTime::ZERO;
    let (response, _) = socket.read(0x100, &mut buf, Sideband::NONE, &mut offset);
    assert_eq!(response, Response::Ok);
    assert_eq!(target.borrow().b_calls, 1);
}

#[test]
fn exclusive_and_nodmi_accesses_bypass_direct_memory() {
    let mem = arena();
    let target = ScriptedTarget::new(Response::Ok);
    let mut socket = InitiatorSocket::new("ini", Scheduler::new());
    socket.bind(ScriptedTarget::port(&target));
    socket.map_dmi(mem.dmi(0x0));

    let mut buf = [0u8; 4];
    let mut offset = SimTime::ZERO;

    socket.read(0x0, &mut buf, Sideband::EXCL, &mut offset);
    assert_eq!(target.borrow().b_calls, 1);

    socket.read(0x0, &mut buf, Sideband::NODMI, &mut offset);
    assert_eq!(target.borrow().b_calls, 2);
}

#[test]
fn debug_write_may_reuse_a_read_only_window() {
    let mut mem = arena();
    mem.set_access(Access::Read);
    let target = ScriptedTarget::new(Response::Ok);
    let mut socket = InitiatorSocket::new("ini", Scheduler::new());
    socket.bind(ScriptedTarget::port(&target));
    socket.map_dmi(mem.dmi(0x0));

    let mut offset = SimTime::ZERO;

    // Non-debug writes miss the read-only window and use transport.
    let (response, _) = socket.write(0x10, &[0x55], Sideband::NONE, &mut offset);
    assert_eq!(response, Response::Ok);
    assert_eq!(target.borrow().b_calls, 1);

    // A debugger pokes straight through it, without touching time.
    let (response, n) = socket.write(0x10, &[0x66], Sideband::DEBUG, &mut offset);
    assert_eq!((response, n), (Response::Ok, 1));
    assert_eq!(mem.as_slice()[0x10], 0x66);
    assert_eq!(target.borrow().dbg_calls, 0);
    assert!(offset.is_zero());
}

#[test]
fn dmi_probe_fetches_and_caches_a_grant() {
    let mem = arena();
    let target = ScriptedTarget::new(Response::Ok);
    target.borrow_mut().grant = Some(mem.dmi(0x0));
    let mut socket = InitiatorSocket::new("ini", Scheduler::new());
    socket.bind(ScriptedTarget::port(&target));

    let dmi = socket
        .dmi_probe(AddrRange::new(0x100, 0x1ff), Access::ReadWrite)
        .expect("grant expected");
    assert!(AddrRange::new(0x100, 0x1ff).inside(dmi.range()));
    assert_eq!(socket.dmi_cache().len(), 1);
    assert_eq!(target.borrow().dmi_calls, 1);

    // Second probe is served locally.
    socket
        .dmi_probe(AddrRange::new(0x100, 0x1ff), Access::Read)
        .expect("cached grant expected");
    assert_eq!(target.borrow().dmi_calls, 1);
}
