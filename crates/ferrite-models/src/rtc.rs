use std::cell::RefCell;
use std::rc::Rc;

use ferrite_peripheral::{Peripheral, PeripheralDevice, Register};
use ferrite_sim::Scheduler;
use ferrite_tlm::{InvalidateHook, TlmDevice, Transaction};
use ferrite_types::{Access, SimTime};

use crate::irq::IrqLine;

const CR_ENABLE: u32 = 1;

/// AMBA identification registers, one byte per 32-bit cell.
const AMBA_PID: u32 = 0x0014_1031;
const AMBA_CID: u32 = 0xb105_f00d;

const REG_DR: u64 = 0x00;
const REG_MR: u64 = 0x04;
const REG_LR: u64 = 0x08;
const REG_CR: u64 = 0x0c;
const REG_IMSC: u64 = 0x10;
const REG_RIS: u64 = 0x14;
const REG_MIS: u64 = 0x18;
const REG_ICR: u64 = 0x1c;
const REG_PID: u64 = 0xfe0;
const REG_CID: u64 = 0xff0;

struct RtcState {
    sched: Rc<Scheduler>,
    irq: IrqLine,
    epoch: u32,
    offset: u32,
    lr: u32,
    mr: u32,
    cr: u32,
    imsc: u32,
    ris: u32,
    match_at: Option<u64>,
}

impl RtcState {
    fn now_secs(&self) -> u64 {
        self.sched.time_stamp().as_ps() / 1_000_000_000_000
    }

    fn read_dr(&self) -> u32 {
        if self.cr & CR_ENABLE != 0 {
            self.offset.wrapping_add(self.now_secs() as u32)
        } else {
            0
        }
    }

    /// Schedule the next match against `mr`; an immediate match raises the
    /// status right away.
    fn arm(&mut self) {
        let ahead = self.mr.wrapping_sub(self.read_dr());
        if ahead == 0 {
            self.ris = 1;
            self.match_at = None;
        } else {
            self.match_at = Some(self.now_secs() + ahead as u64);
        }
    }

    /// Catch up with simulated time (the match may have passed since the
    /// last access) and drive the interrupt line.
    fn update(&mut self) {
        if let Some(t) = self.match_at {
            if self.cr & CR_ENABLE != 0 && self.now_secs() >= t {
                self.ris = 1;
                self.match_at = None;
            }
        }
        self.irq
            .set(self.ris & self.imsc != 0 && self.cr & CR_ENABLE != 0);
    }
}

/// PrimeCell-style real-time clock: a one-second counter derived from the
/// simulation clock, a match register raising a maskable interrupt, and a
/// load register rebasing the count.
///
/// All control registers force a quantum flush so the counter is read
/// against up-to-date simulated time.
pub struct Rtc {
    peripheral: Peripheral,
    state: Rc<RefCell<RtcState>>,
    irq: IrqLine,
}

impl Rtc {
    pub fn new(name: impl Into<String>, sched: Rc<Scheduler>, epoch: u32) -> Rtc {
        let mut peripheral = Peripheral::new(name, sched.clone());
        let irq = IrqLine::new();
        let state = Rc::new(RefCell::new(RtcState {
            sched,
            irq: irq.clone(),
            epoch,
            offset: epoch,
            lr: 0,
            mr: 0,
            cr: CR_ENABLE,
            imsc: 0,
            ris: 0,
            match_at: None,
        }));

        let mut dr = Register::new("dr", REG_DR, 4, 0);
        dr.set_access(Access::Read);
        dr.sync_always();
        let st = Rc::clone(&state);
        dr.on_read(move |_| {
            let mut st = st.borrow_mut();
            st.update();
            st.read_dr() as u64
        });
        peripheral.add_register(dr).expect("register map is fixed");

        let mut mr = Register::new("mr", REG_MR, 4, 0);
        mr.sync_always();
        let st = Rc::clone(&state);
        mr.on_read(move |_| st.borrow().mr as u64);
        let st = Rc::clone(&state);
        mr.on_write(move |_, val| {
            let mut st = st.borrow_mut();
            st.mr = val as u32;
            st.arm();
            st.update();
        });
        peripheral.add_register(mr).expect("register map is fixed");

        let mut lr = Register::new("lr", REG_LR, 4, 0);
        lr.sync_always();
        let st = Rc::clone(&state);
        lr.on_read(move |_| st.borrow().lr as u64);
        let st = Rc::clone(&state);
        lr.on_write(move |_, val| {
            let mut st = st.borrow_mut();
            let val = val as u32;
            st.offset = st.offset.wrapping_add(val.wrapping_sub(st.read_dr()));
            st.lr = val;
            st.arm();
            st.update();
        });
        peripheral.add_register(lr).expect("register map is fixed");

        let mut cr = Register::new("cr", REG_CR, 4, CR_ENABLE as u64);
        cr.sync_always();
        let st = Rc::clone(&state);
        cr.on_read(move |_| st.borrow().cr as u64);
        let st = Rc::clone(&state);
        cr.on_write(move |_, val| {
            let mut st = st.borrow_mut();
            st.cr = val as u32 & CR_ENABLE;
            if st.cr & CR_ENABLE == 0 {
                st.offset = 0;
            }
            st.arm();
            st.update();
        });
        peripheral.add_register(cr).expect("register map is fixed");

        let mut imsc = Register::new("imsc", REG_IMSC, 4, 0);
        imsc.sync_always();
        let st = Rc::clone(&state);
        imsc.on_read(move |_| st.borrow().imsc as u64);
        let st = Rc::clone(&state);
        imsc.on_write(move |_, val| {
            let mut st = st.borrow_mut();
            st.imsc = (val != 0) as u32;
            st.update();
        });
        peripheral.add_register(imsc).expect("register map is fixed");

        let mut ris = Register::new("ris", REG_RIS, 4, 0);
        ris.set_access(Access::Read);
        ris.sync_always();
        let st = Rc::clone(&state);
        ris.on_read(move |_| {
            let mut st = st.borrow_mut();
            st.update();
            st.ris as u64
        });
        peripheral.add_register(ris).expect("register map is fixed");

        let mut mis = Register::new("mis", REG_MIS, 4, 0);
        mis.set_access(Access::Read);
        mis.sync_always();
        let st = Rc::clone(&state);
        mis.on_read(move |_| {
            let mut st = st.borrow_mut();
            st.update();
            (st.ris & st.imsc) as u64
        });
        peripheral.add_register(mis).expect("register map is fixed");

        let mut icr = Register::new("icr", REG_ICR, 4, 0);
        icr.set_access(Access::Write);
        icr.sync_always();
        let st = Rc::clone(&state);
        icr.on_write(move |_, val| {
            let mut st = st.borrow_mut();
            if val & 1 != 0 {
                st.ris = 0;
            }
            st.update();
        });
        peripheral.add_register(icr).expect("register map is fixed");

        let pid_cells: Vec<u64> = (0..4).map(|i| ((AMBA_PID >> (i * 8)) & 0xff) as u64).collect();
        let mut pid = Register::array_with_init("pid", REG_PID, 4, &pid_cells);
        pid.set_access(Access::Read);
        peripheral.add_register(pid).expect("register map is fixed");

        let cid_cells: Vec<u64> = (0..4).map(|i| ((AMBA_CID >> (i * 8)) & 0xff) as u64).collect();
        let mut cid = Register::array_with_init("cid", REG_CID, 4, &cid_cells);
        cid.set_access(Access::Read);
        peripheral.add_register(cid).expect("register map is fixed");

        Rtc {
            peripheral,
            state,
            irq,
        }
    }

    /// The device's interrupt line; clone it into whatever samples it.
    pub fn irq(&self) -> IrqLine {
        self.irq.clone()
    }

    pub fn reset(&mut self) {
        self.peripheral.reset();
        let mut st = self.state.borrow_mut();
        st.offset = st.epoch;
        st.lr = 0;
        st.mr = 0;
        st.cr = CR_ENABLE;
        st.imsc = 0;
        st.ris = 0;
        st.match_at = None;
        st.update();
    }
}

impl PeripheralDevice for Rtc {
    fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    fn peripheral_mut(&mut self) -> &mut Peripheral {
        &mut self.peripheral
    }
}

impl TlmDevice for Rtc {
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
