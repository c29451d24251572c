//! The bus bridge: routes a transaction arriving on an input port to the
//! output port whose address mapping contains it, translating the address
//! on the way down and restoring it on the way back. DMI windows crossing
//! the bridge are narrowed to the mapping and relabeled into the
//! initiator's coordinates; invalidations travel the opposite direction.

use std::cell::RefCell;
use std::rc::Rc;

use ferrite_tlm::{
    BusWidthAdapter, DmiDescriptor, InvalidateHook, Response, TargetPort, TlmDevice, Transaction,
};
use ferrite_types::{AddrRange, SimTime};
use tracing::{debug, trace};

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("mapping {range} for port {port} overlaps existing mapping {existing}")]
    MappingOverlap {
        range: AddrRange,
        existing: AddrRange,
        port: usize,
    },
    #[error("bus already has a default mapping")]
    DefaultExists,
}

/// One routing entry: transactions inside `range` go to output `port`,
/// with `range.start` relabeled to `offset`.
#[derive(Clone, Debug)]
pub struct BusMapping {
    pub port: usize,
    pub range: AddrRange,
    pub offset: u64,
    /// Name of the bound peer, for map dumps and diagnostics.
    pub peer: String,
}

#[derive(Clone, Debug)]
struct DefaultMapping {
    port: usize,
    offset: u64,
    peer: String,
}

type HookList = Rc<RefCell<Vec<InvalidateHook>>>;

/// Memory-mapped bus bridge.
///
/// Input ports face initiators (the bus is the target they bind to, with
/// the input port index as the socket id); output ports face downstream
/// targets, wrapped in a width adapter when the word widths differ.
/// Mappings are fixed once the platform starts transacting.
pub struct Bus {
    name: String,
    width: usize,
    in_hooks: Rc<RefCell<Vec<HookList>>>,
    out_ports: Vec<TargetPort>,
    /// Unadapted endpoints, for port reuse when one target gets several
    /// mappings.
    out_endpoints: Vec<TargetPort>,
    mappings: Rc<RefCell<Vec<BusMapping>>>,
    default_map: Rc<RefCell<Option<DefaultMapping>>>,
}

impl Bus {
    pub fn new(name: impl Into<String>) -> Bus {
        Bus {
            name: name.into(),
            width: 8,
            in_hooks: Rc::new(RefCell::new(Vec::new())),
            out_ports: Vec::new(),
            out_endpoints: Vec::new(),
            mappings: Rc::new(RefCell::new(Vec::new())),
            default_map: Rc::new(RefCell::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn set_width(&mut self, width: usize) {
        assert!(width > 0);
        self.width = width;
    }

    /// Allocate an input port. Initiators bind to the bus with this index
    /// as the socket id (see [`Bus::in_port`]).
    pub fn bind_in(&mut self) -> usize {
        let mut hooks = self.in_hooks.borrow_mut();
        hooks.push(Rc::new(RefCell::new(Vec::new())));
        hooks.len() - 1
    }

    /// Port handle an initiator socket binds to.
    pub fn in_port(bus: &Rc<RefCell<Bus>>, in_idx: usize) -> TargetPort {
        TargetPort::new(Rc::clone(bus), in_idx)
    }

    /// Bind a downstream target under `range` (translated by `offset`),
    /// inserting a width adapter when the widths differ. Binding the same
    /// endpoint again reuses its output port.
    pub fn bind_out(
        &mut self,
        port: TargetPort,
        range: AddrRange,
        offset: u64,
        peer: impl Into<String>,
    ) -> Result<usize, BusError> {
        let out = self.alloc_out_port(port);
        self.map(out, range, offset, peer)?;
        Ok(out)
    }

    /// Route everything no mapping claims to `port`, translated by
    /// `offset` only.
    pub fn bind_default(
        &mut self,
        port: TargetPort,
        offset: u64,
        peer: impl Into<String>,
    ) -> Result<usize, BusError> {
        if self.default_map.borrow().is_some() {
            return Err(BusError::DefaultExists);
        }
        let out = self.alloc_out_port(port);
        *self.default_map.borrow_mut() = Some(DefaultMapping {
            port: out,
            offset,
            peer: peer.into(),
        });
        Ok(out)
    }

    fn alloc_out_port(&mut self, port: TargetPort) -> usize {
        if let Some(existing) = self
            .out_endpoints
            .iter()
            .position(|p| p.same_endpoint(&port))
        {
            return existing;
        }

        let idx = self.out_ports.len();
        let down_width = port.width();
        let bound = if down_width == self.width {
            port.clone()
        } else {
            let name = format!("{}.bwa{}", self.name, idx);
            debug!(bus = %self.name, idx, bus_width = self.width, down_width,
                   "inserting bus width adapter");
            let adapter = BusWidthAdapter::new(name, self.width, port.clone());
            TargetPort::new(Rc::new(RefCell::new(adapter)), 0)
        };

        // Backward path: translate downstream invalidations through every
        // mapping of this output port and fan them out to all input ports.
        let mappings = Rc::clone(&self.mappings);
        let default_map = Rc::clone(&self.default_map);
        let in_hooks = Rc::clone(&self.in_hooks);
        bound.register_upstream(Box::new(move |down: AddrRange| {
            let fan_out = |up: AddrRange| {
                for input in in_hooks.borrow().iter() {
                    for hook in input.borrow().iter() {
                        hook(up);
                    }
                }
            };

            for m in mappings.borrow().iter().filter(|m| m.port == idx) {
                let down_window = AddrRange::with_size(m.offset, m.range.length());
                if let Some(hit) = down.intersect(down_window) {
                    let up = AddrRange::new(
                        hit.start - m.offset + m.range.start,
                        hit.end - m.offset + m.range.start,
                    );
                    fan_out(up);
                }
            }
            if let Some(d) = default_map.borrow().as_ref() {
                if d.port == idx {
                    if let Some(hit) = down.intersect(AddrRange::new(d.offset, u64::MAX)) {
                        fan_out(AddrRange::new(hit.start - d.offset, hit.end - d.offset));
                    }
                }
            }
        }));

        self.out_ports.push(bound);
        self.out_endpoints.push(port);
        idx
    }

    /// Add a routing entry for an existing output port. Non-default
    /// mappings must not overlap.
    pub fn map(
        &mut self,
        port: usize,
        range: AddrRange,
        offset: u64,
        peer: impl Into<String>,
    ) -> Result<(), BusError> {
        assert!(port < self.out_ports.len(), "bus port {port} does not exist");
        let mut mappings = self.mappings.borrow_mut();
        if let Some(existing) = mappings.iter().find(|m| m.range.overlaps(range)) {
            return Err(BusError::MappingOverlap {
                range,
                existing: existing.range,
                port,
            });
        }
        mappings.push(BusMapping {
            port,
            range,
            offset,
            peer: peer.into(),
        });
        Ok(())
    }

    pub fn mappings(&self) -> Vec<BusMapping> {
        self.mappings.borrow().clone()
    }

    /// First mapping containing `range`, falling back to the default
    /// route. Returns (port, upstream base, downstream base).
    fn lookup(&self, range: AddrRange) -> Option<(usize, u64, u64)> {
        let mappings = self.mappings.borrow();
        if let Some(m) = mappings.iter().find(|m| m.range.includes(range)) {
            return Some((m.port, m.range.start, m.offset));
        }
        drop(mappings);
        self.default_map
            .borrow()
            .as_ref()
            .map(|d| (d.port, 0, d.offset))
    }

    /// Dump of the address map, default route last.
    pub fn map_overview(&self) -> String {
        let mut out = String::new();
        for m in self.mappings.borrow().iter() {
            out.push_str(&format!(
                "{} -> out{} {} +{:#x}\n",
                m.range, m.port, m.peer, m.offset
            ));
        }
        if let Some(d) = self.default_map.borrow().as_ref() {
            out.push_str(&format!("default -> out{} {} +{:#x}\n", d.port, d.peer, d.offset));
        }
        out
    }
}

impl TlmDevice for Bus {
    fn b_transport(&mut self, in_port: usize, tx: &mut Transaction, offset: &mut SimTime) {
        let Some((port, up_base, down_base)) = self.lookup(tx.range()) else {
            tx.response = Response::AddressError;
            return;
        };

        let orig = tx.address;
        tx.address = orig.wrapping_sub(up_base).wrapping_add(down_base);
        trace!(bus = %self.name, in_port, port, "route {orig:#x} -> {:#x}", tx.address);
        self.out_ports[port].b_transport(tx, offset);
        tx.address = orig;
    }

    fn transport_dbg(&mut self, _in_port: usize, tx: &mut Transaction) -> usize {
        let Some((port, up_base, down_base)) = self.lookup(tx.range()) else {
            tx.response = Response::AddressError;
            return 0;
        };

        let orig = tx.address;
        tx.address = orig.wrapping_sub(up_base).wrapping_add(down_base);
        let n = self.out_ports[port].transport_dbg(tx);
        tx.address = orig;
        n
    }

    fn get_direct_mem_ptr(&mut self, _in_port: usize, tx: &Transaction) -> Option<DmiDescriptor> {
        let (port, up_base, down_base) = self.lookup(tx.range())?;

        let mut down_tx = tx.clone();
        down_tx.address = tx.address.wrapping_sub(up_base).wrapping_add(down_base);
        let dmi = self.out_ports[port].get_direct_mem_ptr(&down_tx)?;

        // Clamp the grant to the window this route can actually reach,
        // then relabel it into the initiator's coordinates.
        let down_window = match self
            .mappings
            .borrow()
            .iter()
            .find(|m| m.port == port && m.range.includes(tx.range()))
        {
            Some(m) => AddrRange::with_size(m.offset, m.range.length()),
            None => AddrRange::new(down_base, u64::MAX),
        };
        let hit = dmi.range().intersect(down_window)?;

        let mut narrowed = dmi;
        narrowed.set_start(hit.start);
        narrowed.set_end(hit.end);
        narrowed.shift_range(up_base.wrapping_sub(down_base) as i64);
        Some(narrowed)
    }

    fn register_upstream(&mut self, in_port: usize, hook: InvalidateHook) {
        self.in_hooks.borrow()[in_port].borrow_mut().push(hook);
    }

    fn socket_width(&self, _in_port: usize) -> usize {
        self.width
    }
}
