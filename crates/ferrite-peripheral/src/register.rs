use ferrite_types::{Access, AddrRange, AddressSpace};
use ferrite_tlm::{Response, Transaction};

/// Mutable view of the register cells a callback runs against (the current
/// bank). Callbacks use it to read or update their own backing storage.
pub struct RegCells<'a> {
    cells: &'a mut [u64],
}

impl RegCells<'_> {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, idx: usize) -> u64 {
        self.cells[idx]
    }

    pub fn set(&mut self, idx: usize, val: u64) {
        self.cells[idx] = val;
    }
}

pub type ReadFn = Box<dyn FnMut(&mut RegCells<'_>) -> u64>;
pub type TaggedReadFn = Box<dyn FnMut(&mut RegCells<'_>, usize) -> u64>;
pub type WriteFn = Box<dyn FnMut(&mut RegCells<'_>, u64)>;
pub type TaggedWriteFn = Box<dyn FnMut(&mut RegCells<'_>, u64, usize)>;

/// A memory-mapped register: an address window of `cell_count` cells of
/// `cell_size` bytes each, with access control, optional read/write
/// callbacks and per-initiator banking.
///
/// Cell values are held as `u64` regardless of the cell size; only the low
/// `cell_size` bytes are meaningful on the bus.
pub struct Register {
    name: String,
    space: AddressSpace,
    range: AddrRange,
    cell_size: usize,
    cell_count: usize,
    access: Access,
    aligned_only: bool,
    rsync: bool,
    wsync: bool,
    wback: bool,
    secure_only: bool,
    privilege: u64,
    min_size: usize,
    max_size: usize,
    banked: bool,
    tag: usize,
    init: Vec<u64>,
    values: Vec<u64>,
    banks: Vec<(u64, Vec<u64>)>,
    read: Option<ReadFn>,
    read_tagged: Option<TaggedReadFn>,
    write: Option<WriteFn>,
    write_tagged: Option<TaggedWriteFn>,
}

impl Register {
    /// Single-cell register of `cell_size` bytes at `addr`.
    pub fn new(name: impl Into<String>, addr: u64, cell_size: usize, init: u64) -> Register {
        Register::array(name, addr, cell_size, 1, init)
    }

    /// Array register: `cell_count` contiguous cells sharing one window.
    pub fn array(
        name: impl Into<String>,
        addr: u64,
        cell_size: usize,
        cell_count: usize,
        init: u64,
    ) -> Register {
        assert!(
            matches!(cell_size, 1 | 2 | 4 | 8),
            "unsupported cell size: {cell_size}"
        );
        assert!(cell_count > 0);
        let init = vec![init; cell_count];
        Register {
            name: name.into(),
            space: AddressSpace::DEFAULT,
            range: AddrRange::with_size(addr, (cell_size * cell_count) as u64),
            cell_size,
            cell_count,
            access: Access::ReadWrite,
            aligned_only: false,
            rsync: false,
            wsync: false,
            wback: false,
            secure_only: false,
            privilege: 0,
            min_size: 0,
            max_size: usize::MAX,
            banked: false,
            tag: 0,
            values: init.clone(),
            init,
            banks: Vec::new(),
            read: None,
            read_tagged: None,
            write: None,
            write_tagged: None,
        }
    }

    /// Array register with one initial value per cell.
    pub fn array_with_init(
        name: impl Into<String>,
        addr: u64,
        cell_size: usize,
        init: &[u64],
    ) -> Register {
        let mut reg = Register::array(name, addr, cell_size, init.len(), 0);
        reg.init.copy_from_slice(init);
        reg.values.copy_from_slice(init);
        reg
    }

    pub fn with_space(mut self, space: AddressSpace) -> Register {
        self.space = space;
        self
    }

    // -- geometry -----------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }

    pub fn range(&self) -> AddrRange {
        self.range
    }

    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    pub fn is_array(&self) -> bool {
        self.cell_count > 1
    }

    // -- configuration ------------------------------------------------------

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn set_access(&mut self, access: Access) {
        self.access = access;
    }

    pub fn aligned_accesses_only(&mut self, only: bool) {
        self.aligned_only = only;
    }

    /// Restrict the register to accesses of exactly one cell, naturally
    /// aligned.
    pub fn natural_accesses_only(&mut self, only: bool) {
        self.aligned_only = only;
        self.min_size = if only { self.cell_size } else { 0 };
        self.max_size = if only { self.cell_size } else { usize::MAX };
    }

    pub fn is_natural_accesses_only(&self) -> bool {
        self.aligned_only && self.min_size == self.cell_size && self.max_size == self.cell_size
    }

    pub fn set_access_size(&mut self, min: usize, max: usize) {
        self.min_size = min;
        self.max_size = max;
    }

    pub fn sync_on_read(&mut self, sync: bool) {
        self.rsync = sync;
    }

    pub fn sync_on_write(&mut self, sync: bool) {
        self.wsync = sync;
    }

    pub fn sync_always(&mut self) {
        self.rsync = true;
        self.wsync = true;
    }

    pub fn needs_read_sync(&self) -> bool {
        self.rsync
    }

    pub fn needs_write_sync(&self) -> bool {
        self.wsync
    }

    /// Store the value produced by a read callback back into the bank
    /// (side-effecting reads).
    pub fn writeback(&mut self, wb: bool) {
        self.wback = wb;
    }

    pub fn set_secure_only(&mut self, secure: bool) {
        self.secure_only = secure;
    }

    pub fn set_privilege(&mut self, level: u64) {
        self.privilege = level;
    }

    pub fn set_banked(&mut self, banked: bool) {
        self.banked = banked;
    }

    pub fn is_banked(&self) -> bool {
        self.banked
    }

    /// Tag handed to tagged callbacks of single-cell registers.
    pub fn set_tag(&mut self, tag: usize) {
        self.tag = tag;
    }

    // -- callbacks ----------------------------------------------------------

    pub fn on_read(&mut self, cb: impl FnMut(&mut RegCells<'_>) -> u64 + 'static) {
        assert!(
            self.read.is_none() && self.read_tagged.is_none(),
            "register '{}' already has a read callback",
            self.name
        );
        self.read = Some(Box::new(cb));
    }

    pub fn on_read_tagged(&mut self, cb: impl FnMut(&mut RegCells<'_>, usize) -> u64 + 'static) {
        assert!(
            self.read.is_none() && self.read_tagged.is_none(),
            "register '{}' already has a read callback",
            self.name
        );
        self.read_tagged = Some(Box::new(cb));
    }

    pub fn on_write(&mut self, cb: impl FnMut(&mut RegCells<'_>, u64) + 'static) {
        assert!(
            self.write.is_none() && self.write_tagged.is_none(),
            "register '{}' already has a write callback",
            self.name
        );
        self.write = Some(Box::new(cb));
    }

    pub fn on_write_tagged(&mut self, cb: impl FnMut(&mut RegCells<'_>, u64, usize) + 'static) {
        assert!(
            self.write.is_none() && self.write_tagged.is_none(),
            "register '{}' already has a write callback",
            self.name
        );
        self.write_tagged = Some(Box::new(cb));
    }

    /// Reads always return zero, whatever the storage holds.
    pub fn read_zero(&mut self) {
        self.on_read(|_| 0);
    }

    /// Writes are accepted and dropped.
    pub fn ignore_write(&mut self) {
        self.on_write(|_, _| {});
    }

    /// Only bits set in `mask` are writable; the rest keep their value.
    pub fn on_write_mask(&mut self, mask: u64) {
        self.on_write(move |cells, val| {
            let old = cells.get(0);
            cells.set(0, (old & !mask) | (val & mask));
        });
    }

    // -- storage ------------------------------------------------------------

    /// Value of cell `idx` in `bank`; an unmaterialized bank reads as the
    /// initial value.
    pub fn bank_value(&self, bank: u64, idx: usize) -> u64 {
        assert!(idx < self.cell_count, "index {idx} out of bounds");
        if !self.banked || bank == 0 {
            return self.values[idx];
        }
        self.banks
            .iter()
            .find(|(b, _)| *b == bank)
            .map(|(_, v)| v[idx])
            .unwrap_or(self.init[idx])
    }

    pub fn set_bank_value(&mut self, bank: u64, idx: usize, val: u64) {
        assert!(idx < self.cell_count, "index {idx} out of bounds");
        self.ensure_bank(bank);
        if !self.banked || bank == 0 {
            self.values[idx] = val;
        } else {
            let slot = self
                .banks
                .iter_mut()
                .find(|(b, _)| *b == bank)
                .map(|(_, v)| v)
                .unwrap();
            slot[idx] = val;
        }
    }

    /// Bank-0 value of the first cell: the common case for scalar
    /// registers.
    pub fn value(&self) -> u64 {
        self.values[0]
    }

    pub fn set_value(&mut self, val: u64) {
        self.values[0] = val;
    }

    pub fn materialized_banks(&self) -> impl Iterator<Item = u64> + '_ {
        self.banks.iter().map(|(b, _)| *b)
    }

    /// Restore the initial values into bank 0 and every materialized bank.
    pub fn reset(&mut self) {
        self.values.copy_from_slice(&self.init);
        for (_, bank) in &mut self.banks {
            bank.copy_from_slice(&self.init);
        }
    }

    fn ensure_bank(&mut self, bank: u64) {
        if !self.banked || bank == 0 {
            return;
        }
        if !self.banks.iter().any(|(b, _)| *b == bank) {
            self.banks.push((bank, self.init.clone()));
        }
    }

    // -- transport ----------------------------------------------------------

    fn check_access(&self, tx: &Transaction) -> Response {
        let size = tx.size();

        let permitted = match tx.command {
            ferrite_tlm::Command::Read => self.access.allows_read(),
            ferrite_tlm::Command::Write => self.access.allows_write(),
            ferrite_tlm::Command::Ignore => false,
        };
        if !permitted {
            return Response::CommandError;
        }
        if self.secure_only && !tx.sideband.is_secure() {
            return Response::CommandError;
        }
        if tx.sideband.privilege < self.privilege {
            return Response::CommandError;
        }
        if size < self.min_size || size > self.max_size {
            return Response::BurstError;
        }
        if self.aligned_only && tx.address % size as u64 != 0 {
            return Response::BurstError;
        }
        Response::Ok
    }

    /// Serve the part of `tx` that falls into this register's window.
    /// Returns the number of bytes serviced; on rejection the response is
    /// set and 0 is returned. Debug accesses go through the same access
    /// checks but skip the writeback side effect.
    pub fn receive(&mut self, tx: &mut Transaction, debug: bool, bank: u64) -> usize {
        let span = match tx.range().intersect(self.range) {
            Some(span) => span,
            None => {
                tx.response = Response::AddressError;
                return 0;
            }
        };

        let check = self.check_access(tx);
        if check != Response::Ok {
            tx.response = check;
            return 0;
        }

        let buf_off = (span.start - tx.address) as usize;
        let len = span.length() as usize;
        let rel = AddrRange::new(span.start - self.range.start, span.end - self.range.start);

        if tx.is_read() {
            let mut data = std::mem::take(&mut tx.data);
            self.do_read(rel, &mut data[buf_off..buf_off + len], debug, bank);
            tx.data = data;
        } else {
            let data = std::mem::take(&mut tx.data);
            let enabled: Vec<bool> = (buf_off..buf_off + len)
                .map(|i| tx.byte_enabled(i))
                .collect();
            self.do_write(rel, &data[buf_off..buf_off + len], &enabled, bank);
            tx.data = data;
        }

        tx.response = Response::Ok;
        len
    }

    fn do_read(&mut self, rel: AddrRange, dst: &mut [u8], debug: bool, bank: u64) {
        self.ensure_bank(bank);
        let cell = self.cell_size;
        let count = self.cell_count;
        let tag = self.tag;
        let wback = self.wback;

        let Register {
            values,
            banks,
            banked,
            read,
            read_tagged,
            ..
        } = self;
        let cells = select_bank(values, banks, *banked, bank);
        let mut view = RegCells { cells };

        let mut pos = rel.start;
        let mut di = 0usize;
        while pos <= rel.end {
            let idx = (pos as usize) / cell;
            let off = (pos as usize) % cell;
            let n = ((rel.end - pos + 1) as usize).min(cell - off);

            let val = if let Some(cb) = read_tagged {
                cb(&mut view, if count > 1 { idx } else { tag })
            } else if let Some(cb) = read {
                cb(&mut view)
            } else {
                view.get(idx)
            };

            if wback && !debug {
                view.set(idx, val);
            }

            let bytes = cell_to_bytes(val, cell);
            dst[di..di + n].copy_from_slice(&bytes[off..off + n]);

            pos += n as u64;
            di += n;
        }
    }

    fn do_write(&mut self, rel: AddrRange, src: &[u8], enabled: &[bool], bank: u64) {
        self.ensure_bank(bank);
        let cell = self.cell_size;
        let count = self.cell_count;
        let tag = self.tag;

        let Register {
            values,
            banks,
            banked,
            write,
            write_tagged,
            ..
        } = self;
        let cells = select_bank(values, banks, *banked, bank);
        let mut view = RegCells { cells };

        let mut pos = rel.start;
        let mut si = 0usize;
        while pos <= rel.end {
            let idx = (pos as usize) / cell;
            let off = (pos as usize) % cell;
            let n = ((rel.end - pos + 1) as usize).min(cell - off);

            // Overlay the transaction's (enabled) bytes onto the current
            // cell value at the right byte offset.
            let mut bytes = cell_to_bytes(view.get(idx), cell);
            for i in 0..n {
                if enabled[si + i] {
                    bytes[off + i] = src[si + i];
                }
            }
            let val = bytes_to_cell(&bytes, cell);

            if let Some(cb) = write_tagged {
                cb(&mut view, val, if count > 1 { idx } else { tag });
            } else if let Some(cb) = write {
                cb(&mut view, val);
            } else {
                view.set(idx, val);
            }

            pos += n as u64;
            si += n;
        }
    }
}

fn select_bank<'a>(
    values: &'a mut Vec<u64>,
    banks: &'a mut Vec<(u64, Vec<u64>)>,
    banked: bool,
    bank: u64,
) -> &'a mut [u64] {
    if !banked || bank == 0 {
        values
    } else {
        // ensure_bank materialized the slot before the split borrow.
        &mut banks.iter_mut().find(|(b, _)| *b == bank).unwrap().1
    }
}

/// Native-order byte image of a cell value; positions `0..cell` hold the
/// bytes as they appear on the bus.
fn cell_to_bytes(val: u64, cell: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    match cell {
        1 => out[0] = val as u8,
        2 => out[..2].copy_from_slice(&(val as u16).to_ne_bytes()),
        4 => out[..4].copy_from_slice(&(val as u32).to_ne_bytes()),
        8 => out.copy_from_slice(&val.to_ne_bytes()),
        _ => unreachable!("cell size checked at construction"),
    }
    out
}

fn bytes_to_cell(bytes: &[u8; 8], cell: usize) -> u64 {
    match cell {
        1 => bytes[0] as u64,
        2 => u16::from_ne_bytes(bytes[..2].try_into().expect("sized slice")) as u64,
        4 => u32::from_ne_bytes(bytes[..4].try_into().expect("sized slice")) as u64,
        8 => u64::from_ne_bytes(*bytes),
        _ => unreachable!("cell size checked at construction"),
    }
}
