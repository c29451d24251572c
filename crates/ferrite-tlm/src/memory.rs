use std::alloc::{alloc_zeroed, dealloc, Layout};

use ferrite_types::{Access, AddrRange, SimTime};

use crate::dmi::DmiDescriptor;
use crate::transaction::{Response, Transaction};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MemoryError {
    #[error("host memory must not be empty")]
    ZeroSize,
    #[error("host memory allocation of {0} bytes failed")]
    AllocationFailed(usize),
}

/// Page alignment keeps DMI windows friendly to host-side tooling.
const HOST_MEMORY_ALIGN: usize = 4096;

/// A host-side memory arena serving as the backing store of a memory-mapped
/// region and as the provider of DMI pointers into it.
///
/// The allocation's address is stable for the lifetime of the object, which
/// is the invariant every DMI descriptor handed out by [`HostMemory::dmi`]
/// relies on. Invalidation of those descriptors is the owner's duty when it
/// drops or re-creates the arena.
#[derive(Debug)]
pub struct HostMemory {
    ptr: *mut u8,
    size: usize,
    access: Access,
    read_latency: SimTime,
    write_latency: SimTime,
    discard_writes: bool,
}

// SAFETY: the arena is a plain allocation; all simulation-side access is
// single-threaded and the owner controls when the object moves threads.
unsafe impl Send for HostMemory {}

impl HostMemory {
    pub fn new(size: usize) -> Result<HostMemory, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSize);
        }
        let layout = Layout::from_size_align(size, HOST_MEMORY_ALIGN)
            .map_err(|_| MemoryError::AllocationFailed(size))?;
        // SAFETY: layout has non-zero size, checked above.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(MemoryError::AllocationFailed(size));
        }
        Ok(HostMemory {
            ptr,
            size,
            access: Access::ReadWrite,
            read_latency: SimTime::ZERO,
            write_latency: SimTime::ZERO,
            discard_writes: false,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn set_access(&mut self, access: Access) {
        self.access = access;
    }

    pub fn set_latencies(&mut self, read: SimTime, write: SimTime) {
        self.read_latency = read;
        self.write_latency = write;
    }

    /// Accept and drop writes instead of failing them (write-ignore mode).
    pub fn discard_writes(&mut self, discard: bool) {
        self.discard_writes = discard;
    }

    /// Raw base pointer of the arena, for DMI descriptor construction.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: we own the allocation; see the type-level invariant.
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, with exclusive access through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    pub fn fill(&mut self, value: u8) {
        self.as_mut_slice().fill(value);
    }

    /// DMI window describing this arena mapped at bus address `base`,
    /// carrying the arena's access rights and latencies.
    pub fn dmi(&self, base: u64) -> DmiDescriptor {
        DmiDescriptor::new(
            self.ptr,
            AddrRange::with_size(base, self.size as u64),
            self.access,
        )
        .with_latencies(self.read_latency, self.write_latency)
    }

    /// Read `addr` (relative to the arena base) into `dst`. Debug accesses
    /// ignore access rights.
    pub fn read(&self, addr: AddrRange, dst: &mut [u8], debug: bool) -> Response {
        if addr.end >= self.size as u64 {
            return Response::AddressError;
        }
        if !debug && !self.access.allows_read() {
            return Response::CommandError;
        }
        let start = addr.start as usize;
        dst.copy_from_slice(&self.as_slice()[start..start + addr.length() as usize]);
        Response::Ok
    }

    /// Write `src` to `addr` (relative to the arena base).
    pub fn write(&mut self, addr: AddrRange, src: &[u8], debug: bool) -> Response {
        if addr.end >= self.size as u64 {
            return Response::AddressError;
        }
        if !debug {
            if self.discard_writes {
                return Response::Ok;
            }
            if !self.access.allows_write() {
                return Response::CommandError;
            }
        }
        let start = addr.start as usize;
        self.as_mut_slice()[start..start + addr.length() as usize].copy_from_slice(src);
        Response::Ok
    }

    /// Serve a whole transaction against the arena (address taken relative
    /// to the arena base).
    pub fn transport(&mut self, tx: &mut Transaction, debug: bool) -> usize {
        let addr = tx.range();
        let response = match tx.command {
            crate::transaction::Command::Read => {
                let mut buf = std::mem::take(&mut tx.data);
                let r = self.read(addr, &mut buf, debug);
                tx.data = buf;
                r
            }
            crate::transaction::Command::Write => self.write(addr, &tx.data, debug),
            crate::transaction::Command::Ignore => Response::Ok,
        };
        tx.response = response;
        if response.is_ok() {
            tx.data.len()
        } else {
            0
        }
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: ptr/layout are exactly what new() allocated.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.size, HOST_MEMORY_ALIGN);
            dealloc(self.ptr, layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_zeroed_and_round_trips() {
        let mut mem = HostMemory::new(256).unwrap();
        let mut buf = [0xaa; 4];
        assert_eq!(mem.read(AddrRange::new(0, 3), &mut buf, false), Response::Ok);
        assert_eq!(buf, [0; 4]);

        assert_eq!(
            mem.write(AddrRange::new(0x10, 0x13), &[1, 2, 3, 4], false),
            Response::Ok
        );
        mem.read(AddrRange::new(0x10, 0x13), &mut buf, false);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn out_of_bounds_is_an_address_error() {
        let mut mem = HostMemory::new(16).unwrap();
        let mut buf = [0; 4];
        assert_eq!(
            mem.read(AddrRange::new(14, 17), &mut buf, false),
            Response::AddressError
        );
        assert_eq!(
            mem.write(AddrRange::new(16, 19), &buf, false),
            Response::AddressError
        );
    }

    #[test]
    fn read_only_rejects_writes_except_debug() {
        let mut mem = HostMemory::new(16).unwrap();
        mem.set_access(Access::Read);
        assert_eq!(
            mem.write(AddrRange::new(0, 0), &[1], false),
            Response::CommandError
        );
        assert_eq!(mem.write(AddrRange::new(0, 0), &[1], true), Response::Ok);
        assert_eq!(mem.as_slice()[0], 1);
    }

    #[test]
    fn discarded_writes_succeed_without_effect() {
        let mut mem = HostMemory::new(16).unwrap();
        mem.discard_writes(true);
        assert_eq!(mem.write(AddrRange::new(0, 0), &[7], false), Response::Ok);
        assert_eq!(mem.as_slice()[0], 0);
    }

    #[test]
    fn dmi_window_tracks_base_and_rights() {
        let mut mem = HostMemory::new(0x1000).unwrap();
        mem.set_latencies(SimTime::from_ns(1), SimTime::from_ns(2));
        let dmi = mem.dmi(0x8000_0000);
        assert_eq!(dmi.range(), AddrRange::new(0x8000_0000, 0x8000_0fff));
        assert_eq!(dmi.read_latency(), SimTime::from_ns(1));
        assert_eq!(dmi.ptr(), mem.as_slice().as_ptr() as *mut u8);
    }

    #[test]
    fn zero_size_is_rejected() {
        assert_eq!(HostMemory::new(0).unwrap_err(), MemoryError::ZeroSize);
    }
}
