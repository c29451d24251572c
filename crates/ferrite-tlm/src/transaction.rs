use ferrite_types::{Access, AddrRange};

use crate::sideband::Sideband;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Command {
    Read,
    Write,
    /// Probe transaction: carries no data transfer (used for DMI requests).
    Ignore,
}

impl Command {
    pub fn access(self) -> Access {
        match self {
            Command::Read => Access::Read,
            Command::Write => Access::Write,
            Command::Ignore => Access::None,
        }
    }
}

/// Transaction response taxonomy. Errors travel in this field, never by
/// unwinding; any status other than `Ok` is recoverable by the initiator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Response {
    /// No target has touched the transaction yet. Returning this from a
    /// non-debug transport call is a programming error.
    #[default]
    Incomplete,
    Ok,
    /// Address outside any mapping or register range.
    AddressError,
    /// Command not permitted (read-only/write-only register, privilege or
    /// security failure).
    CommandError,
    /// Size, streaming-width or alignment violation.
    BurstError,
    /// Byte-enable array present but empty.
    ByteEnableError,
    /// Peripheral-specific failure.
    GenericError,
}

impl Response {
    pub fn is_ok(self) -> bool {
        self == Response::Ok
    }

    pub fn is_error(self) -> bool {
        !matches!(self, Response::Ok | Response::Incomplete)
    }
}

/// The unit of transport: a memory transaction moving `data` to or from
/// `address`, plus routing metadata and the sideband.
#[derive(Clone, Debug)]
pub struct Transaction {
    pub command: Command,
    pub address: u64,
    pub data: Vec<u8>,
    /// TLM-style byte enables: byte `i` of the payload is enabled iff
    /// `byte_enable[i % len]` is non-zero. `None` enables all bytes; an
    /// empty array is malformed and rejected at the socket.
    pub byte_enable: Option<Vec<u8>>,
    /// Beat size the payload is divided into for the target's purposes.
    /// The payload length must be a multiple of it.
    pub streaming_width: usize,
    pub response: Response,
    /// Set by the target to advertise that a subsequent DMI request for
    /// this address would be granted.
    pub dmi_allowed: bool,
    pub sideband: Sideband,
}

impl Transaction {
    pub fn read(address: u64, len: usize) -> Transaction {
        Transaction {
            command: Command::Read,
            address,
            data: vec![0; len],
            byte_enable: None,
            streaming_width: len,
            response: Response::Incomplete,
            dmi_allowed: false,
            sideband: Sideband::NONE,
        }
    }

    pub fn write(address: u64, data: &[u8]) -> Transaction {
        Transaction {
            command: Command::Write,
            address,
            data: data.to_vec(),
            byte_enable: None,
            streaming_width: data.len(),
            response: Response::Incomplete,
            dmi_allowed: false,
            sideband: Sideband::NONE,
        }
    }

    /// Data-less probe at `address` covering `len` bytes.
    pub fn probe(address: u64, len: usize) -> Transaction {
        let mut tx = Transaction::read(address, len);
        tx.command = Command::Ignore;
        tx
    }

    pub fn is_read(&self) -> bool {
        self.command == Command::Read
    }

    pub fn is_write(&self) -> bool {
        self.command == Command::Write
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Address window covered by the payload.
    pub fn range(&self) -> AddrRange {
        AddrRange::with_size(self.address, self.data.len().max(1) as u64)
    }

    pub fn byte_enabled(&self, idx: usize) -> bool {
        match &self.byte_enable {
            None => true,
            Some(be) if be.is_empty() => false,
            Some(be) => be[idx % be.len()] != 0,
        }
    }

    /// Clear per-hop state so the transaction can be sent (again).
    pub fn reset(&mut self) {
        self.response = Response::Incomplete;
        self.dmi_allowed = false;
    }
}
