use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, BitXorAssign};

bitflags::bitflags! {
    /// Out-of-band flags attached to a transaction.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct SbiFlags: u32 {
        /// Debugger access: synchronous, free of simulated time.
        const DEBUG = 1 << 0;
        /// Never serve this access through a direct-memory pointer.
        const NODMI = 1 << 1;
        /// Force a quantum flush around the access.
        const SYNC = 1 << 2;
        /// Instruction fetch (as opposed to a data access).
        const INSN = 1 << 3;
        /// Exclusive access (load-linked / store-conditional).
        const EXCL = 1 << 4;
        /// Locked (atomic read-modify-write) access.
        const LOCK = 1 << 5;
        /// Secure-world access.
        const SECURE = 1 << 6;
    }
}

/// Sideband information: who initiated a transaction, at what privilege,
/// and with which special semantics. A pure value; composition is bitwise
/// across the flags *and* the numeric fields, so ORing an initiator's
/// default sideband with per-call extras behaves like field-wise union.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Sideband {
    pub flags: SbiFlags,
    pub cpuid: u64,
    pub privilege: u64,
    pub asid: u64,
}

impl Sideband {
    pub const NONE: Sideband = Sideband::from_flags(SbiFlags::empty());
    pub const DEBUG: Sideband = Sideband::from_flags(SbiFlags::DEBUG);
    pub const NODMI: Sideband = Sideband::from_flags(SbiFlags::NODMI);
    pub const SYNC: Sideband = Sideband::from_flags(SbiFlags::SYNC);
    pub const INSN: Sideband = Sideband::from_flags(SbiFlags::INSN);
    pub const EXCL: Sideband = Sideband::from_flags(SbiFlags::EXCL);
    pub const LOCK: Sideband = Sideband::from_flags(SbiFlags::LOCK);
    pub const SECURE: Sideband = Sideband::from_flags(SbiFlags::SECURE);

    pub const fn from_flags(flags: SbiFlags) -> Sideband {
        Sideband {
            flags,
            cpuid: 0,
            privilege: 0,
            asid: 0,
        }
    }

    pub const fn with_cpuid(cpuid: u64) -> Sideband {
        Sideband {
            flags: SbiFlags::empty(),
            cpuid,
            privilege: 0,
            asid: 0,
        }
    }

    pub const fn with_privilege(privilege: u64) -> Sideband {
        Sideband {
            flags: SbiFlags::empty(),
            cpuid: 0,
            privilege,
            asid: 0,
        }
    }

    pub const fn with_asid(asid: u64) -> Sideband {
        Sideband {
            flags: SbiFlags::empty(),
            cpuid: 0,
            privilege: 0,
            asid,
        }
    }

    pub fn is_debug(&self) -> bool {
        self.flags.contains(SbiFlags::DEBUG)
    }

    pub fn is_nodmi(&self) -> bool {
        self.flags.contains(SbiFlags::NODMI)
    }

    pub fn is_sync(&self) -> bool {
        self.flags.contains(SbiFlags::SYNC)
    }

    pub fn is_insn(&self) -> bool {
        self.flags.contains(SbiFlags::INSN)
    }

    pub fn is_excl(&self) -> bool {
        self.flags.contains(SbiFlags::EXCL)
    }

    pub fn is_lock(&self) -> bool {
        self.flags.contains(SbiFlags::LOCK)
    }

    pub fn is_secure(&self) -> bool {
        self.flags.contains(SbiFlags::SECURE)
    }

    pub fn set_excl(&mut self, excl: bool) {
        self.flags.set(SbiFlags::EXCL, excl);
    }
}

impl BitAnd for Sideband {
    type Output = Sideband;

    fn bitand(self, rhs: Sideband) -> Sideband {
        Sideband {
            flags: self.flags & rhs.flags,
            cpuid: self.cpuid & rhs.cpuid,
            privilege: self.privilege & rhs.privilege,
            asid: self.asid & rhs.asid,
        }
    }
}

impl BitOr for Sideband {
    type Output = Sideband;

    fn bitor(self, rhs: Sideband) -> Sideband {
        Sideband {
            flags: self.flags | rhs.flags,
            cpuid: self.cpuid | rhs.cpuid,
            privilege: self.privilege | rhs.privilege,
            asid: self.asid | rhs.asid,
        }
    }
}

impl BitXor for Sideband {
    type Output = Sideband;

    fn bitxor(self, rhs: Sideband) -> Sideband {
        Sideband {
            flags: self.flags ^ rhs.flags,
            cpuid: self.cpuid ^ rhs.cpuid,
            privilege: self.privilege ^ rhs.privilege,
            asid: self.asid ^ rhs.asid,
        }
    }
}

impl BitAndAssign for Sideband {
    fn bitand_assign(&mut self, rhs: Sideband) {
        *self = *self & rhs;
    }
}

impl BitOrAssign for Sideband {
    fn bitor_assign(&mut self, rhs: Sideband) {
        *self = *self | rhs;
    }
}

impl BitXorAssign for Sideband {
    fn bitxor_assign(&mut self, rhs: Sideband) {
        *self = *self ^ rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composition_is_field_wise() {
        let a = Sideband::DEBUG | Sideband::with_cpuid(0b1010);
        let b = Sideband::EXCL | Sideband::with_cpuid(0b0110);

        let or = a | b;
        assert!(or.is_debug() && or.is_excl());
        assert_eq!(or.cpuid, 0b1110);

        let and = a & b;
        assert!(!and.is_debug() && !and.is_excl());
        assert_eq!(and.cpuid, 0b0010);

        let xor = a ^ b;
        assert!(xor.is_debug() && xor.is_excl());
        assert_eq!(xor.cpuid, 0b1100);
    }

    #[test]
    fn defaults_are_all_clear() {
        let sbi = Sideband::default();
        assert_eq!(sbi, Sideband::NONE);
        assert!(!sbi.is_debug() && !sbi.is_secure());
        assert_eq!((sbi.cpuid, sbi.privilege, sbi.asid), (0, 0, 0));
    }
}
