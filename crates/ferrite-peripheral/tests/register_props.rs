use ferrite_peripheral::Register;
use ferrite_tlm::{Response, Transaction};
use proptest::prelude::*;

proptest! {
    /// With natural accesses enforced on a 4-byte cell, every access whose
    /// size is not exactly the cell size fails with a burst error, and
    /// every misaligned cell-sized access does too.
    #[test]
    fn natural_access_violations_are_burst_errors(
        size in 1usize..16,
        misalign in 0u64..4,
    ) {
        let mut reg = Register::new("r", 0x0, 4, 0);
        reg.natural_accesses_only(true);

        let mut tx = Transaction::read(misalign, size.min(16 - misalign as usize));
        let n = reg.receive(&mut tx, false, 0);

        if tx.size() == 4 && misalign == 0 {
            prop_assert_eq!(tx.response, Response::Ok);
            prop_assert_eq!(n, 4);
        } else {
            prop_assert_eq!(tx.response, Response::BurstError);
            prop_assert_eq!(n, 0);
        }
    }

    /// After writes into arbitrary banks, reset restores the initial value
    /// into bank 0 and every bank that materialized.
    #[test]
    fn reset_restores_initials_in_every_bank(
        banks in prop::collection::vec(0u64..8, 1..12),
        values in prop::collection::vec(any::<u32>(), 1..12),
    ) {
        let mut reg = Register::new("r", 0x0, 4, 0x1234_5678);
        reg.set_banked(true);

        for (bank, value) in banks.iter().zip(values.iter()) {
            let mut tx = Transaction::write(0x0, &value.to_ne_bytes());
            reg.receive(&mut tx, false, *bank);
        }

        reg.reset();

        prop_assert_eq!(reg.value(), 0x1234_5678);
        for bank in banks {
            prop_assert_eq!(reg.bank_value(bank, 0), 0x1234_5678);
        }
        for bank in reg.materialized_banks().collect::<Vec<_>>() {
            prop_assert_eq!(reg.bank_value(bank, 0), 0x1234_5678);
        }
    }

    /// The plain storage path round-trips any value at any cell of an
    /// array register.
    #[test]
    fn array_cells_round_trip(idx in 0usize..8, value: u32) {
        let mut reg = Register::array("r", 0x100, 4, 8, 0);

        let addr = 0x100 + (idx * 4) as u64;
        let mut tx = Transaction::write(addr, &value.to_ne_bytes());
        prop_assert_eq!(reg.receive(&mut tx, false, 0), 4);

        let mut tx = Transaction::read(addr, 4);
        prop_assert_eq!(reg.receive(&mut tx, false, 0), 4);
        prop_assert_eq!(u32::from_ne_bytes(tx.data[..].try_into().unwrap()), value);
        prop_assert_eq!(reg.bank_value(0, idx), value as u64);
    }
}
