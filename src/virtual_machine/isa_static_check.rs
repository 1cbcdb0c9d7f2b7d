#[cfg(test)]
mod tests {
    use crate::virtual_machine::opcode::OpCode;

    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    fn fnv1a64(mut h: u64, bytes: &[u8]) -> u64 {
        for b in bytes {
            h ^= *b as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        h
    }

    macro_rules! opcode_rows {
        (
            $( $(#[$doc:meta])* $name:ident = $byte:expr, $mnemonic:literal => [prefix: $prefix:expr, operand: $operand:expr] ),* $(,)?
        ) => {
            &[ $( ($byte as u8, $mnemonic, $prefix as usize, $operand as usize) ),* ]
        };
    }

    fn table() -> &'static [(u8, &'static str, usize, usize)] {
        crate::for_each_opcode!(opcode_rows)
    }

    fn current_isa_hash() -> u64 {
        let mut h = FNV_OFFSET;
        for (byte, mnemonic, prefix, operand) in table() {
            h = fnv1a64(h, &[*byte]);
            h = fnv1a64(h, mnemonic.as_bytes());
            h = fnv1a64(h, &(*prefix as u64).to_le_bytes());
            h = fnv1a64(h, &(*operand as u64).to_le_bytes());
        }
        h
    }

    #[test]
    #[ignore]
    fn print_isa_hash() {
        println!("ISA_HASH=0x{:016x}", current_isa_hash());
    }

    #[test]
    fn opcode_bytes_are_unique() {
        let rows = table();
        for (i, a) in rows.iter().enumerate() {
            for b in &rows[i + 1..] {
                assert_ne!(a.0, b.0, "duplicate opcode byte 0x{:02x}", a.0);
            }
        }
    }

    #[test]
    fn mnemonics_are_unique_and_uppercase() {
        let rows = table();
        for (i, a) in rows.iter().enumerate() {
            assert!(
                !a.1.is_empty() && a.1.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'),
                "bad mnemonic {:?}",
                a.1
            );
            for b in &rows[i + 1..] {
                assert_ne!(a.1, b.1, "duplicate mnemonic {}", a.1);
            }
        }
    }

    #[test]
    fn operand_layouts_are_well_formed() {
        for (byte, mnemonic, prefix, operand) in table() {
            assert!(
                matches!(prefix, 0 | 1 | 2 | 4),
                "{}: prefix {} is not a supported length prefix",
                mnemonic,
                prefix
            );
            assert!(
                *prefix == 0 || *operand == 0,
                "{}: prefixed opcodes carry no fixed operand",
                mnemonic
            );
            let opcode = OpCode::try_from(*byte).unwrap_or_else(|_| panic!("{} missing", mnemonic));
            assert_eq!(opcode.mnemonic(), *mnemonic);
            assert_eq!(opcode.operand_prefix(), *prefix);
            assert_eq!(opcode.operand_len(), *operand);
        }
    }

    #[test]
    fn undefined_bytes_do_not_decode() {
        let defined: Vec<u8> = table().iter().map(|row| row.0).collect();
        for byte in 0u8..=255 {
            assert_eq!(
                OpCode::try_from(byte).is_ok(),
                defined.contains(&byte),
                "byte 0x{:02x}",
                byte
            );
        }
    }
}
