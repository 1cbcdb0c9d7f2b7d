//! Decoded instruction representation.

use crate::types::bytes::Bytes;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::opcode::OpCode;

/// A single decoded instruction: an opcode plus its operand payload.
///
/// The operand holds only the payload bytes; for prefixed opcodes the
/// length prefix is consumed during decoding and not retained. Decoded
/// instructions are cached by [`Script`](super::script::Script) and shared
/// behind `Rc`, so decoding any offset happens at most once per script.
#[derive(Debug, Clone)]
pub struct Instruction {
    opcode: OpCode,
    operand: Bytes,
}

impl Instruction {
    /// Decodes the instruction starting at `ip` in `script`.
    ///
    /// Fails with [`VMError::InvalidOpcode`] for an undefined opcode byte
    /// and [`VMError::BadScript`] when the operand extends past the end of
    /// the script.
    pub fn decode(script: &[u8], ip: usize) -> Result<Self, VMError> {
        let byte = *script
            .get(ip)
            .ok_or(VMError::InvalidInstructionPointer(ip))?;
        let opcode = OpCode::try_from(byte).map_err(|_| VMError::InvalidOpcode {
            opcode: byte,
            offset: ip,
        })?;

        let prefix = opcode.operand_prefix();
        let (operand_start, operand_len) = if prefix > 0 {
            let prefix_end = ip + 1 + prefix;
            let prefix_bytes = script.get(ip + 1..prefix_end).ok_or_else(|| {
                VMError::BadScript(format!(
                    "truncated length prefix for {} at offset {}",
                    opcode.mnemonic(),
                    ip
                ))
            })?;
            let mut len = 0usize;
            for (i, b) in prefix_bytes.iter().enumerate() {
                len |= (*b as usize) << (8 * i);
            }
            (prefix_end, len)
        } else {
            (ip + 1, opcode.operand_len())
        };

        let operand = script
            .get(operand_start..operand_start + operand_len)
            .ok_or_else(|| {
                VMError::BadScript(format!(
                    "truncated operand for {} at offset {}: want {} bytes",
                    opcode.mnemonic(),
                    ip,
                    operand_len
                ))
            })?;

        Ok(Self {
            opcode,
            operand: Bytes::from(operand),
        })
    }

    /// Synthesizes a RET, used when the instruction pointer reaches the
    /// end of a script.
    pub fn ret() -> Self {
        Self {
            opcode: OpCode::Ret,
            operand: Bytes::default(),
        }
    }

    /// The opcode.
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// The operand payload bytes.
    pub fn operand(&self) -> &Bytes {
        &self.operand
    }

    /// Total encoded size in bytes, including opcode and any length prefix.
    pub fn size(&self) -> usize {
        let prefix = self.opcode.operand_prefix();
        if prefix > 0 {
            1 + prefix + self.operand.len()
        } else {
            1 + self.opcode.operand_len()
        }
    }

    fn slice(&self, start: usize, len: usize) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[..len].copy_from_slice(&self.operand[start..start + len]);
        buf
    }

    /// Operand as a signed 8-bit immediate.
    pub fn token_i8(&self) -> i8 {
        self.operand[0] as i8
    }

    /// Second signed 8-bit immediate (TRY catch/finally pair).
    pub fn token_i8_1(&self) -> i8 {
        self.operand[1] as i8
    }

    /// Operand as a signed 16-bit little-endian immediate.
    pub fn token_i16(&self) -> i16 {
        i16::from_le_bytes([self.operand[0], self.operand[1]])
    }

    /// Operand as a signed 32-bit little-endian immediate.
    pub fn token_i32(&self) -> i32 {
        let buf = self.slice(0, 4);
        i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
    }

    /// Second signed 32-bit immediate (TRY_L catch/finally pair).
    pub fn token_i32_1(&self) -> i32 {
        let buf = self.slice(4, 4);
        i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
    }

    /// Operand as an unsigned 8-bit immediate.
    pub fn token_u8(&self) -> u8 {
        self.operand[0]
    }

    /// Second unsigned 8-bit immediate (INITSLOT pair).
    pub fn token_u8_1(&self) -> u8 {
        self.operand[1]
    }

    /// Operand as an unsigned 16-bit little-endian immediate.
    pub fn token_u16(&self) -> u16 {
        u16::from_le_bytes([self.operand[0], self.operand[1]])
    }

    /// Operand as an unsigned 32-bit little-endian immediate.
    pub fn token_u32(&self) -> u32 {
        let buf = self.slice(0, 4);
        u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_fixed_operand() {
        // PUSHINT16 0x0304
        let instr = Instruction::decode(&[0x01, 0x04, 0x03], 0).unwrap();
        assert_eq!(instr.opcode(), OpCode::PushInt16);
        assert_eq!(instr.token_i16(), 0x0304);
        assert_eq!(instr.size(), 3);
    }

    #[test]
    fn decode_prefixed_operand() {
        // PUSHDATA1 with 3 payload bytes
        let instr = Instruction::decode(&[0x0C, 0x03, 0xAA, 0xBB, 0xCC], 0).unwrap();
        assert_eq!(instr.opcode(), OpCode::PushData1);
        assert_eq!(instr.operand().as_slice(), &[0xAA, 0xBB, 0xCC]);
        assert_eq!(instr.size(), 5);
    }

    #[test]
    fn decode_mid_script() {
        // NOP; JMP -2
        let instr = Instruction::decode(&[0x21, 0x22, 0xFE], 1).unwrap();
        assert_eq!(instr.opcode(), OpCode::Jmp);
        assert_eq!(instr.token_i8(), -2);
    }

    #[test]
    fn truncated_operand_is_bad_script() {
        // PUSHINT32 with only 2 operand bytes
        assert!(matches!(
            Instruction::decode(&[0x02, 0x01, 0x02], 0),
            Err(VMError::BadScript(_))
        ));
        // PUSHDATA1 claiming 5 bytes but providing 1
        assert!(matches!(
            Instruction::decode(&[0x0C, 0x05, 0xAA], 0),
            Err(VMError::BadScript(_))
        ));
        // PUSHDATA2 with a truncated prefix
        assert!(matches!(
            Instruction::decode(&[0x0D, 0x01], 0),
            Err(VMError::BadScript(_))
        ));
    }

    #[test]
    fn undefined_opcode() {
        assert!(matches!(
            Instruction::decode(&[0xFF], 0),
            Err(VMError::InvalidOpcode {
                opcode: 0xFF,
                offset: 0
            })
        ));
    }

    #[test]
    fn try_operand_pair() {
        // TRY catch=+5 finally=-3
        let instr = Instruction::decode(&[0x3B, 0x05, 0xFD], 0).unwrap();
        assert_eq!(instr.token_i8(), 5);
        assert_eq!(instr.token_i8_1(), -3);

        // TRY_L catch=+70000 finally=0
        let mut script = vec![0x3C];
        script.extend_from_slice(&70000i32.to_le_bytes());
        script.extend_from_slice(&0i32.to_le_bytes());
        let instr = Instruction::decode(&script, 0).unwrap();
        assert_eq!(instr.token_i32(), 70000);
        assert_eq!(instr.token_i32_1(), 0);
    }

    #[test]
    fn synthesized_ret() {
        let instr = Instruction::ret();
        assert_eq!(instr.opcode(), OpCode::Ret);
        assert_eq!(instr.size(), 1);
    }
}
