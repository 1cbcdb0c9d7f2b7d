//! Script container with lazy instruction decoding.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::types::bytes::Bytes;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::instruction::Instruction;
use crate::virtual_machine::opcode::OpCode;
use crate::virtual_machine::stack_item::StackItemType;

struct ScriptInner {
    value: Bytes,
    strict: bool,
    /// Decoded instructions keyed by offset. Populated lazily in
    /// non-strict mode, eagerly during strict validation.
    instructions: RefCell<HashMap<usize, Rc<Instruction>>>,
}

/// An immutable bytecode script.
///
/// Clones share the underlying buffer and decode cache, so every context
/// spawned from the same script sees the same decoded instructions.
/// Pointer items and debugger breakpoints key on this shared identity.
#[derive(Clone)]
pub struct Script {
    inner: Rc<ScriptInner>,
}

impl Script {
    /// Wraps bytecode without validation.
    ///
    /// Instructions are decoded on demand; malformed regions fault only
    /// when execution reaches them.
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            inner: Rc::new(ScriptInner {
                value: value.into(),
                strict: false,
                instructions: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Wraps bytecode in strict mode, eagerly decoding and validating the
    /// whole script.
    ///
    /// Validation walks every instruction from offset 0, then checks that
    /// all static control-transfer targets (jumps, calls, try offsets,
    /// PUSHA) land on instruction boundaries and that type operands name
    /// defined types. Any violation fails with [`VMError::BadScript`]
    /// before execution begins.
    pub fn new_strict(value: impl Into<Bytes>) -> Result<Self, VMError> {
        let value = value.into();
        let mut instructions = HashMap::new();
        let mut ip = 0usize;
        while ip < value.len() {
            let instruction = Instruction::decode(&value, ip)?;
            let size = instruction.size();
            instructions.insert(ip, Rc::new(instruction));
            ip += size;
        }

        for (&ip, instruction) in &instructions {
            match instruction.opcode() {
                OpCode::Jmp
                | OpCode::JmpIf
                | OpCode::JmpIfNot
                | OpCode::JmpEq
                | OpCode::JmpNe
                | OpCode::JmpGt
                | OpCode::JmpGe
                | OpCode::JmpLt
                | OpCode::JmpLe
                | OpCode::Call
                | OpCode::EndTry => {
                    check_boundary(&instructions, ip, instruction.token_i8() as i64)?;
                }
                OpCode::JmpL
                | OpCode::JmpIfL
                | OpCode::JmpIfNotL
                | OpCode::JmpEqL
                | OpCode::JmpNeL
                | OpCode::JmpGtL
                | OpCode::JmpGeL
                | OpCode::JmpLtL
                | OpCode::JmpLeL
                | OpCode::CallL
                | OpCode::EndTryL
                | OpCode::PushA => {
                    check_boundary(&instructions, ip, instruction.token_i32() as i64)?;
                }
                OpCode::Try => {
                    check_boundary(&instructions, ip, instruction.token_i8() as i64)?;
                    check_boundary(&instructions, ip, instruction.token_i8_1() as i64)?;
                }
                OpCode::TryL => {
                    check_boundary(&instructions, ip, instruction.token_i32() as i64)?;
                    check_boundary(&instructions, ip, instruction.token_i32_1() as i64)?;
                }
                OpCode::NewArrayT => {
                    let ty = instruction.token_u8();
                    if StackItemType::from_byte(ty).is_none() {
                        return Err(VMError::BadScript(format!(
                            "undefined type 0x{:02x} for NEWARRAY_T at offset {}",
                            ty, ip
                        )));
                    }
                }
                OpCode::IsType | OpCode::Convert => {
                    let ty = instruction.token_u8();
                    match StackItemType::from_byte(ty) {
                        None | Some(StackItemType::Any) => {
                            return Err(VMError::BadScript(format!(
                                "invalid type operand 0x{:02x} for {} at offset {}",
                                ty,
                                instruction.opcode().mnemonic(),
                                ip
                            )));
                        }
                        Some(_) => {}
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            inner: Rc::new(ScriptInner {
                value,
                strict: true,
                instructions: RefCell::new(instructions),
            }),
        })
    }

    /// Script length in bytes.
    pub fn len(&self) -> usize {
        self.inner.value.len()
    }

    /// Whether the script is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.value.is_empty()
    }

    /// The raw bytecode.
    pub fn as_slice(&self) -> &[u8] {
        self.inner.value.as_slice()
    }

    /// Whether the script was validated at construction.
    pub fn is_strict(&self) -> bool {
        self.inner.strict
    }

    /// Returns the instruction at `ip`, decoding and caching it if needed.
    ///
    /// In strict mode an offset that is not an instruction boundary fails
    /// with [`VMError::InvalidInstructionPointer`]; in non-strict mode the
    /// bytes at `ip` are decoded on the spot and any malformation surfaces
    /// here.
    pub fn get_instruction(&self, ip: usize) -> Result<Rc<Instruction>, VMError> {
        if ip >= self.len() {
            return Err(VMError::InvalidInstructionPointer(ip));
        }
        if let Some(cached) = self.inner.instructions.borrow().get(&ip) {
            return Ok(Rc::clone(cached));
        }
        if self.inner.strict {
            return Err(VMError::InvalidInstructionPointer(ip));
        }
        let instruction = Rc::new(Instruction::decode(self.as_slice(), ip)?);
        self.inner
            .instructions
            .borrow_mut()
            .insert(ip, Rc::clone(&instruction));
        Ok(instruction)
    }

    /// Shared-identity comparison: true only for clones of the same script.
    pub fn same_script(a: &Script, b: &Script) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// Stable identity for breakpoint tables.
    pub(crate) fn id(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("len", &self.len())
            .field("strict", &self.inner.strict)
            .finish()
    }
}

fn check_boundary(
    instructions: &HashMap<usize, Rc<Instruction>>,
    ip: usize,
    offset: i64,
) -> Result<(), VMError> {
    let target = ip as i64 + offset;
    if target < 0 || !instructions.contains_key(&(target as usize)) {
        return Err(VMError::BadScript(format!(
            "control transfer at offset {} targets {} which is not an instruction boundary",
            ip, target
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_accepts_well_formed() {
        // PUSH1; PUSH2; ADD; RET
        let script = Script::new_strict(vec![0x11, 0x12, 0x9E, 0x40]).unwrap();
        assert!(script.is_strict());
        assert_eq!(script.len(), 4);
        assert_eq!(script.get_instruction(2).unwrap().opcode(), OpCode::Add);
    }

    #[test]
    fn strict_rejects_truncated_operand() {
        // PUSHINT32 with 2 bytes
        assert!(matches!(
            Script::new_strict(vec![0x02, 0x01, 0x02]),
            Err(VMError::BadScript(_))
        ));
    }

    #[test]
    fn strict_rejects_jump_into_operand() {
        // JMP +1 targets the middle of its own operand encoding
        assert!(matches!(
            Script::new_strict(vec![0x22, 0x01]),
            Err(VMError::BadScript(_))
        ));
    }

    #[test]
    fn strict_rejects_jump_past_end() {
        // JMP +4 with a 2-byte script
        assert!(matches!(
            Script::new_strict(vec![0x22, 0x04]),
            Err(VMError::BadScript(_))
        ));
    }

    #[test]
    fn strict_accepts_try_offsets() {
        // TRY catch=+4 finally=+6; NOP; ENDTRY +2; NOP; RET
        let script = Script::new_strict(vec![0x3B, 0x04, 0x06, 0x21, 0x3D, 0x02, 0x21, 0x40]);
        assert!(script.is_ok());
    }

    #[test]
    fn strict_rejects_bad_try_offset() {
        // TRY with finally offset into an operand
        assert!(matches!(
            Script::new_strict(vec![0x3B, 0x03, 0x01, 0x40]),
            Err(VMError::BadScript(_))
        ));
    }

    #[test]
    fn strict_rejects_convert_to_any() {
        // CONVERT 0x00
        assert!(matches!(
            Script::new_strict(vec![0xDB, 0x00]),
            Err(VMError::BadScript(_))
        ));
    }

    #[test]
    fn strict_rejects_unaligned_pointer() {
        // PUSHINT16 xx yy; offset 1 is inside the operand
        let script = Script::new_strict(vec![0x01, 0x11, 0x12, 0x40]).unwrap();
        assert!(matches!(
            script.get_instruction(1),
            Err(VMError::InvalidInstructionPointer(1))
        ));
    }

    #[test]
    fn lazy_mode_defers_errors() {
        // Valid NOP followed by garbage that is never executed
        let script = Script::new(vec![0x21, 0xFF, 0xFF]);
        assert_eq!(script.get_instruction(0).unwrap().opcode(), OpCode::Nop);
        assert!(matches!(
            script.get_instruction(1),
            Err(VMError::InvalidOpcode { opcode: 0xFF, .. })
        ));
    }

    #[test]
    fn lazy_decode_is_cached() {
        let script = Script::new(vec![0x11, 0x40]);
        let a = script.get_instruction(0).unwrap();
        let b = script.get_instruction(0).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn out_of_range_pointer() {
        let script = Script::new(vec![0x21]);
        assert!(matches!(
            script.get_instruction(5),
            Err(VMError::InvalidInstructionPointer(5))
        ));
    }

    #[test]
    fn clones_share_identity() {
        let a = Script::new(vec![0x21]);
        let b = a.clone();
        let c = Script::new(vec![0x21]);
        assert!(Script::same_script(&a, &b));
        assert!(!Script::same_script(&a, &c));
    }
}
