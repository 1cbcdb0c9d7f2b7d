//! Bytecode opcode definitions.
//!
//! The [`for_each_opcode!`](crate::for_each_opcode) macro holds the
//! canonical opcode table and invokes a callback macro for code generation,
//! so multiple modules can generate opcode-related code without duplicating
//! the definitions.
//!
//! This module generates:
//! - The [`OpCode`] enum with byte values
//! - `TryFrom<u8>` for decoding
//! - Mnemonic and operand-layout accessors
//!
//! # Operand encoding
//!
//! Each opcode has a fixed operand layout, one of:
//! - no operand (`prefix: 0, operand: 0`)
//! - a fixed-length immediate of `operand` bytes (`prefix: 0`)
//! - a length prefix of `prefix` bytes (1, 2, or 4, little-endian unsigned)
//!   followed by that many payload bytes (`operand: 0`)
//!
//! All multi-byte immediates are little-endian; signed immediates use
//! two's complement.

use crate::virtual_machine::errors::VMError;

/// Invokes a callback macro with the complete opcode definition list.
#[macro_export]
macro_rules! for_each_opcode {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Constants
            // =========================
            /// Pushes a 1-byte signed integer.
            PushInt8 = 0x00, "PUSHINT8" => [prefix: 0, operand: 1],
            /// Pushes a 2-byte signed integer.
            PushInt16 = 0x01, "PUSHINT16" => [prefix: 0, operand: 2],
            /// Pushes a 4-byte signed integer.
            PushInt32 = 0x02, "PUSHINT32" => [prefix: 0, operand: 4],
            /// Pushes an 8-byte signed integer.
            PushInt64 = 0x03, "PUSHINT64" => [prefix: 0, operand: 8],
            /// Pushes a 16-byte signed integer.
            PushInt128 = 0x04, "PUSHINT128" => [prefix: 0, operand: 16],
            /// Pushes a 32-byte signed integer.
            PushInt256 = 0x05, "PUSHINT256" => [prefix: 0, operand: 32],
            /// Pushes a code pointer to ip+offset (4-byte signed offset).
            PushA = 0x0A, "PUSHA" => [prefix: 0, operand: 4],
            /// Pushes the null item.
            PushNull = 0x0B, "PUSHNULL" => [prefix: 0, operand: 0],
            /// Pushes a byte string; 1-byte length prefix.
            PushData1 = 0x0C, "PUSHDATA1" => [prefix: 1, operand: 0],
            /// Pushes a byte string; 2-byte length prefix.
            PushData2 = 0x0D, "PUSHDATA2" => [prefix: 2, operand: 0],
            /// Pushes a byte string; 4-byte length prefix.
            PushData4 = 0x0E, "PUSHDATA4" => [prefix: 4, operand: 0],
            /// Pushes the integer -1.
            PushM1 = 0x0F, "PUSHM1" => [prefix: 0, operand: 0],
            /// Pushes the integer 0.
            Push0 = 0x10, "PUSH0" => [prefix: 0, operand: 0],
            /// Pushes the integer 1.
            Push1 = 0x11, "PUSH1" => [prefix: 0, operand: 0],
            /// Pushes the integer 2.
            Push2 = 0x12, "PUSH2" => [prefix: 0, operand: 0],
            /// Pushes the integer 3.
            Push3 = 0x13, "PUSH3" => [prefix: 0, operand: 0],
            /// Pushes the integer 4.
            Push4 = 0x14, "PUSH4" => [prefix: 0, operand: 0],
            /// Pushes the integer 5.
            Push5 = 0x15, "PUSH5" => [prefix: 0, operand: 0],
            /// Pushes the integer 6.
            Push6 = 0x16, "PUSH6" => [prefix: 0, operand: 0],
            /// Pushes the integer 7.
            Push7 = 0x17, "PUSH7" => [prefix: 0, operand: 0],
            /// Pushes the integer 8.
            Push8 = 0x18, "PUSH8" => [prefix: 0, operand: 0],
            /// Pushes the integer 9.
            Push9 = 0x19, "PUSH9" => [prefix: 0, operand: 0],
            /// Pushes the integer 10.
            Push10 = 0x1A, "PUSH10" => [prefix: 0, operand: 0],
            /// Pushes the integer 11.
            Push11 = 0x1B, "PUSH11" => [prefix: 0, operand: 0],
            /// Pushes the integer 12.
            Push12 = 0x1C, "PUSH12" => [prefix: 0, operand: 0],
            /// Pushes the integer 13.
            Push13 = 0x1D, "PUSH13" => [prefix: 0, operand: 0],
            /// Pushes the integer 14.
            Push14 = 0x1E, "PUSH14" => [prefix: 0, operand: 0],
            /// Pushes the integer 15.
            Push15 = 0x1F, "PUSH15" => [prefix: 0, operand: 0],
            /// Pushes the integer 16.
            Push16 = 0x20, "PUSH16" => [prefix: 0, operand: 0],

            // =========================
            // Flow control
            // =========================
            /// No operation.
            Nop = 0x21, "NOP" => [prefix: 0, operand: 0],
            /// Unconditional jump; 1-byte signed offset.
            Jmp = 0x22, "JMP" => [prefix: 0, operand: 1],
            /// Unconditional jump; 4-byte signed offset.
            JmpL = 0x23, "JMP_L" => [prefix: 0, operand: 4],
            /// Jump if the popped item is true.
            JmpIf = 0x24, "JMPIF" => [prefix: 0, operand: 1],
            /// Jump if the popped item is true; 4-byte offset.
            JmpIfL = 0x25, "JMPIF_L" => [prefix: 0, operand: 4],
            /// Jump if the popped item is false.
            JmpIfNot = 0x26, "JMPIFNOT" => [prefix: 0, operand: 1],
            /// Jump if the popped item is false; 4-byte offset.
            JmpIfNotL = 0x27, "JMPIFNOT_L" => [prefix: 0, operand: 4],
            /// Jump if the two popped integers are equal.
            JmpEq = 0x28, "JMPEQ" => [prefix: 0, operand: 1],
            /// Jump if the two popped integers are equal; 4-byte offset.
            JmpEqL = 0x29, "JMPEQ_L" => [prefix: 0, operand: 4],
            /// Jump if the two popped integers are not equal.
            JmpNe = 0x2A, "JMPNE" => [prefix: 0, operand: 1],
            /// Jump if the two popped integers are not equal; 4-byte offset.
            JmpNeL = 0x2B, "JMPNE_L" => [prefix: 0, operand: 4],
            /// Jump if a > b.
            JmpGt = 0x2C, "JMPGT" => [prefix: 0, operand: 1],
            /// Jump if a > b; 4-byte offset.
            JmpGtL = 0x2D, "JMPGT_L" => [prefix: 0, operand: 4],
            /// Jump if a >= b.
            JmpGe = 0x2E, "JMPGE" => [prefix: 0, operand: 1],
            /// Jump if a >= b; 4-byte offset.
            JmpGeL = 0x2F, "JMPGE_L" => [prefix: 0, operand: 4],
            /// Jump if a < b.
            JmpLt = 0x30, "JMPLT" => [prefix: 0, operand: 1],
            /// Jump if a < b; 4-byte offset.
            JmpLtL = 0x31, "JMPLT_L" => [prefix: 0, operand: 4],
            /// Jump if a <= b.
            JmpLe = 0x32, "JMPLE" => [prefix: 0, operand: 1],
            /// Jump if a <= b; 4-byte offset.
            JmpLeL = 0x33, "JMPLE_L" => [prefix: 0, operand: 4],
            /// Calls the subroutine at ip+offset; 1-byte signed offset.
            Call = 0x34, "CALL" => [prefix: 0, operand: 1],
            /// Calls the subroutine at ip+offset; 4-byte signed offset.
            CallL = 0x35, "CALL_L" => [prefix: 0, operand: 4],
            /// Calls the subroutine at the popped code pointer.
            CallA = 0x36, "CALLA" => [prefix: 0, operand: 0],
            /// Terminates the engine unconditionally; never catchable.
            Abort = 0x38, "ABORT" => [prefix: 0, operand: 0],
            /// Faults if the popped condition is false.
            Assert = 0x39, "ASSERT" => [prefix: 0, operand: 0],
            /// Throws the popped item as a script exception.
            Throw = 0x3A, "THROW" => [prefix: 0, operand: 0],
            /// Opens a try block; 1-byte catch and finally offsets.
            Try = 0x3B, "TRY" => [prefix: 0, operand: 2],
            /// Opens a try block; 4-byte catch and finally offsets.
            TryL = 0x3C, "TRY_L" => [prefix: 0, operand: 8],
            /// Leaves a try or catch block; 1-byte continuation offset.
            EndTry = 0x3D, "ENDTRY" => [prefix: 0, operand: 1],
            /// Leaves a try or catch block; 4-byte continuation offset.
            EndTryL = 0x3E, "ENDTRY_L" => [prefix: 0, operand: 4],
            /// Ends a finally block and resumes the pending control transfer.
            EndFinally = 0x3F, "ENDFINALLY" => [prefix: 0, operand: 0],
            /// Returns from the current context.
            Ret = 0x40, "RET" => [prefix: 0, operand: 0],
            /// Invokes a host interop service; 4-byte id.
            Syscall = 0x41, "SYSCALL" => [prefix: 0, operand: 4],

            // =========================
            // Stack manipulation
            // =========================
            /// Pushes the number of items on the evaluation stack.
            Depth = 0x43, "DEPTH" => [prefix: 0, operand: 0],
            /// Removes the top item.
            Drop = 0x45, "DROP" => [prefix: 0, operand: 0],
            /// Removes the second-from-top item.
            Nip = 0x46, "NIP" => [prefix: 0, operand: 0],
            /// Removes the item n back from the top; n is popped first.
            XDrop = 0x48, "XDROP" => [prefix: 0, operand: 0],
            /// Removes all items from the evaluation stack.
            Clear = 0x49, "CLEAR" => [prefix: 0, operand: 0],
            /// Duplicates the top item.
            Dup = 0x4A, "DUP" => [prefix: 0, operand: 0],
            /// Copies the second-from-top item to the top.
            Over = 0x4B, "OVER" => [prefix: 0, operand: 0],
            /// Copies the item n back from the top; n is popped first.
            Pick = 0x4D, "PICK" => [prefix: 0, operand: 0],
            /// Copies the top item below the second-from-top item.
            Tuck = 0x4E, "TUCK" => [prefix: 0, operand: 0],
            /// Swaps the top two items.
            Swap = 0x50, "SWAP" => [prefix: 0, operand: 0],
            /// Rotates the top three items leftward.
            Rot = 0x51, "ROT" => [prefix: 0, operand: 0],
            /// Moves the item n back from the top to the top; n is popped first.
            Roll = 0x52, "ROLL" => [prefix: 0, operand: 0],
            /// Reverses the order of the top three items.
            Reverse3 = 0x53, "REVERSE3" => [prefix: 0, operand: 0],
            /// Reverses the order of the top four items.
            Reverse4 = 0x54, "REVERSE4" => [prefix: 0, operand: 0],
            /// Reverses the order of the top n items; n is popped first.
            ReverseN = 0x55, "REVERSEN" => [prefix: 0, operand: 0],

            // =========================
            // Slots
            // =========================
            /// Initializes the shared static field slot with n entries.
            InitSSlot = 0x56, "INITSSLOT" => [prefix: 0, operand: 1],
            /// Initializes local (first byte) and argument (second byte) slots.
            InitSlot = 0x57, "INITSLOT" => [prefix: 0, operand: 2],
            /// Loads a static field onto the stack.
            LdSFld = 0x5F, "LDSFLD" => [prefix: 0, operand: 1],
            /// Stores the popped item into a static field.
            StSFld = 0x67, "STSFLD" => [prefix: 0, operand: 1],
            /// Loads a local variable onto the stack.
            LdLoc = 0x6F, "LDLOC" => [prefix: 0, operand: 1],
            /// Stores the popped item into a local variable.
            StLoc = 0x77, "STLOC" => [prefix: 0, operand: 1],
            /// Loads an argument onto the stack.
            LdArg = 0x7F, "LDARG" => [prefix: 0, operand: 1],
            /// Stores the popped item into an argument.
            StArg = 0x87, "STARG" => [prefix: 0, operand: 1],

            // =========================
            // Splice
            // =========================
            /// Pushes a zero-filled mutable buffer of the popped length.
            NewBuffer = 0x88, "NEWBUFFER" => [prefix: 0, operand: 0],
            /// Concatenates two byte sequences into a buffer.
            Cat = 0x8B, "CAT" => [prefix: 0, operand: 0],
            /// Extracts a sub-range as a buffer; pops count, index, value.
            SubStr = 0x8C, "SUBSTR" => [prefix: 0, operand: 0],
            /// Extracts the leftmost count bytes; pops count, value.
            Left = 0x8D, "LEFT" => [prefix: 0, operand: 0],
            /// Extracts the rightmost count bytes; pops count, value.
            Right = 0x8E, "RIGHT" => [prefix: 0, operand: 0],

            // =========================
            // Bitwise logic
            // =========================
            /// Bitwise complement of the popped integer.
            Invert = 0x90, "INVERT" => [prefix: 0, operand: 0],
            /// Bitwise AND of two popped integers.
            And = 0x91, "AND" => [prefix: 0, operand: 0],
            /// Bitwise OR of two popped integers.
            Or = 0x92, "OR" => [prefix: 0, operand: 0],
            /// Bitwise XOR of two popped integers.
            Xor = 0x93, "XOR" => [prefix: 0, operand: 0],
            /// Budgeted equality of two popped items.
            Equal = 0x97, "EQUAL" => [prefix: 0, operand: 0],
            /// Budgeted inequality of two popped items.
            NotEqual = 0x98, "NOTEQUAL" => [prefix: 0, operand: 0],

            // =========================
            // Arithmetic
            // =========================
            /// Pushes the sign of the popped integer (-1, 0, or 1).
            Sign = 0x99, "SIGN" => [prefix: 0, operand: 0],
            /// Absolute value.
            Abs = 0x9A, "ABS" => [prefix: 0, operand: 0],
            /// Arithmetic negation.
            Negate = 0x9B, "NEGATE" => [prefix: 0, operand: 0],
            /// Increments the popped integer by one.
            Inc = 0x9C, "INC" => [prefix: 0, operand: 0],
            /// Decrements the popped integer by one.
            Dec = 0x9D, "DEC" => [prefix: 0, operand: 0],
            /// Addition.
            Add = 0x9E, "ADD" => [prefix: 0, operand: 0],
            /// Subtraction.
            Sub = 0x9F, "SUB" => [prefix: 0, operand: 0],
            /// Multiplication.
            Mul = 0xA0, "MUL" => [prefix: 0, operand: 0],
            /// Division, truncating toward zero.
            Div = 0xA1, "DIV" => [prefix: 0, operand: 0],
            /// Remainder with the sign of the dividend.
            Mod = 0xA2, "MOD" => [prefix: 0, operand: 0],
            /// Left shift; the count is popped first and bounded by the limits.
            Shl = 0xA8, "SHL" => [prefix: 0, operand: 0],
            /// Arithmetic right shift; the count is popped first.
            Shr = 0xA9, "SHR" => [prefix: 0, operand: 0],
            /// Logical negation of the popped boolean.
            Not = 0xAA, "NOT" => [prefix: 0, operand: 0],
            /// Logical AND of two popped booleans.
            BoolAnd = 0xAB, "BOOLAND" => [prefix: 0, operand: 0],
            /// Logical OR of two popped booleans.
            BoolOr = 0xAC, "BOOLOR" => [prefix: 0, operand: 0],
            /// Pushes whether the popped integer is nonzero.
            Nz = 0xB1, "NZ" => [prefix: 0, operand: 0],
            /// Numeric equality of two popped integers.
            NumEqual = 0xB3, "NUMEQUAL" => [prefix: 0, operand: 0],
            /// Numeric inequality of two popped integers.
            NumNotEqual = 0xB4, "NUMNOTEQUAL" => [prefix: 0, operand: 0],
            /// Less-than; pushes false if either operand is null.
            Lt = 0xB5, "LT" => [prefix: 0, operand: 0],
            /// Less-than-or-equal; pushes false if either operand is null.
            Le = 0xB6, "LE" => [prefix: 0, operand: 0],
            /// Greater-than; pushes false if either operand is null.
            Gt = 0xB7, "GT" => [prefix: 0, operand: 0],
            /// Greater-than-or-equal; pushes false if either operand is null.
            Ge = 0xB8, "GE" => [prefix: 0, operand: 0],
            /// Minimum of two popped integers.
            Min = 0xB9, "MIN" => [prefix: 0, operand: 0],
            /// Maximum of two popped integers.
            Max = 0xBA, "MAX" => [prefix: 0, operand: 0],
            /// Pushes whether a <= x < b; pops b, a, x.
            Within = 0xBB, "WITHIN" => [prefix: 0, operand: 0],

            // =========================
            // Compound types
            // =========================
            /// Packs popped key/value pairs into a map; the count is popped first.
            PackMap = 0xBE, "PACKMAP" => [prefix: 0, operand: 0],
            /// Packs popped items into a struct; the count is popped first.
            PackStruct = 0xBF, "PACKSTRUCT" => [prefix: 0, operand: 0],
            /// Packs popped items into an array; the count is popped first.
            Pack = 0xC0, "PACK" => [prefix: 0, operand: 0],
            /// Unpacks a compound onto the stack and pushes its count.
            Unpack = 0xC1, "UNPACK" => [prefix: 0, operand: 0],
            /// Pushes an empty array.
            NewArray0 = 0xC2, "NEWARRAY0" => [prefix: 0, operand: 0],
            /// Pushes an array of n nulls; n is popped.
            NewArray = 0xC3, "NEWARRAY" => [prefix: 0, operand: 0],
            /// Pushes an array of n default values of the operand type.
            NewArrayT = 0xC4, "NEWARRAY_T" => [prefix: 0, operand: 1],
            /// Pushes an empty struct.
            NewStruct0 = 0xC5, "NEWSTRUCT0" => [prefix: 0, operand: 0],
            /// Pushes a struct of n nulls; n is popped.
            NewStruct = 0xC6, "NEWSTRUCT" => [prefix: 0, operand: 0],
            /// Pushes an empty map.
            NewMap = 0xC8, "NEWMAP" => [prefix: 0, operand: 0],
            /// Pushes the element count or byte length of the popped item.
            Size = 0xCA, "SIZE" => [prefix: 0, operand: 0],
            /// Pushes whether the popped collection has the popped key.
            HasKey = 0xCB, "HASKEY" => [prefix: 0, operand: 0],
            /// Pushes an array of the popped map's keys.
            Keys = 0xCC, "KEYS" => [prefix: 0, operand: 0],
            /// Pushes an array of the popped collection's values.
            Values = 0xCD, "VALUES" => [prefix: 0, operand: 0],
            /// Pushes the element at the popped key or index.
            PickItem = 0xCE, "PICKITEM" => [prefix: 0, operand: 0],
            /// Appends the popped item to the popped array or struct.
            Append = 0xCF, "APPEND" => [prefix: 0, operand: 0],
            /// Sets the element at the popped key or index.
            SetItem = 0xD0, "SETITEM" => [prefix: 0, operand: 0],
            /// Reverses the popped array, struct, or buffer in place.
            ReverseItems = 0xD1, "REVERSEITEMS" => [prefix: 0, operand: 0],
            /// Removes the element at the popped key or index.
            Remove = 0xD2, "REMOVE" => [prefix: 0, operand: 0],
            /// Removes all elements from the popped compound.
            ClearItems = 0xD3, "CLEARITEMS" => [prefix: 0, operand: 0],
            /// Removes and pushes the last element of the popped array.
            PopItem = 0xD4, "POPITEM" => [prefix: 0, operand: 0],

            // =========================
            // Types
            // =========================
            /// Pushes whether the popped item is null.
            IsNull = 0xD8, "ISNULL" => [prefix: 0, operand: 0],
            /// Pushes whether the popped item has the operand type.
            IsType = 0xD9, "ISTYPE" => [prefix: 0, operand: 1],
            /// Converts the popped item to the operand type.
            Convert = 0xDB, "CONVERT" => [prefix: 0, operand: 1],
        }
    };
}

/// Generates the [`OpCode`] enum and its accessors from the opcode table.
macro_rules! define_opcodes {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:expr, $mnemonic:literal => [
                prefix: $prefix:expr, operand: $operand:expr
            ]
        ),* $(,)?
    ) => {
        // =========================
        // Opcode enum
        // =========================
        #[repr(u8)]
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub enum OpCode {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for OpCode {
            type Error = VMError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(OpCode::$name), )*
                    _ => Err(VMError::InvalidOpcode {
                        opcode: value,
                        offset: 0,
                    }),
                }
            }
        }

        impl OpCode {
            /// Returns the assembly mnemonic for this opcode.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( OpCode::$name => $mnemonic, )*
                }
            }

            /// Returns the length-prefix size in bytes (0, 1, 2, or 4).
            ///
            /// Nonzero only for the PUSHDATA family, whose operand is a
            /// little-endian unsigned length followed by that many bytes.
            pub const fn operand_prefix(&self) -> usize {
                match self {
                    $( OpCode::$name => $prefix, )*
                }
            }

            /// Returns the fixed operand size in bytes.
            ///
            /// Zero for prefixed opcodes; their operand size is dynamic.
            pub const fn operand_len(&self) -> usize {
                match self {
                    $( OpCode::$name => $operand, )*
                }
            }
        }
    };
}

for_each_opcode!(define_opcodes);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_from_invalid() {
        assert!(matches!(
            OpCode::try_from(0xFF),
            Err(VMError::InvalidOpcode { opcode: 0xFF, .. })
        ));
        // Gaps inside the table are invalid too.
        assert!(matches!(
            OpCode::try_from(0x37),
            Err(VMError::InvalidOpcode { opcode: 0x37, .. })
        ));
        assert!(matches!(
            OpCode::try_from(0x44),
            Err(VMError::InvalidOpcode { opcode: 0x44, .. })
        ));
    }

    #[test]
    fn try_from_round_trip() {
        for byte in 0u8..=0xFF {
            if let Ok(op) = OpCode::try_from(byte) {
                assert_eq!(op as u8, byte);
            }
        }
    }

    #[test]
    fn operand_layouts() {
        assert_eq!(OpCode::PushInt256.operand_len(), 32);
        assert_eq!(OpCode::PushData1.operand_prefix(), 1);
        assert_eq!(OpCode::PushData4.operand_prefix(), 4);
        assert_eq!(OpCode::Try.operand_len(), 2);
        assert_eq!(OpCode::TryL.operand_len(), 8);
        assert_eq!(OpCode::Syscall.operand_len(), 4);
        assert_eq!(OpCode::Nop.operand_len(), 0);
        assert_eq!(OpCode::Nop.operand_prefix(), 0);
    }

    #[test]
    fn mnemonics() {
        assert_eq!(OpCode::Jmp.mnemonic(), "JMP");
        assert_eq!(OpCode::JmpL.mnemonic(), "JMP_L");
        assert_eq!(OpCode::PushM1.mnemonic(), "PUSHM1");
        assert_eq!(OpCode::EndFinally.mnemonic(), "ENDFINALLY");
    }
}
