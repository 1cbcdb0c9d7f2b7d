use chainvm_derive::Error;

/// Errors raised during script decoding or VM execution.
///
/// Two disjoint classes exist (see [`VMError::is_catchable`]):
/// structural/resource faults that always terminate the run, and "soft"
/// opcode faults that the engine may re-raise as catchable script
/// exceptions when `catch_engine_exceptions` is enabled.
#[derive(Debug, Error)]
pub enum VMError {
    /// Malformed bytecode: truncated operand, bad control-transfer target,
    /// or undefined type operand.
    #[error("bad script: {0}")]
    BadScript(String),
    /// Unknown opcode byte encountered while decoding.
    #[error("invalid opcode 0x{opcode:02x} at offset {offset}")]
    InvalidOpcode { opcode: u8, offset: usize },
    /// Instruction pointer outside the script, or (in strict mode) not on
    /// an instruction boundary.
    #[error("invalid instruction pointer {0}")]
    InvalidInstructionPointer(usize),
    /// Aggregate stack item count exceeded `max_stack_size`.
    #[error("stack size limit exceeded: {count} > {max}")]
    StackOverflow { count: usize, max: u32 },
    /// A single item exceeded `max_item_size`.
    #[error("item size limit exceeded: {size} > {max}")]
    ItemTooLarge { size: usize, max: u32 },
    /// Invocation stack depth exceeded `max_invocation_stack_size`.
    #[error("invocation stack limit exceeded: {max}")]
    InvocationOverflow { max: u32 },
    /// Try-block nesting exceeded `max_try_nesting_depth`.
    #[error("try nesting limit exceeded: {max}")]
    TryNestingTooDeep { max: u32 },
    /// Structurally invalid operation (missing slot, foreign pointer,
    /// malformed try block, misplaced ENDTRY, ...).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// The ABORT instruction was executed.
    #[error("ABORT executed")]
    Aborted,
    /// A thrown exception propagated past every handler; the payload is
    /// available from the engine.
    #[error("unhandled script exception")]
    UnhandledException,
    /// No invocation context is loaded.
    #[error("no invocation context")]
    NoContext,

    /// Operand had the wrong stack item type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    /// Unsupported stack item conversion.
    #[error("invalid cast from {from} to {to}")]
    InvalidCast {
        from: &'static str,
        to: &'static str,
    },
    /// Pop or peek on an exhausted evaluation stack.
    #[error("evaluation stack underflow")]
    StackUnderflow,
    /// Index or count operand outside the valid range.
    #[error("index {index} out of range for size {size}")]
    IndexOutOfRange { index: i64, size: usize },
    /// Map lookup with a key that is not present.
    #[error("map key not found")]
    MapKeyNotFound,
    /// Division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// Shift count negative or above `max_shift`.
    #[error("shift count {shift} out of range (max {max})")]
    ShiftOutOfRange { shift: i64, max: u32 },
    /// Integer result does not fit in the 32-byte canonical encoding.
    #[error("integer exceeds {size} byte encoding limit")]
    IntegerOverflow { size: usize },
    /// Equality comparison exceeded `max_comparable_size`.
    #[error("operand exceeds the maximum comparable size")]
    ComparisonTooLarge,
    /// The ASSERT instruction was executed with a false condition.
    #[error("ASSERT executed with false result")]
    AssertionFailed,
    /// SYSCALL with no registered handler for the id.
    #[error("syscall not found: {0}")]
    SyscallNotFound(u32),
    /// Operation not defined for the item type (e.g. hashing a compound).
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
}

impl VMError {
    /// Whether this fault may be wrapped as a catchable script exception
    /// when `catch_engine_exceptions` is enabled.
    ///
    /// Resource-limit violations and malformed-script faults always return
    /// `false`: they terminate the run regardless of configuration.
    pub fn is_catchable(&self) -> bool {
        matches!(
            self,
            VMError::TypeMismatch { .. }
                | VMError::InvalidCast { .. }
                | VMError::StackUnderflow
                | VMError::IndexOutOfRange { .. }
                | VMError::MapKeyNotFound
                | VMError::DivisionByZero
                | VMError::ShiftOutOfRange { .. }
                | VMError::IntegerOverflow { .. }
                | VMError::ComparisonTooLarge
                | VMError::AssertionFailed
                | VMError::SyscallNotFound(_)
                | VMError::UnsupportedOperation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_faults_are_not_catchable() {
        assert!(!VMError::StackOverflow { count: 3, max: 2 }.is_catchable());
        assert!(!VMError::ItemTooLarge { size: 9, max: 4 }.is_catchable());
        assert!(!VMError::InvocationOverflow { max: 8 }.is_catchable());
        assert!(!VMError::TryNestingTooDeep { max: 2 }.is_catchable());
        assert!(!VMError::BadScript("truncated".into()).is_catchable());
        assert!(!VMError::Aborted.is_catchable());
    }

    #[test]
    fn soft_faults_are_catchable() {
        assert!(
            VMError::TypeMismatch {
                expected: "Integer",
                actual: "Map"
            }
            .is_catchable()
        );
        assert!(VMError::DivisionByZero.is_catchable());
        assert!(VMError::AssertionFailed.is_catchable());
        assert!(VMError::MapKeyNotFound.is_catchable());
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            format!("{}", VMError::InvalidOpcode { opcode: 0xff, offset: 3 }),
            "invalid opcode 0xff at offset 3"
        );
        assert_eq!(
            format!("{}", VMError::BadScript("truncated operand".into())),
            "bad script: truncated operand"
        );
    }
}
