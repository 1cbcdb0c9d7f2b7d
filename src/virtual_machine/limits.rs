use crate::virtual_machine::errors::VMError;

/// Resource limits enforced by the execution engine.
///
/// Limits are fixed at engine construction and never consulted from
/// ambient state, so two engines configured identically behave
/// identically on the same script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionEngineLimits {
    /// Maximum aggregate number of live stack items across all evaluation
    /// stacks, slots, and nested compound children.
    pub max_stack_size: u32,
    /// Maximum byte size of a single ByteString or Buffer.
    pub max_item_size: u32,
    /// Maximum number of bytes (or element visits) an equality comparison
    /// may consume.
    pub max_comparable_size: u32,
    /// Maximum invocation stack depth.
    pub max_invocation_stack_size: u32,
    /// Maximum try-block nesting depth per context.
    pub max_try_nesting_depth: u32,
    /// Maximum bit count for SHL/SHR.
    pub max_shift: u32,
    /// When enabled, catchable engine faults are re-raised as script
    /// exceptions that TRY/CATCH can intercept.
    pub catch_engine_exceptions: bool,
}

impl Default for ExecutionEngineLimits {
    fn default() -> Self {
        Self {
            max_stack_size: 2 * 1024,
            max_item_size: 1024 * 1024,
            max_comparable_size: 65536,
            max_invocation_stack_size: 1024,
            max_try_nesting_depth: 16,
            max_shift: 256,
            catch_engine_exceptions: true,
        }
    }
}

impl ExecutionEngineLimits {
    /// Checks a single-item byte size against `max_item_size`.
    pub fn assert_max_item_size(&self, size: usize) -> Result<(), VMError> {
        if size > self.max_item_size as usize {
            return Err(VMError::ItemTooLarge {
                size,
                max: self.max_item_size,
            });
        }
        Ok(())
    }

    /// Checks a shift count against `max_shift`.
    pub fn assert_shift(&self, shift: i64) -> Result<(), VMError> {
        if shift < 0 || shift > self.max_shift as i64 {
            return Err(VMError::ShiftOutOfRange {
                shift,
                max: self.max_shift,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let limits = ExecutionEngineLimits::default();
        assert_eq!(limits.max_stack_size, 2048);
        assert_eq!(limits.max_item_size, 1 << 20);
        assert_eq!(limits.max_comparable_size, 65536);
        assert_eq!(limits.max_invocation_stack_size, 1024);
        assert_eq!(limits.max_try_nesting_depth, 16);
        assert_eq!(limits.max_shift, 256);
        assert!(limits.catch_engine_exceptions);
    }

    #[test]
    fn item_size_boundary() {
        let limits = ExecutionEngineLimits::default();
        assert!(limits.assert_max_item_size(1 << 20).is_ok());
        assert!(limits.assert_max_item_size((1 << 20) + 1).is_err());
    }

    #[test]
    fn shift_boundary() {
        let limits = ExecutionEngineLimits::default();
        assert!(limits.assert_shift(0).is_ok());
        assert!(limits.assert_shift(256).is_ok());
        assert!(limits.assert_shift(257).is_err());
        assert!(limits.assert_shift(-1).is_err());
    }
}
