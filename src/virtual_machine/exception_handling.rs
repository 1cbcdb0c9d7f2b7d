//! Per-context try-block bookkeeping.

/// Which region of a try block is currently executing.
///
/// Transitions are monotonic: `Try` to `Catch` to `Finally`, never
/// backwards. A block without a catch region goes straight from `Try` to
/// `Finally` during unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionHandlingState {
    Try,
    Catch,
    Finally,
}

/// One active try block.
///
/// Offsets were resolved to absolute positions when TRY executed. The
/// continuation target (`end_pointer`) is filled in by ENDTRY before the
/// finally region runs, so ENDFINALLY knows where to resume.
#[derive(Debug, Clone)]
pub struct ExceptionHandlingContext {
    pub catch_pointer: Option<usize>,
    pub finally_pointer: Option<usize>,
    pub end_pointer: usize,
    pub state: ExceptionHandlingState,
}

impl ExceptionHandlingContext {
    pub fn new(catch_pointer: Option<usize>, finally_pointer: Option<usize>) -> Self {
        Self {
            catch_pointer,
            finally_pointer,
            end_pointer: 0,
            state: ExceptionHandlingState::Try,
        }
    }

    pub fn has_catch(&self) -> bool {
        self.catch_pointer.is_some()
    }

    pub fn has_finally(&self) -> bool {
        self.finally_pointer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions() {
        let ctx = ExceptionHandlingContext::new(Some(10), None);
        assert!(ctx.has_catch());
        assert!(!ctx.has_finally());
        assert_eq!(ctx.state, ExceptionHandlingState::Try);

        let ctx = ExceptionHandlingContext::new(None, Some(20));
        assert!(!ctx.has_catch());
        assert!(ctx.has_finally());
    }
}
