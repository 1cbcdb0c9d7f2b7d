//! Invocation context: one frame of the invocation stack.

use std::cell::RefCell;
use std::rc::Rc;

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::evaluation_stack::EvaluationStack;
use crate::virtual_machine::exception_handling::ExceptionHandlingContext;
use crate::virtual_machine::reference_counter::ReferenceCounter;
use crate::virtual_machine::script::Script;
use crate::virtual_machine::slot::Slot;

/// A single frame: a script position, an operand stack, and variable
/// slots.
///
/// Frames forked by CALL share the script and the static field slot with
/// their parent; the evaluation stack, locals, arguments, and try stack
/// are always private to the frame.
pub struct ExecutionContext {
    script: Script,
    instruction_pointer: usize,
    pub(crate) evaluation_stack: EvaluationStack,
    /// Shared across every frame forked from the same load. The inner
    /// option is set by INITSSLOT, wherever it runs first.
    pub(crate) static_fields: Rc<RefCell<Option<Slot>>>,
    pub(crate) local_variables: Option<Slot>,
    pub(crate) arguments: Option<Slot>,
    pub(crate) try_stack: Vec<ExceptionHandlingContext>,
}

impl ExecutionContext {
    /// Builds the entry frame for a loaded script.
    pub(crate) fn new(script: Script, counter: Rc<RefCell<ReferenceCounter>>) -> Self {
        Self {
            script,
            instruction_pointer: 0,
            evaluation_stack: EvaluationStack::new(counter),
            static_fields: Rc::new(RefCell::new(None)),
            local_variables: None,
            arguments: None,
            try_stack: Vec::new(),
        }
    }

    /// Builds a callee frame starting at `position`, sharing the script
    /// and static fields but nothing else.
    pub(crate) fn fork(&self, position: usize, counter: Rc<RefCell<ReferenceCounter>>) -> Self {
        Self {
            script: self.script.clone(),
            instruction_pointer: position,
            evaluation_stack: EvaluationStack::new(counter),
            static_fields: Rc::clone(&self.static_fields),
            local_variables: None,
            arguments: None,
            try_stack: Vec::new(),
        }
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn instruction_pointer(&self) -> usize {
        self.instruction_pointer
    }

    /// Repositions the frame. A position equal to the script length is
    /// allowed and behaves as an implicit RET when reached.
    pub(crate) fn set_instruction_pointer(&mut self, position: usize) -> Result<(), VMError> {
        if position > self.script.len() {
            return Err(VMError::InvalidInstructionPointer(position));
        }
        self.instruction_pointer = position;
        Ok(())
    }

    /// The operand stack of this frame.
    pub fn evaluation_stack(&self) -> &EvaluationStack {
        &self.evaluation_stack
    }

    /// Current try-block nesting depth.
    pub fn try_depth(&self) -> usize {
        self.try_stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_shares_script_and_statics() {
        let counter = Rc::new(RefCell::new(ReferenceCounter::new()));
        let ctx = ExecutionContext::new(Script::new(vec![0x21, 0x21]), Rc::clone(&counter));
        let fork = ctx.fork(1, Rc::clone(&counter));
        assert!(Script::same_script(ctx.script(), fork.script()));
        assert!(Rc::ptr_eq(&ctx.static_fields, &fork.static_fields));
        assert_eq!(fork.instruction_pointer(), 1);
        assert_eq!(fork.evaluation_stack().len(), 0);
    }

    #[test]
    fn pointer_bounds() {
        let counter = Rc::new(RefCell::new(ReferenceCounter::new()));
        let mut ctx = ExecutionContext::new(Script::new(vec![0x21, 0x21]), counter);
        assert!(ctx.set_instruction_pointer(2).is_ok());
        assert!(matches!(
            ctx.set_instruction_pointer(3),
            Err(VMError::InvalidInstructionPointer(3))
        ));
    }
}
