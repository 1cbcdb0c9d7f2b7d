//! The execution engine: fetch, dispatch, and the opcode handlers.

pub mod context;

use std::cell::RefCell;
use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::error;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::evaluation_stack::EvaluationStack;
use crate::virtual_machine::exception_handling::{
    ExceptionHandlingContext, ExceptionHandlingState,
};
use crate::virtual_machine::instruction::Instruction;
use crate::virtual_machine::limits::ExecutionEngineLimits;
use crate::virtual_machine::opcode::OpCode;
use crate::virtual_machine::reference_counter::ReferenceCounter;
use crate::virtual_machine::script::Script;
use crate::virtual_machine::slot::Slot;
use crate::virtual_machine::stack_item::{MapEntry, PointerItem, StackItem, StackItemType};
use context::ExecutionContext;

/// Engine lifecycle state.
///
/// `None` means runnable; `Halt` and `Fault` are terminal; `Break` is a
/// debugger pause that [`ExecutionEngine::execute`] clears on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VMState {
    None,
    Halt,
    Fault,
    Break,
}

/// Host hook invoked by the SYSCALL opcode.
pub type SyscallHandler = Box<dyn FnMut(&mut ExecutionEngine, u32) -> Result<(), VMError>>;

/// A deterministic, resource-bounded bytecode interpreter.
///
/// The engine owns an invocation stack of [`ExecutionContext`] frames, a
/// result stack that receives the final frame's items on HALT, and a
/// [`ReferenceCounter`] shared by every stack and slot. All behavior is a
/// pure function of the loaded scripts, the configured limits, and
/// whatever the registered syscall handler does.
pub struct ExecutionEngine {
    state: VMState,
    /// Set by any handler that repositioned the instruction pointer, so
    /// the dispatch loop skips the default advance.
    is_jumping: bool,
    limits: ExecutionEngineLimits,
    counter: Rc<RefCell<ReferenceCounter>>,
    invocation_stack: Vec<ExecutionContext>,
    result_stack: EvaluationStack,
    uncaught_exception: Option<StackItem>,
    fault_error: Option<VMError>,
    syscall_handler: Option<SyscallHandler>,
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new(ExecutionEngineLimits::default())
    }
}

impl ExecutionEngine {
    pub fn new(limits: ExecutionEngineLimits) -> Self {
        let counter = Rc::new(RefCell::new(ReferenceCounter::new()));
        Self {
            state: VMState::None,
            is_jumping: false,
            limits,
            result_stack: EvaluationStack::new(Rc::clone(&counter)),
            counter,
            invocation_stack: Vec::new(),
            uncaught_exception: None,
            fault_error: None,
            syscall_handler: None,
        }
    }

    pub fn state(&self) -> VMState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: VMState) {
        self.state = state;
    }

    pub fn limits(&self) -> &ExecutionEngineLimits {
        &self.limits
    }

    /// Items left by the final RET, bottom first.
    pub fn result_stack(&self) -> &EvaluationStack {
        &self.result_stack
    }

    pub fn result_stack_mut(&mut self) -> &mut EvaluationStack {
        &mut self.result_stack
    }

    /// The payload of an exception that terminated the run, if any.
    pub fn uncaught_exception(&self) -> Option<&StackItem> {
        self.uncaught_exception.as_ref()
    }

    /// The error behind a FAULT state, if any.
    pub fn fault_error(&self) -> Option<&VMError> {
        self.fault_error.as_ref()
    }

    pub fn invocation_stack(&self) -> &[ExecutionContext] {
        &self.invocation_stack
    }

    pub fn current_context(&self) -> Option<&ExecutionContext> {
        self.invocation_stack.last()
    }

    /// Aggregate live item count, as enforced against `max_stack_size`.
    pub fn reference_count(&self) -> usize {
        self.counter.borrow().count()
    }

    /// Registers the SYSCALL hook.
    pub fn set_syscall_handler(
        &mut self,
        handler: impl FnMut(&mut ExecutionEngine, u32) -> Result<(), VMError> + 'static,
    ) {
        self.syscall_handler = Some(Box::new(handler));
    }

    /// Loads a script as a new entry frame.
    pub fn load_script(&mut self, script: Script) -> Result<(), VMError> {
        self.load_script_with_arguments(script, Vec::new())
    }

    /// Loads a script with a pre-populated argument slot, readable from
    /// the script through LDARG without an INITSLOT.
    pub fn load_script_with_arguments(
        &mut self,
        script: Script,
        arguments: Vec<StackItem>,
    ) -> Result<(), VMError> {
        if self.invocation_stack.len() >= self.limits.max_invocation_stack_size as usize {
            return Err(VMError::InvocationOverflow {
                max: self.limits.max_invocation_stack_size,
            });
        }
        let mut ctx = ExecutionContext::new(script, Rc::clone(&self.counter));
        if !arguments.is_empty() {
            ctx.arguments = Some(Slot::new(arguments, Rc::clone(&self.counter)));
        }
        self.invocation_stack.push(ctx);
        if self.state == VMState::Halt {
            self.state = VMState::None;
        }
        Ok(())
    }

    /// Runs until HALT or FAULT and returns the final state.
    pub fn execute(&mut self) -> VMState {
        if self.state == VMState::Break {
            self.state = VMState::None;
        }
        while self.state != VMState::Halt && self.state != VMState::Fault {
            self.execute_next();
        }
        self.state
    }

    /// Executes a single instruction.
    ///
    /// Faults never propagate: they either re-enter the script as a
    /// catchable exception or transition the engine to FAULT.
    pub fn execute_next(&mut self) {
        if self.invocation_stack.is_empty() {
            self.state = VMState::Halt;
            return;
        }
        if let Err(err) = self.execute_step() {
            self.on_error(err);
        }
        self.is_jumping = false;
    }

    fn execute_step(&mut self) -> Result<(), VMError> {
        // The executing frame is remembered by index: CALL pushes a new
        // frame on top, yet the default advance must apply to the caller.
        let frame = self.invocation_stack.len() - 1;
        let instruction = {
            let ctx = &self.invocation_stack[frame];
            if ctx.instruction_pointer() < ctx.script().len() {
                ctx.script().get_instruction(ctx.instruction_pointer())?
            } else {
                // Falling off the end behaves as RET.
                Rc::new(Instruction::ret())
            }
        };
        self.execute_instruction(&instruction)?;
        self.check_stack_size()?;
        if !self.is_jumping {
            if let Some(ctx) = self.invocation_stack.get_mut(frame) {
                let next = ctx.instruction_pointer() + instruction.size();
                ctx.set_instruction_pointer(next)?;
            }
        }
        Ok(())
    }

    fn on_error(&mut self, err: VMError) {
        if self.limits.catch_engine_exceptions && err.is_catchable() {
            let payload = StackItem::from(err.to_string().as_str());
            match self.execute_throw(payload) {
                Ok(()) => return,
                Err(inner) => {
                    self.fault(inner);
                    return;
                }
            }
        }
        self.fault(err);
    }

    fn fault(&mut self, err: VMError) {
        error!("vm fault: {}", err);
        self.fault_error = Some(err);
        self.state = VMState::Fault;
    }

    fn check_stack_size(&mut self) -> Result<(), VMError> {
        let max = self.limits.max_stack_size as usize;
        if self.counter.borrow().count() <= max {
            return Ok(());
        }
        // Over the limit: sweep unreachable components before judging.
        let count = self.counter.borrow_mut().check_zero_referred();
        if count > max {
            return Err(VMError::StackOverflow {
                count,
                max: self.limits.max_stack_size,
            });
        }
        Ok(())
    }

    // =========================
    // Context plumbing
    // =========================

    fn context(&self) -> Result<&ExecutionContext, VMError> {
        self.invocation_stack.last().ok_or(VMError::NoContext)
    }

    fn context_mut(&mut self) -> Result<&mut ExecutionContext, VMError> {
        self.invocation_stack.last_mut().ok_or(VMError::NoContext)
    }

    /// Pushes onto the current context's evaluation stack.
    pub fn push(&mut self, item: StackItem) -> Result<(), VMError> {
        self.context_mut()?.evaluation_stack.push(item);
        Ok(())
    }

    /// Pops from the current context's evaluation stack.
    pub fn pop(&mut self) -> Result<StackItem, VMError> {
        self.context_mut()?.evaluation_stack.pop()
    }

    /// Peeks into the current context's evaluation stack.
    pub fn peek(&self, index: i64) -> Result<StackItem, VMError> {
        self.context()?.evaluation_stack.peek(index)
    }

    fn push_int(&mut self, value: BigInt) -> Result<(), VMError> {
        let item = StackItem::integer(value)?;
        self.push(item)
    }

    fn push_bool(&mut self, value: bool) -> Result<(), VMError> {
        self.push(StackItem::Boolean(value))
    }

    fn pop_int(&mut self) -> Result<BigInt, VMError> {
        self.pop()?.get_integer()
    }

    fn pop_bool(&mut self) -> Result<bool, VMError> {
        self.pop()?.get_boolean()
    }

    /// Pops a non-negative count or index.
    fn pop_index(&mut self) -> Result<i64, VMError> {
        let value = self.pop_int()?;
        match value.to_i64() {
            Some(v) if v >= 0 => Ok(v),
            _ => Err(VMError::IndexOutOfRange {
                index: value.to_i64().unwrap_or(i64::MAX),
                size: 0,
            }),
        }
    }

    // =========================
    // Control transfer
    // =========================

    /// Bounds-checks `position` and, when it is inside the script,
    /// verifies it decodes as an instruction boundary. The script length
    /// itself is a valid position and behaves as an implicit RET.
    fn validate_position(&self, position: i64) -> Result<usize, VMError> {
        let ctx = self.context()?;
        if position < 0 || position as usize > ctx.script().len() {
            return Err(VMError::InvalidInstructionPointer(position.max(0) as usize));
        }
        let position = position as usize;
        if position < ctx.script().len() {
            ctx.script().get_instruction(position)?;
        }
        Ok(position)
    }

    fn execute_jump(&mut self, position: i64) -> Result<(), VMError> {
        let position = self.validate_position(position)?;
        self.context_mut()?.set_instruction_pointer(position)?;
        self.is_jumping = true;
        Ok(())
    }

    fn jump_rel(&mut self, offset: i64) -> Result<(), VMError> {
        let ip = self.context()?.instruction_pointer() as i64;
        self.execute_jump(ip + offset)
    }

    fn jump_compare(
        &mut self,
        offset: i64,
        pred: fn(&BigInt, &BigInt) -> bool,
    ) -> Result<(), VMError> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        if pred(&a, &b) {
            self.jump_rel(offset)?;
        }
        Ok(())
    }

    fn execute_call(&mut self, position: i64) -> Result<(), VMError> {
        if self.invocation_stack.len() >= self.limits.max_invocation_stack_size as usize {
            return Err(VMError::InvocationOverflow {
                max: self.limits.max_invocation_stack_size,
            });
        }
        let position = self.validate_position(position)?;
        let counter = Rc::clone(&self.counter);
        let fork = self.context()?.fork(position, counter);
        self.invocation_stack.push(fork);
        Ok(())
    }

    fn execute_ret(&mut self) -> Result<(), VMError> {
        let mut ctx = self.invocation_stack.pop().ok_or(VMError::NoContext)?;
        if let Some(caller) = self.invocation_stack.last_mut() {
            // Everything the callee left behind transfers to the caller
            // in order.
            ctx.evaluation_stack.move_all_to(&mut caller.evaluation_stack);
        } else {
            ctx.evaluation_stack.move_all_to(&mut self.result_stack);
            self.state = VMState::Halt;
        }
        self.unload_context(ctx);
        self.is_jumping = true;
        Ok(())
    }

    fn unload_context(&mut self, mut ctx: ExecutionContext) {
        ctx.evaluation_stack.clear();
        if let Some(slot) = ctx.local_variables.as_mut() {
            slot.clear_references();
        }
        if let Some(slot) = ctx.arguments.as_mut() {
            slot.clear_references();
        }
        // Statics are shared with every frame forked from the same load;
        // the last frame out clears them.
        if Rc::strong_count(&ctx.static_fields) == 1 {
            if let Some(slot) = ctx.static_fields.borrow_mut().as_mut() {
                slot.clear_references();
            }
        }
    }

    fn execute_try(&mut self, catch_offset: i64, finally_offset: i64) -> Result<(), VMError> {
        if catch_offset == 0 && finally_offset == 0 {
            return Err(VMError::BadScript(
                "try block needs a catch or finally region".into(),
            ));
        }
        let max = self.limits.max_try_nesting_depth;
        let ctx = self.context()?;
        if ctx.try_stack.len() >= max as usize {
            return Err(VMError::TryNestingTooDeep { max });
        }
        let ip = ctx.instruction_pointer() as i64;
        let len = ctx.script().len() as i64;
        let resolve = |offset: i64| -> Result<Option<usize>, VMError> {
            if offset == 0 {
                return Ok(None);
            }
            let target = ip + offset;
            if target < 0 || target > len {
                return Err(VMError::InvalidInstructionPointer(target.max(0) as usize));
            }
            Ok(Some(target as usize))
        };
        let catch_pointer = resolve(catch_offset)?;
        let finally_pointer = resolve(finally_offset)?;
        self.context_mut()?
            .try_stack
            .push(ExceptionHandlingContext::new(catch_pointer, finally_pointer));
        Ok(())
    }

    fn execute_end_try(&mut self, offset: i64) -> Result<(), VMError> {
        let ctx = self.context_mut()?;
        let ip = ctx.instruction_pointer() as i64;
        let len = ctx.script().len() as i64;
        let target = ip + offset;
        if target < 0 || target > len {
            return Err(VMError::InvalidInstructionPointer(target.max(0) as usize));
        }
        let tc = ctx.try_stack.last_mut().ok_or_else(|| {
            VMError::InvalidOperation("ENDTRY outside of a try block".into())
        })?;
        if tc.state == ExceptionHandlingState::Finally {
            return Err(VMError::InvalidOperation(
                "ENDTRY inside a finally region".into(),
            ));
        }
        let end = target as usize;
        if let Some(finally_pointer) = tc.finally_pointer {
            tc.state = ExceptionHandlingState::Finally;
            tc.end_pointer = end;
            ctx.set_instruction_pointer(finally_pointer)?;
        } else {
            ctx.try_stack.pop();
            ctx.set_instruction_pointer(end)?;
        }
        self.is_jumping = true;
        Ok(())
    }

    fn execute_end_finally(&mut self) -> Result<(), VMError> {
        let ctx = self.context_mut()?;
        let tc = ctx.try_stack.pop().ok_or_else(|| {
            VMError::InvalidOperation("ENDFINALLY outside of a try block".into())
        })?;
        if tc.state != ExceptionHandlingState::Finally {
            return Err(VMError::InvalidOperation(
                "ENDFINALLY outside of a finally region".into(),
            ));
        }
        if let Some(exception) = self.uncaught_exception.take() {
            // The finally ran on the way out of an unwind; resume it.
            self.execute_throw(exception)?;
        } else {
            self.context_mut()?.set_instruction_pointer(tc.end_pointer)?;
            self.is_jumping = true;
        }
        Ok(())
    }

    /// The single unwind path for THROW and re-raised engine faults.
    ///
    /// Walks frames from the current one outward. In each frame, try
    /// blocks are scanned innermost-first: blocks already in their
    /// finally region are abandoned; the first block still in its try
    /// region with a catch receives the exception; otherwise a pending
    /// finally region runs with the exception parked. Frames passed over
    /// are unloaded only once a handler is found. No handler anywhere is
    /// the unrecoverable [`VMError::UnhandledException`].
    fn execute_throw(&mut self, exception: StackItem) -> Result<(), VMError> {
        self.uncaught_exception = Some(exception);
        let mut pop = 0usize;
        for depth in (0..self.invocation_stack.len()).rev() {
            enum Action {
                Catch(usize),
                Finally(usize),
            }
            let action = loop {
                let ctx = &mut self.invocation_stack[depth];
                let (state, catch_pointer, finally_pointer) = match ctx.try_stack.last() {
                    None => break None,
                    Some(tc) => (tc.state, tc.catch_pointer, tc.finally_pointer),
                };
                if state == ExceptionHandlingState::Finally {
                    ctx.try_stack.pop();
                    continue;
                }
                if state == ExceptionHandlingState::Try {
                    if let Some(position) = catch_pointer {
                        if let Some(tc) = ctx.try_stack.last_mut() {
                            tc.state = ExceptionHandlingState::Catch;
                        }
                        break Some(Action::Catch(position));
                    }
                }
                if let Some(position) = finally_pointer {
                    if let Some(tc) = ctx.try_stack.last_mut() {
                        tc.state = ExceptionHandlingState::Finally;
                    }
                    break Some(Action::Finally(position));
                }
                // Neither region can run anymore; abandon it.
                ctx.try_stack.pop();
            };
            if let Some(action) = action {
                for _ in 0..pop {
                    if let Some(ctx) = self.invocation_stack.pop() {
                        self.unload_context(ctx);
                    }
                }
                match action {
                    Action::Catch(position) => {
                        self.context_mut()?.set_instruction_pointer(position)?;
                        let payload = self
                            .uncaught_exception
                            .take()
                            .ok_or(VMError::UnhandledException)?;
                        self.push(payload)?;
                    }
                    Action::Finally(position) => {
                        self.context_mut()?.set_instruction_pointer(position)?;
                    }
                }
                self.is_jumping = true;
                return Ok(());
            }
            pop += 1;
        }
        Err(VMError::UnhandledException)
    }

    fn execute_syscall(&mut self, id: u32) -> Result<(), VMError> {
        let mut handler = self
            .syscall_handler
            .take()
            .ok_or(VMError::SyscallNotFound(id))?;
        let result = handler(self, id);
        if self.syscall_handler.is_none() {
            self.syscall_handler = Some(handler);
        }
        result
    }

    // =========================
    // Helpers shared by compound handlers
    // =========================

    fn type_operand(instruction: &Instruction, allow_any: bool) -> Result<StackItemType, VMError> {
        let byte = instruction.token_u8();
        match StackItemType::from_byte(byte) {
            Some(StackItemType::Any) if !allow_any => Err(VMError::BadScript(format!(
                "type operand Any is not allowed for {}",
                instruction.opcode().mnemonic()
            ))),
            Some(ty) => Ok(ty),
            None => Err(VMError::BadScript(format!(
                "undefined type operand 0x{:02x}",
                byte
            ))),
        }
    }

    fn check_index(index: i64, len: usize) -> Result<usize, VMError> {
        if index < 0 || index as usize >= len {
            return Err(VMError::IndexOutOfRange { index, size: len });
        }
        Ok(index as usize)
    }

    fn slot_missing(which: &str) -> VMError {
        VMError::InvalidOperation(format!("{} slot not initialized", which))
    }

    /// Structs insert by value: replace them with a bounded clone.
    fn clone_if_struct(&self, item: StackItem) -> Result<StackItem, VMError> {
        if matches!(item, StackItem::Struct(_)) {
            let mut rc = self.counter.borrow_mut();
            item.struct_clone(&mut rc, &self.limits)
        } else {
            Ok(item)
        }
    }

    fn map_set(
        &mut self,
        target: &StackItem,
        key: StackItem,
        value: StackItem,
    ) -> Result<(), VMError> {
        let StackItem::Map(inner) = target else {
            return Err(VMError::TypeMismatch {
                expected: "Map",
                actual: target.type_name(),
            });
        };
        let hash = key.require_map_key()?;
        if inner.borrow().read_only {
            return Err(VMError::InvalidOperation("map is read-only".into()));
        }
        let existing = inner.borrow().index_of(&key)?;
        let mut rc = self.counter.borrow_mut();
        match existing {
            Some(i) => {
                let old = inner.borrow().entries[i].value.clone();
                inner.borrow_mut().entries[i].value = value.clone();
                rc.remove_reference(&old, target);
                rc.add_reference(&value, target);
            }
            None => {
                rc.add_reference(&key, target);
                rc.add_reference(&value, target);
                inner.borrow_mut().entries.push(MapEntry { hash, key, value });
            }
        }
        Ok(())
    }

    // =========================
    // Dispatch
    // =========================

    fn execute_instruction(&mut self, instruction: &Instruction) -> Result<(), VMError> {
        match instruction.opcode() {
            // ---------- constants ----------
            OpCode::PushInt8
            | OpCode::PushInt16
            | OpCode::PushInt32
            | OpCode::PushInt64
            | OpCode::PushInt128
            | OpCode::PushInt256 => {
                let value = BigInt::from_signed_bytes_le(instruction.operand());
                self.push(StackItem::Integer(value))?;
            }
            OpCode::PushA => {
                let ip = self.context()?.instruction_pointer() as i64;
                let position = self.validate_position(ip + instruction.token_i32() as i64)?;
                let script = self.context()?.script().clone();
                self.push(StackItem::Pointer(PointerItem { script, position }))?;
            }
            OpCode::PushNull => self.push(StackItem::Null)?,
            OpCode::PushData1 | OpCode::PushData2 | OpCode::PushData4 => {
                self.limits.assert_max_item_size(instruction.operand().len())?;
                self.push(StackItem::ByteString(instruction.operand().clone()))?;
            }
            OpCode::PushM1
            | OpCode::Push0
            | OpCode::Push1
            | OpCode::Push2
            | OpCode::Push3
            | OpCode::Push4
            | OpCode::Push5
            | OpCode::Push6
            | OpCode::Push7
            | OpCode::Push8
            | OpCode::Push9
            | OpCode::Push10
            | OpCode::Push11
            | OpCode::Push12
            | OpCode::Push13
            | OpCode::Push14
            | OpCode::Push15
            | OpCode::Push16 => {
                let value = instruction.opcode() as u8 as i64 - OpCode::Push0 as u8 as i64;
                self.push(StackItem::from(value))?;
            }

            // ---------- flow control ----------
            OpCode::Nop => {}
            OpCode::Jmp => self.jump_rel(instruction.token_i8() as i64)?,
            OpCode::JmpL => self.jump_rel(instruction.token_i32() as i64)?,
            OpCode::JmpIf => {
                let offset = instruction.token_i8() as i64;
                if self.pop_bool()? {
                    self.jump_rel(offset)?;
                }
            }
            OpCode::JmpIfL => {
                let offset = instruction.token_i32() as i64;
                if self.pop_bool()? {
                    self.jump_rel(offset)?;
                }
            }
            OpCode::JmpIfNot => {
                let offset = instruction.token_i8() as i64;
                if !self.pop_bool()? {
                    self.jump_rel(offset)?;
                }
            }
            OpCode::JmpIfNotL => {
                let offset = instruction.token_i32() as i64;
                if !self.pop_bool()? {
                    self.jump_rel(offset)?;
                }
            }
            OpCode::JmpEq => self.jump_compare(instruction.token_i8() as i64, |a, b| a == b)?,
            OpCode::JmpEqL => self.jump_compare(instruction.token_i32() as i64, |a, b| a == b)?,
            OpCode::JmpNe => self.jump_compare(instruction.token_i8() as i64, |a, b| a != b)?,
            OpCode::JmpNeL => self.jump_compare(instruction.token_i32() as i64, |a, b| a != b)?,
            OpCode::JmpGt => self.jump_compare(instruction.token_i8() as i64, |a, b| a > b)?,
            OpCode::JmpGtL => self.jump_compare(instruction.token_i32() as i64, |a, b| a > b)?,
            OpCode::JmpGe => self.jump_compare(instruction.token_i8() as i64, |a, b| a >= b)?,
            OpCode::JmpGeL => self.jump_compare(instruction.token_i32() as i64, |a, b| a >= b)?,
            OpCode::JmpLt => self.jump_compare(instruction.token_i8() as i64, |a, b| a < b)?,
            OpCode::JmpLtL => self.jump_compare(instruction.token_i32() as i64, |a, b| a < b)?,
            OpCode::JmpLe => self.jump_compare(instruction.token_i8() as i64, |a, b| a <= b)?,
            OpCode::JmpLeL => self.jump_compare(instruction.token_i32() as i64, |a, b| a <= b)?,
            OpCode::Call => {
                let ip = self.context()?.instruction_pointer() as i64;
                self.execute_call(ip + instruction.token_i8() as i64)?;
            }
            OpCode::CallL => {
                let ip = self.context()?.instruction_pointer() as i64;
                self.execute_call(ip + instruction.token_i32() as i64)?;
            }
            OpCode::CallA => {
                let item = self.pop()?;
                let StackItem::Pointer(pointer) = item else {
                    return Err(VMError::TypeMismatch {
                        expected: "Pointer",
                        actual: item.type_name(),
                    });
                };
                if !Script::same_script(&pointer.script, self.context()?.script()) {
                    return Err(VMError::InvalidOperation(
                        "pointer belongs to a different script".into(),
                    ));
                }
                self.execute_call(pointer.position as i64)?;
            }
            OpCode::Abort => return Err(VMError::Aborted),
            OpCode::Assert => {
                if !self.pop_bool()? {
                    return Err(VMError::AssertionFailed);
                }
            }
            OpCode::Throw => {
                let exception = self.pop()?;
                self.execute_throw(exception)?;
            }
            OpCode::Try => self.execute_try(
                instruction.token_i8() as i64,
                instruction.token_i8_1() as i64,
            )?,
            OpCode::TryL => self.execute_try(
                instruction.token_i32() as i64,
                instruction.token_i32_1() as i64,
            )?,
            OpCode::EndTry => self.execute_end_try(instruction.token_i8() as i64)?,
            OpCode::EndTryL => self.execute_end_try(instruction.token_i32() as i64)?,
            OpCode::EndFinally => self.execute_end_finally()?,
            OpCode::Ret => self.execute_ret()?,
            OpCode::Syscall => self.execute_syscall(instruction.token_u32())?,

            // ---------- stack manipulation ----------
            OpCode::Depth => {
                let depth = self.context()?.evaluation_stack.len();
                self.push(StackItem::from(depth as i64))?;
            }
            OpCode::Drop => {
                self.pop()?;
            }
            OpCode::Nip => {
                self.context_mut()?.evaluation_stack.remove(1)?;
            }
            OpCode::XDrop => {
                let n = self.pop_index()?;
                self.context_mut()?.evaluation_stack.remove(n)?;
            }
            OpCode::Clear => self.context_mut()?.evaluation_stack.clear(),
            OpCode::Dup => {
                let top = self.peek(0)?;
                self.push(top)?;
            }
            OpCode::Over => {
                let item = self.peek(1)?;
                self.push(item)?;
            }
            OpCode::Pick => {
                let n = self.pop_index()?;
                let item = self.peek(n)?;
                self.push(item)?;
            }
            OpCode::Tuck => {
                let top = self.peek(0)?;
                self.context_mut()?.evaluation_stack.insert(2, top)?;
            }
            OpCode::Swap => {
                let item = self.context_mut()?.evaluation_stack.remove(1)?;
                self.push(item)?;
            }
            OpCode::Rot => {
                let item = self.context_mut()?.evaluation_stack.remove(2)?;
                self.push(item)?;
            }
            OpCode::Roll => {
                let n = self.pop_index()?;
                if n > 0 {
                    let item = self.context_mut()?.evaluation_stack.remove(n)?;
                    self.push(item)?;
                }
            }
            OpCode::Reverse3 => self.context_mut()?.evaluation_stack.reverse(3)?,
            OpCode::Reverse4 => self.context_mut()?.evaluation_stack.reverse(4)?,
            OpCode::ReverseN => {
                let n = self.pop_index()?;
                self.context_mut()?.evaluation_stack.reverse(n)?;
            }

            // ---------- slots ----------
            OpCode::InitSSlot => {
                let count = instruction.token_u8() as usize;
                if count == 0 {
                    return Err(VMError::InvalidOperation(
                        "INITSSLOT needs at least one field".into(),
                    ));
                }
                let counter = Rc::clone(&self.counter);
                let ctx = self.context_mut()?;
                if ctx.static_fields.borrow().is_some() {
                    return Err(VMError::InvalidOperation(
                        "static field slot already initialized".into(),
                    ));
                }
                *ctx.static_fields.borrow_mut() = Some(Slot::with_count(count, counter));
            }
            OpCode::InitSlot => {
                let locals = instruction.token_u8() as usize;
                let args = instruction.token_u8_1() as usize;
                if locals == 0 && args == 0 {
                    return Err(VMError::InvalidOperation(
                        "INITSLOT with zero locals and zero arguments".into(),
                    ));
                }
                if self.context()?.local_variables.is_some() {
                    return Err(VMError::InvalidOperation(
                        "local variable slot already initialized".into(),
                    ));
                }
                if args > 0 && self.context()?.arguments.is_some() {
                    return Err(VMError::InvalidOperation(
                        "argument slot already initialized".into(),
                    ));
                }
                let counter = Rc::clone(&self.counter);
                if locals > 0 {
                    let slot = Slot::with_count(locals, Rc::clone(&counter));
                    self.context_mut()?.local_variables = Some(slot);
                }
                if args > 0 {
                    // The top of the stack becomes argument 0.
                    let mut items = Vec::with_capacity(args);
                    for _ in 0..args {
                        items.push(self.pop()?);
                    }
                    let slot = Slot::new(items, counter);
                    self.context_mut()?.arguments = Some(slot);
                }
            }
            OpCode::LdSFld => {
                let index = instruction.token_u8() as usize;
                let item = {
                    let ctx = self.context()?;
                    let fields = ctx.static_fields.borrow();
                    fields
                        .as_ref()
                        .ok_or_else(|| Self::slot_missing("static field"))?
                        .get(index)?
                };
                self.push(item)?;
            }
            OpCode::StSFld => {
                let index = instruction.token_u8() as usize;
                let item = self.pop()?;
                let ctx = self.context_mut()?;
                ctx.static_fields
                    .borrow_mut()
                    .as_mut()
                    .ok_or_else(|| Self::slot_missing("static field"))?
                    .set(index, item)?;
            }
            OpCode::LdLoc => {
                let index = instruction.token_u8() as usize;
                let item = self
                    .context()?
                    .local_variables
                    .as_ref()
                    .ok_or_else(|| Self::slot_missing("local variable"))?
                    .get(index)?;
                self.push(item)?;
            }
            OpCode::StLoc => {
                let index = instruction.token_u8() as usize;
                let item = self.pop()?;
                self.context_mut()?
                    .local_variables
                    .as_mut()
                    .ok_or_else(|| Self::slot_missing("local variable"))?
                    .set(index, item)?;
            }
            OpCode::LdArg => {
                let index = instruction.token_u8() as usize;
                let item = self
                    .context()?
                    .arguments
                    .as_ref()
                    .ok_or_else(|| Self::slot_missing("argument"))?
                    .get(index)?;
                self.push(item)?;
            }
            OpCode::StArg => {
                let index = instruction.token_u8() as usize;
                let item = self.pop()?;
                self.context_mut()?
                    .arguments
                    .as_mut()
                    .ok_or_else(|| Self::slot_missing("argument"))?
                    .set(index, item)?;
            }

            // ---------- splice ----------
            OpCode::NewBuffer => {
                let n = self.pop_index()?;
                self.limits.assert_max_item_size(n as usize)?;
                self.push(StackItem::buffer(n as usize))?;
            }
            OpCode::Cat => {
                let x2 = self.pop()?.get_bytes()?;
                let x1 = self.pop()?.get_bytes()?;
                let total = x1.len() + x2.len();
                self.limits.assert_max_item_size(total)?;
                let mut data = Vec::with_capacity(total);
                data.extend_from_slice(&x1);
                data.extend_from_slice(&x2);
                self.push(StackItem::Buffer(Rc::new(RefCell::new(data))))?;
            }
            OpCode::SubStr => {
                let count = self.pop_index()?;
                let index = self.pop_index()?;
                let data = self.pop()?.get_bytes()?;
                let end = index.checked_add(count).ok_or(VMError::IndexOutOfRange {
                    index: i64::MAX,
                    size: 0,
                })?;
                if end as usize > data.len() {
                    return Err(VMError::IndexOutOfRange {
                        index: end,
                        size: data.len(),
                    });
                }
                self.push(StackItem::buffer_from(
                    &data[index as usize..end as usize],
                ))?;
            }
            OpCode::Left => {
                let count = self.pop_index()?;
                let data = self.pop()?.get_bytes()?;
                if count as usize > data.len() {
                    return Err(VMError::IndexOutOfRange {
                        index: count,
                        size: data.len(),
                    });
                }
                self.push(StackItem::from(&data[..count as usize]))?;
            }
            OpCode::Right => {
                let count = self.pop_index()?;
                let data = self.pop()?.get_bytes()?;
                if count as usize > data.len() {
                    return Err(VMError::IndexOutOfRange {
                        index: count,
                        size: data.len(),
                    });
                }
                self.push(StackItem::from(&data[data.len() - count as usize..]))?;
            }

            // ---------- bitwise logic ----------
            OpCode::Invert => {
                let x = self.pop_int()?;
                self.push_int(-x - 1)?;
            }
            OpCode::And => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int(a & b)?;
            }
            OpCode::Or => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int(a | b)?;
            }
            OpCode::Xor => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int(a ^ b)?;
            }
            OpCode::Equal => {
                let b = self.pop()?;
                let a = self.pop()?;
                let eq = a.equals_with_limits(&b, &self.limits)?;
                self.push_bool(eq)?;
            }
            OpCode::NotEqual => {
                let b = self.pop()?;
                let a = self.pop()?;
                let eq = a.equals_with_limits(&b, &self.limits)?;
                self.push_bool(!eq)?;
            }

            // ---------- arithmetic ----------
            OpCode::Sign => {
                let x = self.pop_int()?;
                self.push_int(x.signum())?;
            }
            OpCode::Abs => {
                let x = self.pop_int()?;
                self.push_int(x.abs())?;
            }
            OpCode::Negate => {
                let x = self.pop_int()?;
                self.push_int(-x)?;
            }
            OpCode::Inc => {
                let x = self.pop_int()?;
                self.push_int(x + 1)?;
            }
            OpCode::Dec => {
                let x = self.pop_int()?;
                self.push_int(x - 1)?;
            }
            OpCode::Add => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int(a + b)?;
            }
            OpCode::Sub => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int(a - b)?;
            }
            OpCode::Mul => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int(a * b)?;
            }
            OpCode::Div => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                if b.is_zero() {
                    return Err(VMError::DivisionByZero);
                }
                self.push_int(a / b)?;
            }
            OpCode::Mod => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                if b.is_zero() {
                    return Err(VMError::DivisionByZero);
                }
                self.push_int(a % b)?;
            }
            OpCode::Shl => {
                let shift = self.pop_int()?.to_i64().unwrap_or(i64::MAX);
                self.limits.assert_shift(shift)?;
                if shift != 0 {
                    let x = self.pop_int()?;
                    self.push_int(x << shift as usize)?;
                }
            }
            OpCode::Shr => {
                let shift = self.pop_int()?.to_i64().unwrap_or(i64::MAX);
                self.limits.assert_shift(shift)?;
                if shift != 0 {
                    let x = self.pop_int()?;
                    self.push_int(x >> shift as usize)?;
                }
            }
            OpCode::Not => {
                let x = self.pop_bool()?;
                self.push_bool(!x)?;
            }
            OpCode::BoolAnd => {
                let b = self.pop_bool()?;
                let a = self.pop_bool()?;
                self.push_bool(a && b)?;
            }
            OpCode::BoolOr => {
                let b = self.pop_bool()?;
                let a = self.pop_bool()?;
                self.push_bool(a || b)?;
            }
            OpCode::Nz => {
                let x = self.pop_int()?;
                self.push_bool(!x.is_zero())?;
            }
            OpCode::NumEqual => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_bool(a == b)?;
            }
            OpCode::NumNotEqual => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_bool(a != b)?;
            }
            OpCode::Lt => self.compare_op(|a, b| a < b)?,
            OpCode::Le => self.compare_op(|a, b| a <= b)?,
            OpCode::Gt => self.compare_op(|a, b| a > b)?,
            OpCode::Ge => self.compare_op(|a, b| a >= b)?,
            OpCode::Min => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int(a.min(b))?;
            }
            OpCode::Max => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int(a.max(b))?;
            }
            OpCode::Within => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                let x = self.pop_int()?;
                self.push_bool(a <= x && x < b)?;
            }

            // ---------- compound types ----------
            OpCode::PackMap => {
                let n = self.pop_index()?;
                if n as usize > self.context()?.evaluation_stack.len() / 2 {
                    return Err(VMError::StackUnderflow);
                }
                let map = {
                    let mut rc = self.counter.borrow_mut();
                    StackItem::new_map(&mut rc)
                };
                for _ in 0..n {
                    let key = self.pop()?;
                    let value = self.pop()?;
                    self.map_set(&map, key, value)?;
                }
                self.push(map)?;
            }
            OpCode::Pack | OpCode::PackStruct => {
                let n = self.pop_index()? as usize;
                if n > self.context()?.evaluation_stack.len() {
                    return Err(VMError::StackUnderflow);
                }
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.pop()?);
                }
                let packed = {
                    let mut rc = self.counter.borrow_mut();
                    if instruction.opcode() == OpCode::PackStruct {
                        StackItem::new_struct(&mut rc, items)
                    } else {
                        StackItem::new_array(&mut rc, items)
                    }
                };
                self.push(packed)?;
            }
            OpCode::Unpack => {
                let compound = self.pop()?;
                match &compound {
                    StackItem::Array(inner) | StackItem::Struct(inner) => {
                        let items = inner.borrow().items.clone();
                        let n = items.len();
                        for item in items.into_iter().rev() {
                            self.push(item)?;
                        }
                        self.push(StackItem::from(n as i64))?;
                    }
                    StackItem::Map(inner) => {
                        let entries: Vec<(StackItem, StackItem)> = inner
                            .borrow()
                            .entries
                            .iter()
                            .map(|e| (e.key.clone(), e.value.clone()))
                            .collect();
                        let n = entries.len();
                        for (key, value) in entries.into_iter().rev() {
                            self.push(value)?;
                            self.push(key)?;
                        }
                        self.push(StackItem::from(n as i64))?;
                    }
                    other => {
                        return Err(VMError::TypeMismatch {
                            expected: "Array, Struct, or Map",
                            actual: other.type_name(),
                        })
                    }
                }
            }
            OpCode::NewArray0 | OpCode::NewStruct0 => {
                let item = {
                    let mut rc = self.counter.borrow_mut();
                    if instruction.opcode() == OpCode::NewStruct0 {
                        StackItem::new_struct(&mut rc, Vec::new())
                    } else {
                        StackItem::new_array(&mut rc, Vec::new())
                    }
                };
                self.push(item)?;
            }
            OpCode::NewArray | OpCode::NewStruct | OpCode::NewArrayT => {
                let default = if instruction.opcode() == OpCode::NewArrayT {
                    StackItem::default_of(Self::type_operand(instruction, true)?)
                } else {
                    StackItem::Null
                };
                let n = self.pop_index()? as usize;
                if n > self.limits.max_stack_size as usize {
                    return Err(VMError::StackOverflow {
                        count: n,
                        max: self.limits.max_stack_size,
                    });
                }
                let items = vec![default; n];
                let item = {
                    let mut rc = self.counter.borrow_mut();
                    if instruction.opcode() == OpCode::NewStruct {
                        StackItem::new_struct(&mut rc, items)
                    } else {
                        StackItem::new_array(&mut rc, items)
                    }
                };
                self.push(item)?;
            }
            OpCode::NewMap => {
                let map = {
                    let mut rc = self.counter.borrow_mut();
                    StackItem::new_map(&mut rc)
                };
                self.push(map)?;
            }
            OpCode::Size => {
                let item = self.pop()?;
                let size = match &item {
                    StackItem::Array(inner) | StackItem::Struct(inner) => {
                        inner.borrow().items.len()
                    }
                    StackItem::Map(inner) => inner.borrow().entries.len(),
                    StackItem::Buffer(data) => data.borrow().len(),
                    other => other.get_bytes()?.len(),
                };
                self.push(StackItem::from(size as i64))?;
            }
            OpCode::HasKey => {
                let key = self.pop()?;
                let collection = self.pop()?;
                let found = match &collection {
                    StackItem::Array(inner) | StackItem::Struct(inner) => {
                        let index = key.get_integer()?.to_i64().unwrap_or(i64::MAX);
                        if index < 0 {
                            return Err(VMError::IndexOutOfRange {
                                index,
                                size: inner.borrow().items.len(),
                            });
                        }
                        (index as usize) < inner.borrow().items.len()
                    }
                    StackItem::Map(inner) => {
                        key.require_map_key()?;
                        inner.borrow().index_of(&key)?.is_some()
                    }
                    StackItem::Buffer(data) => {
                        let index = key.get_integer()?.to_i64().unwrap_or(i64::MAX);
                        if index < 0 {
                            return Err(VMError::IndexOutOfRange {
                                index,
                                size: data.borrow().len(),
                            });
                        }
                        (index as usize) < data.borrow().len()
                    }
                    StackItem::ByteString(data) => {
                        let index = key.get_integer()?.to_i64().unwrap_or(i64::MAX);
                        if index < 0 {
                            return Err(VMError::IndexOutOfRange {
                                index,
                                size: data.len(),
                            });
                        }
                        (index as usize) < data.len()
                    }
                    other => {
                        return Err(VMError::TypeMismatch {
                            expected: "Array, Struct, Map, Buffer, or ByteString",
                            actual: other.type_name(),
                        })
                    }
                };
                self.push_bool(found)?;
            }
            OpCode::Keys => {
                let item = self.pop()?;
                let StackItem::Map(inner) = &item else {
                    return Err(VMError::TypeMismatch {
                        expected: "Map",
                        actual: item.type_name(),
                    });
                };
                let keys: Vec<StackItem> =
                    inner.borrow().entries.iter().map(|e| e.key.clone()).collect();
                let array = {
                    let mut rc = self.counter.borrow_mut();
                    StackItem::new_array(&mut rc, keys)
                };
                self.push(array)?;
            }
            OpCode::Values => {
                let item = self.pop()?;
                let values: Vec<StackItem> = match &item {
                    StackItem::Array(inner) | StackItem::Struct(inner) => {
                        inner.borrow().items.clone()
                    }
                    StackItem::Map(inner) => inner
                        .borrow()
                        .entries
                        .iter()
                        .map(|e| e.value.clone())
                        .collect(),
                    other => {
                        return Err(VMError::TypeMismatch {
                            expected: "Array, Struct, or Map",
                            actual: other.type_name(),
                        })
                    }
                };
                // Struct values copy out by value, like APPEND copies in.
                let mut copied = Vec::with_capacity(values.len());
                for value in values {
                    copied.push(self.clone_if_struct(value)?);
                }
                let array = {
                    let mut rc = self.counter.borrow_mut();
                    StackItem::new_array(&mut rc, copied)
                };
                self.push(array)?;
            }
            OpCode::PickItem => {
                let key = self.pop()?;
                let collection = self.pop()?;
                let picked = match &collection {
                    StackItem::Array(inner) | StackItem::Struct(inner) => {
                        let index = key.get_integer()?.to_i64().unwrap_or(i64::MAX);
                        let index = Self::check_index(index, inner.borrow().items.len())?;
                        inner.borrow().items[index].clone()
                    }
                    StackItem::Map(inner) => {
                        key.require_map_key()?;
                        let found = inner.borrow().index_of(&key)?;
                        match found {
                            Some(i) => inner.borrow().entries[i].value.clone(),
                            None => return Err(VMError::MapKeyNotFound),
                        }
                    }
                    other => {
                        let data = other.get_bytes()?;
                        let index = key.get_integer()?.to_i64().unwrap_or(i64::MAX);
                        let index = Self::check_index(index, data.len())?;
                        StackItem::from(data[index] as i64)
                    }
                };
                self.push(picked)?;
            }
            OpCode::Append => {
                let item = self.pop()?;
                let target = self.pop()?;
                let item = self.clone_if_struct(item)?;
                match &target {
                    StackItem::Array(inner) | StackItem::Struct(inner) => {
                        if inner.borrow().read_only {
                            return Err(VMError::InvalidOperation("array is read-only".into()));
                        }
                        inner.borrow_mut().items.push(item.clone());
                        self.counter.borrow_mut().add_reference(&item, &target);
                    }
                    other => {
                        return Err(VMError::TypeMismatch {
                            expected: "Array or Struct",
                            actual: other.type_name(),
                        })
                    }
                }
            }
            OpCode::SetItem => {
                let value = self.pop()?;
                let key = self.pop()?;
                let target = self.pop()?;
                let value = self.clone_if_struct(value)?;
                match &target {
                    StackItem::Array(inner) | StackItem::Struct(inner) => {
                        if inner.borrow().read_only {
                            return Err(VMError::InvalidOperation("array is read-only".into()));
                        }
                        let index = key.get_integer()?.to_i64().unwrap_or(i64::MAX);
                        let index = Self::check_index(index, inner.borrow().items.len())?;
                        let old = inner.borrow().items[index].clone();
                        inner.borrow_mut().items[index] = value.clone();
                        let mut rc = self.counter.borrow_mut();
                        rc.remove_reference(&old, &target);
                        rc.add_reference(&value, &target);
                    }
                    StackItem::Map(_) => self.map_set(&target, key, value)?,
                    StackItem::Buffer(data) => {
                        let index = key.get_integer()?.to_i64().unwrap_or(i64::MAX);
                        let index = Self::check_index(index, data.borrow().len())?;
                        let byte = value.get_integer()?;
                        let byte = byte.to_i64().filter(|b| (0..=255).contains(b)).ok_or(
                            VMError::InvalidOperation("buffer bytes take values 0..=255".into()),
                        )?;
                        data.borrow_mut()[index] = byte as u8;
                    }
                    other => {
                        return Err(VMError::TypeMismatch {
                            expected: "Array, Struct, Map, or Buffer",
                            actual: other.type_name(),
                        })
                    }
                }
            }
            OpCode::ReverseItems => {
                let item = self.pop()?;
                match &item {
                    StackItem::Array(inner) | StackItem::Struct(inner) => {
                        if inner.borrow().read_only {
                            return Err(VMError::InvalidOperation("array is read-only".into()));
                        }
                        inner.borrow_mut().items.reverse();
                    }
                    StackItem::Buffer(data) => data.borrow_mut().reverse(),
                    other => {
                        return Err(VMError::TypeMismatch {
                            expected: "Array, Struct, or Buffer",
                            actual: other.type_name(),
                        })
                    }
                }
            }
            OpCode::Remove => {
                let key = self.pop()?;
                let target = self.pop()?;
                match &target {
                    StackItem::Array(inner) | StackItem::Struct(inner) => {
                        if inner.borrow().read_only {
                            return Err(VMError::InvalidOperation("array is read-only".into()));
                        }
                        let index = key.get_integer()?.to_i64().unwrap_or(i64::MAX);
                        let index = Self::check_index(index, inner.borrow().items.len())?;
                        let old = inner.borrow_mut().items.remove(index);
                        self.counter.borrow_mut().remove_reference(&old, &target);
                    }
                    StackItem::Map(inner) => {
                        key.require_map_key()?;
                        if inner.borrow().read_only {
                            return Err(VMError::InvalidOperation("map is read-only".into()));
                        }
                        let found = inner.borrow().index_of(&key)?;
                        if let Some(i) = found {
                            let entry = inner.borrow_mut().entries.remove(i);
                            let mut rc = self.counter.borrow_mut();
                            rc.remove_reference(&entry.key, &target);
                            rc.remove_reference(&entry.value, &target);
                        }
                    }
                    other => {
                        return Err(VMError::TypeMismatch {
                            expected: "Array, Struct, or Map",
                            actual: other.type_name(),
                        })
                    }
                }
            }
            OpCode::ClearItems => {
                let target = self.pop()?;
                match &target {
                    StackItem::Array(_) | StackItem::Struct(_) | StackItem::Map(_) => {
                        let read_only = match &target {
                            StackItem::Array(inner) | StackItem::Struct(inner) => {
                                inner.borrow().read_only
                            }
                            StackItem::Map(inner) => inner.borrow().read_only,
                            _ => false,
                        };
                        if read_only {
                            return Err(VMError::InvalidOperation(
                                "compound is read-only".into(),
                            ));
                        }
                        let children = target.sub_items();
                        let mut rc = self.counter.borrow_mut();
                        for child in &children {
                            rc.remove_reference(child, &target);
                        }
                        drop(rc);
                        match &target {
                            StackItem::Array(inner) | StackItem::Struct(inner) => {
                                inner.borrow_mut().items.clear()
                            }
                            StackItem::Map(inner) => inner.borrow_mut().entries.clear(),
                            _ => {}
                        }
                    }
                    other => {
                        return Err(VMError::TypeMismatch {
                            expected: "Array, Struct, or Map",
                            actual: other.type_name(),
                        })
                    }
                }
            }
            OpCode::PopItem => {
                let target = self.pop()?;
                match &target {
                    StackItem::Array(inner) | StackItem::Struct(inner) => {
                        if inner.borrow().read_only {
                            return Err(VMError::InvalidOperation("array is read-only".into()));
                        }
                        let popped = inner.borrow_mut().items.pop().ok_or(
                            VMError::IndexOutOfRange {
                                index: -1,
                                size: 0,
                            },
                        )?;
                        self.counter.borrow_mut().remove_reference(&popped, &target);
                        self.push(popped)?;
                    }
                    other => {
                        return Err(VMError::TypeMismatch {
                            expected: "Array or Struct",
                            actual: other.type_name(),
                        })
                    }
                }
            }

            // ---------- types ----------
            OpCode::IsNull => {
                let item = self.pop()?;
                self.push_bool(item.is_null())?;
            }
            OpCode::IsType => {
                let ty = Self::type_operand(instruction, false)?;
                let item = self.pop()?;
                self.push_bool(item.item_type() == ty)?;
            }
            OpCode::Convert => {
                let ty = Self::type_operand(instruction, false)?;
                let item = self.pop()?;
                let converted = {
                    let mut rc = self.counter.borrow_mut();
                    item.convert_to(ty, &mut rc)?
                };
                self.push(converted)?;
            }
        }
        Ok(())
    }

    /// LT/LE/GT/GE: null on either side compares as false.
    fn compare_op(&mut self, pred: fn(&BigInt, &BigInt) -> bool) -> Result<(), VMError> {
        let b = self.pop()?;
        let a = self.pop()?;
        if a.is_null() || b.is_null() {
            return self.push_bool(false);
        }
        let b = b.get_integer()?;
        let a = a.get_integer()?;
        self.push_bool(pred(&a, &b))
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("state", &self.state)
            .field("invocation_depth", &self.invocation_stack.len())
            .field("reference_count", &self.counter.borrow().count())
            .finish()
    }
}
