//! Single-stepping and breakpoint support on top of the engine.

use std::collections::HashSet;

use crate::virtual_machine::engine::{ExecutionEngine, VMState};
use crate::virtual_machine::script::Script;

/// Drives an [`ExecutionEngine`] one instruction at a time.
///
/// Breakpoints are keyed by script identity and offset, so two loads of
/// byte-identical scripts keep separate breakpoints. The debugger leaves
/// the engine in the `Break` state whenever it pauses; resuming clears
/// it.
pub struct Debugger<'a> {
    engine: &'a mut ExecutionEngine,
    break_points: HashSet<(usize, usize)>,
}

impl<'a> Debugger<'a> {
    pub fn new(engine: &'a mut ExecutionEngine) -> Self {
        Self {
            engine,
            break_points: HashSet::new(),
        }
    }

    /// The engine under debug, for inspecting state between steps.
    pub fn engine(&self) -> &ExecutionEngine {
        self.engine
    }

    pub fn add_break_point(&mut self, script: &Script, position: usize) {
        self.break_points.insert((script.id(), position));
    }

    /// Removes a breakpoint; returns whether one was present.
    pub fn remove_break_point(&mut self, script: &Script, position: usize) -> bool {
        self.break_points.remove(&(script.id(), position))
    }

    fn at_break_point(&self) -> bool {
        if self.break_points.is_empty() {
            return false;
        }
        match self.engine.current_context() {
            Some(ctx) => self
                .break_points
                .contains(&(ctx.script().id(), ctx.instruction_pointer())),
            None => false,
        }
    }

    /// Runs until a breakpoint, HALT, or FAULT.
    pub fn execute(&mut self) -> VMState {
        if self.engine.state() == VMState::Break {
            self.engine.set_state(VMState::None);
        }
        while self.engine.state() == VMState::None {
            self.engine.execute_next();
            if self.engine.state() == VMState::None && self.at_break_point() {
                self.engine.set_state(VMState::Break);
            }
        }
        self.engine.state()
    }

    /// Executes exactly one instruction, stepping into calls.
    pub fn step_into(&mut self) -> VMState {
        match self.engine.state() {
            VMState::Halt | VMState::Fault => return self.engine.state(),
            VMState::Break => self.engine.set_state(VMState::None),
            VMState::None => {}
        }
        self.engine.execute_next();
        if self.engine.state() == VMState::None {
            self.engine.set_state(VMState::Break);
        }
        self.engine.state()
    }

    /// Executes one instruction, running any call it makes to completion.
    pub fn step_over(&mut self) -> VMState {
        self.step_until_depth(|depth, baseline| depth <= baseline)
    }

    /// Runs until the current context returns.
    pub fn step_out(&mut self) -> VMState {
        self.step_until_depth(|depth, baseline| depth < baseline)
    }

    fn step_until_depth(&mut self, done: fn(usize, usize) -> bool) -> VMState {
        match self.engine.state() {
            VMState::Halt | VMState::Fault => return self.engine.state(),
            VMState::Break => self.engine.set_state(VMState::None),
            VMState::None => {}
        }
        let baseline = self.engine.invocation_stack().len();
        loop {
            self.engine.execute_next();
            if self.engine.state() != VMState::None {
                break;
            }
            if done(self.engine.invocation_stack().len(), baseline) || self.at_break_point() {
                self.engine.set_state(VMState::Break);
                break;
            }
        }
        self.engine.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::opcode::OpCode;
    use num_traits::ToPrimitive;

    // 0: PUSH3  1: CALL +4 -> 5  3: ADD  4: RET  5: PUSH2  6: RET
    fn call_program() -> Script {
        Script::new(vec![
            OpCode::Push3 as u8,
            OpCode::Call as u8,
            4,
            OpCode::Add as u8,
            OpCode::Ret as u8,
            OpCode::Push2 as u8,
            OpCode::Ret as u8,
        ])
    }

    fn result_top(engine: &ExecutionEngine) -> i64 {
        engine
            .result_stack()
            .peek(0)
            .unwrap()
            .get_integer()
            .unwrap()
            .to_i64()
            .unwrap()
    }

    #[test]
    fn breakpoint_pauses_then_resumes() {
        let script = call_program();
        let mut engine = ExecutionEngine::default();
        engine.load_script(script.clone()).unwrap();
        let mut debugger = Debugger::new(&mut engine);
        debugger.add_break_point(&script, 3);
        assert_eq!(debugger.execute(), VMState::Break);
        let ctx = debugger.engine().current_context().unwrap();
        assert_eq!(ctx.instruction_pointer(), 3);
        assert_eq!(debugger.execute(), VMState::Halt);
        assert_eq!(result_top(debugger.engine()), 5);
    }

    #[test]
    fn removed_breakpoint_is_ignored() {
        let script = call_program();
        let mut engine = ExecutionEngine::default();
        engine.load_script(script.clone()).unwrap();
        let mut debugger = Debugger::new(&mut engine);
        debugger.add_break_point(&script, 3);
        assert!(debugger.remove_break_point(&script, 3));
        assert!(!debugger.remove_break_point(&script, 3));
        assert_eq!(debugger.execute(), VMState::Halt);
    }

    #[test]
    fn step_into_descends_into_the_callee() {
        let mut engine = ExecutionEngine::default();
        engine.load_script(call_program()).unwrap();
        let mut debugger = Debugger::new(&mut engine);
        assert_eq!(debugger.step_into(), VMState::Break); // PUSH3
        assert_eq!(debugger.step_into(), VMState::Break); // CALL
        let engine = debugger.engine();
        assert_eq!(engine.invocation_stack().len(), 2);
        assert_eq!(engine.current_context().unwrap().instruction_pointer(), 5);
    }

    #[test]
    fn step_over_completes_the_call() {
        let mut engine = ExecutionEngine::default();
        engine.load_script(call_program()).unwrap();
        let mut debugger = Debugger::new(&mut engine);
        assert_eq!(debugger.step_over(), VMState::Break); // PUSH3
        assert_eq!(debugger.step_over(), VMState::Break); // CALL + callee
        let engine = debugger.engine();
        assert_eq!(engine.invocation_stack().len(), 1);
        assert_eq!(engine.current_context().unwrap().instruction_pointer(), 3);
        assert_eq!(debugger.execute(), VMState::Halt);
        assert_eq!(result_top(debugger.engine()), 5);
    }

    #[test]
    fn step_out_returns_to_the_caller() {
        let mut engine = ExecutionEngine::default();
        engine.load_script(call_program()).unwrap();
        let mut debugger = Debugger::new(&mut engine);
        debugger.step_into(); // PUSH3
        debugger.step_into(); // CALL
        assert_eq!(debugger.engine().invocation_stack().len(), 2);
        assert_eq!(debugger.step_out(), VMState::Break);
        let engine = debugger.engine();
        assert_eq!(engine.invocation_stack().len(), 1);
        assert_eq!(engine.current_context().unwrap().instruction_pointer(), 3);
    }

    #[test]
    fn stepping_a_finished_engine_is_a_no_op() {
        let mut engine = ExecutionEngine::default();
        engine
            .load_script(Script::new(vec![OpCode::Push1 as u8, OpCode::Ret as u8]))
            .unwrap();
        engine.execute();
        let mut debugger = Debugger::new(&mut engine);
        assert_eq!(debugger.step_into(), VMState::Halt);
        assert_eq!(debugger.step_over(), VMState::Halt);
        assert_eq!(debugger.step_out(), VMState::Halt);
    }
}
