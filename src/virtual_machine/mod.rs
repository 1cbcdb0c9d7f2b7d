//! Stack-based bytecode virtual machine for smart contract execution.
//!
//! The VM executes contract scripts deterministically under explicit
//! resource limits: identical scripts, limits, and syscall behavior
//! always produce identical results.
//!
//! # Architecture
//!
//! - **Stack items**: dynamically typed [`stack_item::StackItem`]s with
//!   shared mutable compounds (arrays, structs, maps) and arbitrary
//!   precision integers capped at a 32-byte encoding
//! - **Instruction format**: one opcode byte plus a fixed immediate or a
//!   length-prefixed payload, decoded lazily and cached per script
//! - **Execution model**: an invocation stack of contexts, each with its
//!   own evaluation stack, variable slots, and try-block stack
//! - **Resource bounds**: aggregate item count, item size, invocation
//!   depth, try nesting, shifts, and comparison work are all limited
//!   through [`limits::ExecutionEngineLimits`]
//! - **Fault model**: limit and structure violations always fault;
//!   opcode-level faults can optionally re-enter the script as
//!   catchable exceptions
//!
//! # Modules
//!
//! - [`opcode`]: instruction set definition and opcode table
//! - [`instruction`]: operand decoding
//! - [`script`]: immutable script container with instruction caching
//! - [`stack_item`]: the item type system and conversions
//! - [`reference_counter`]: engine-wide item accounting and cycle sweeps
//! - [`evaluation_stack`] / [`slot`]: per-context operand and variable
//!   storage
//! - [`exception_handling`]: try-block bookkeeping
//! - [`engine`]: the execution engine itself
//! - [`debugger`]: breakpoints and single stepping
//! - [`errors`]: decode and execution error types

pub mod debugger;
pub mod engine;
pub mod errors;
pub mod evaluation_stack;
pub mod exception_handling;
pub mod instruction;
#[cfg(test)]
mod isa_static_check;
pub mod limits;
pub mod opcode;
pub mod reference_counter;
pub mod script;
pub mod slot;
pub mod stack_item;

pub use debugger::Debugger;
pub use engine::{ExecutionEngine, VMState};
pub use errors::VMError;
pub use limits::ExecutionEngineLimits;
pub use opcode::OpCode;
pub use script::Script;
pub use stack_item::{StackItem, StackItemType};
