//! Chainvm library.
//!
//! A deterministic, resource-bounded stack-based bytecode virtual machine
//! for smart-contract execution. The host loads a [`virtual_machine::Script`],
//! drives an [`virtual_machine::ExecutionEngine`] step by step, and inspects
//! the resulting stacks and fault state.

pub mod types;
pub mod utils;
pub mod virtual_machine;
