//! Per-context operand stack.

use std::cell::RefCell;
use std::rc::Rc;

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::reference_counter::ReferenceCounter;
use crate::virtual_machine::stack_item::StackItem;

/// A LIFO stack of items backing one invocation context.
///
/// Every push and pop is reported to the shared [`ReferenceCounter`], so
/// the engine-wide item limit covers all stacks at once. Bulk moves
/// between stacks sharing a counter transfer ownership without touching
/// the count.
pub struct EvaluationStack {
    /// Bottom at index 0, top at the end.
    items: Vec<StackItem>,
    counter: Rc<RefCell<ReferenceCounter>>,
}

impl EvaluationStack {
    pub fn new(counter: Rc<RefCell<ReferenceCounter>>) -> Self {
        Self {
            items: Vec::new(),
            counter,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates from the bottom of the stack to the top.
    pub fn iter(&self) -> impl Iterator<Item = &StackItem> {
        self.items.iter()
    }

    pub fn push(&mut self, item: StackItem) {
        self.counter.borrow_mut().add_stack_reference(&item, 1);
        self.items.push(item);
    }

    pub fn pop(&mut self) -> Result<StackItem, VMError> {
        let item = self.items.pop().ok_or(VMError::StackUnderflow)?;
        self.counter.borrow_mut().remove_stack_reference(&item);
        Ok(item)
    }

    /// Returns the item `index` positions below the top without removing
    /// it. Negative indices count from the bottom, so -1 is the bottom
    /// item.
    pub fn peek(&self, index: i64) -> Result<StackItem, VMError> {
        let len = self.items.len() as i64;
        let index = if index < 0 { index + len } else { index };
        if index < 0 || index >= len {
            return Err(VMError::StackUnderflow);
        }
        Ok(self.items[(len - 1 - index) as usize].clone())
    }

    /// Removes and returns the item `index` positions below the top.
    pub fn remove(&mut self, index: i64) -> Result<StackItem, VMError> {
        let len = self.items.len() as i64;
        if index < 0 || index >= len {
            return Err(VMError::StackUnderflow);
        }
        let item = self.items.remove((len - 1 - index) as usize);
        self.counter.borrow_mut().remove_stack_reference(&item);
        Ok(item)
    }

    /// Inserts `item` so that it ends up `index` positions below the top.
    pub fn insert(&mut self, index: usize, item: StackItem) -> Result<(), VMError> {
        if index > self.items.len() {
            return Err(VMError::StackUnderflow);
        }
        self.counter.borrow_mut().add_stack_reference(&item, 1);
        let at = self.items.len() - index;
        self.items.insert(at, item);
        Ok(())
    }

    /// Reverses the order of the top `n` items in place.
    pub fn reverse(&mut self, n: i64) -> Result<(), VMError> {
        let len = self.items.len() as i64;
        if n < 0 || n > len {
            return Err(VMError::IndexOutOfRange {
                index: n,
                size: self.items.len(),
            });
        }
        if n > 1 {
            let start = (len - n) as usize;
            self.items[start..].reverse();
        }
        Ok(())
    }

    /// Removes every item, dropping their references.
    pub fn clear(&mut self) {
        let mut counter = self.counter.borrow_mut();
        for item in self.items.drain(..) {
            counter.remove_stack_reference(&item);
        }
    }

    /// Moves the top `n` items to `other`, preserving their order.
    ///
    /// Both stacks must share a reference counter; ownership transfers,
    /// so the count is unchanged.
    pub fn move_to(&mut self, other: &mut EvaluationStack, n: usize) -> Result<(), VMError> {
        if n > self.items.len() {
            return Err(VMError::StackUnderflow);
        }
        let start = self.items.len() - n;
        other.items.extend(self.items.drain(start..));
        Ok(())
    }

    /// Moves every item to `other`, preserving their order.
    pub fn move_all_to(&mut self, other: &mut EvaluationStack) {
        other.items.append(&mut self.items);
    }

    /// Copies the top `n` items to `other`, adding references for the
    /// copies.
    pub fn copy_to(&mut self, other: &mut EvaluationStack, n: usize) -> Result<(), VMError> {
        if n > self.items.len() {
            return Err(VMError::StackUnderflow);
        }
        let start = self.items.len() - n;
        for item in &self.items[start..] {
            other.push(item.clone());
        }
        Ok(())
    }
}
