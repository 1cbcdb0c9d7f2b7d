//! Indexed variable storage for contexts.

use std::cell::RefCell;
use std::rc::Rc;

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::reference_counter::ReferenceCounter;
use crate::virtual_machine::stack_item::StackItem;

/// Fixed-size storage for static fields, locals, or arguments.
///
/// The size is set at initialization (INITSSLOT/INITSLOT) and never
/// changes. Every held item counts one stack reference until the slot is
/// cleared when its context unloads.
pub struct Slot {
    items: Vec<StackItem>,
    counter: Rc<RefCell<ReferenceCounter>>,
}

impl Slot {
    /// Builds a slot from existing items, taking a reference to each.
    pub fn new(items: Vec<StackItem>, counter: Rc<RefCell<ReferenceCounter>>) -> Self {
        {
            let mut rc = counter.borrow_mut();
            for item in &items {
                rc.add_stack_reference(item, 1);
            }
        }
        Self { items, counter }
    }

    /// Builds a slot of `count` nulls.
    pub fn with_count(count: usize, counter: Rc<RefCell<ReferenceCounter>>) -> Self {
        counter
            .borrow_mut()
            .add_stack_reference(&StackItem::Null, count);
        Self {
            items: vec![StackItem::Null; count],
            counter,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<StackItem, VMError> {
        self.items
            .get(index)
            .cloned()
            .ok_or(VMError::IndexOutOfRange {
                index: index as i64,
                size: self.items.len(),
            })
    }

    pub fn set(&mut self, index: usize, item: StackItem) -> Result<(), VMError> {
        if index >= self.items.len() {
            return Err(VMError::IndexOutOfRange {
                index: index as i64,
                size: self.items.len(),
            });
        }
        {
            let mut rc = self.counter.borrow_mut();
            rc.add_stack_reference(&item, 1);
            rc.remove_stack_reference(&self.items[index]);
        }
        self.items[index] = item;
        Ok(())
    }

    /// Drops the references held by this slot. Called when the owning
    /// context unloads.
    pub fn clear_references(&mut self) {
        let mut rc = self.counter.borrow_mut();
        for item in self.items.drain(..) {
            rc.remove_stack_reference(&item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> Rc<RefCell<ReferenceCounter>> {
        Rc::new(RefCell::new(ReferenceCounter::new()))
    }

    #[test]
    fn with_count_is_nulls() {
        let rc = counter();
        let slot = Slot::with_count(3, Rc::clone(&rc));
        assert_eq!(slot.len(), 3);
        assert!(slot.get(0).unwrap().is_null());
        assert_eq!(rc.borrow().count(), 3);
    }

    #[test]
    fn get_set_bounds() {
        let rc = counter();
        let mut slot = Slot::new(vec![StackItem::from(1i64)], Rc::clone(&rc));
        assert_eq!(rc.borrow().count(), 1);
        slot.set(0, StackItem::from(2i64)).unwrap();
        assert_eq!(rc.borrow().count(), 1);
        assert!(slot.get(1).is_err());
        assert!(slot.set(1, StackItem::Null).is_err());
    }

    #[test]
    fn clear_references_drops_count() {
        let rc = counter();
        let mut slot = Slot::new(
            vec![StackItem::from(1i64), StackItem::from(2i64)],
            Rc::clone(&rc),
        );
        assert_eq!(rc.borrow().count(), 2);
        slot.clear_references();
        assert_eq!(rc.borrow().count(), 0);
        assert!(slot.is_empty());
    }
}
