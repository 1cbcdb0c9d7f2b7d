//! Aggregate stack item accounting.
//!
//! The engine enforces its stack size limit against the total number of
//! live item references: everything on any evaluation stack or slot, plus
//! every child held by a compound. Value types are only ever counted;
//! buffers and compounds are additionally tracked by identity so that
//! components kept alive solely by internal references (including cycles)
//! can be found and released.

use std::collections::{HashMap, HashSet};

use crate::virtual_machine::stack_item::StackItem;

struct Tracked {
    /// Keeps the allocation reachable for the release traversal.
    item: StackItem,
    /// References from evaluation stacks and slots.
    stack_references: i64,
    /// References from parent compounds, keyed by parent identity.
    object_references: HashMap<usize, i64>,
}

/// Counts live stack item references across the whole engine.
#[derive(Default)]
pub struct ReferenceCounter {
    references: i64,
    tracked: HashMap<usize, Tracked>,
    /// Tracked items whose direct stack reference count dropped to zero;
    /// candidates for the next release pass.
    zero_referred: HashSet<usize>,
}

fn need_track(item: &StackItem) -> bool {
    matches!(
        item,
        StackItem::Buffer(_) | StackItem::Array(_) | StackItem::Struct(_) | StackItem::Map(_)
    )
}

impl ReferenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total live references.
    pub fn count(&self) -> usize {
        self.references.max(0) as usize
    }

    fn entry(&mut self, item: &StackItem) -> Option<&mut Tracked> {
        let id = item.identity()?;
        if !need_track(item) {
            return None;
        }
        Some(self.tracked.entry(id).or_insert_with(|| Tracked {
            item: item.clone(),
            stack_references: 0,
            object_references: HashMap::new(),
        }))
    }

    /// Records `count` new references to `item` from a stack or slot.
    pub fn add_stack_reference(&mut self, item: &StackItem, count: usize) {
        self.references += count as i64;
        if let Some(id) = item.identity() {
            if let Some(tracked) = self.entry(item) {
                tracked.stack_references += count as i64;
                self.zero_referred.remove(&id);
            }
        }
    }

    /// Records the removal of one stack or slot reference to `item`.
    pub fn remove_stack_reference(&mut self, item: &StackItem) {
        self.references -= 1;
        if let Some(id) = item.identity() {
            if let Some(tracked) = self.entry(item) {
                tracked.stack_references -= 1;
                if tracked.stack_references == 0 {
                    self.zero_referred.insert(id);
                }
            }
        }
    }

    /// Records that `parent` now holds `child`.
    pub fn add_reference(&mut self, child: &StackItem, parent: &StackItem) {
        self.references += 1;
        let Some(parent_id) = parent.identity() else {
            return;
        };
        if let Some(tracked) = self.entry(child) {
            *tracked.object_references.entry(parent_id).or_insert(0) += 1;
        }
    }

    /// Records that `parent` no longer holds `child`.
    pub fn remove_reference(&mut self, child: &StackItem, parent: &StackItem) {
        self.references -= 1;
        let Some(parent_id) = parent.identity() else {
            return;
        };
        if let Some(id) = child.identity() {
            if let Some(tracked) = self.entry(child) {
                if let Some(edges) = tracked.object_references.get_mut(&parent_id) {
                    *edges -= 1;
                    if *edges <= 0 {
                        tracked.object_references.remove(&parent_id);
                    }
                }
                if tracked.stack_references == 0 {
                    self.zero_referred.insert(id);
                }
            }
        }
    }

    /// Registers a freshly created compound and its initial child edges.
    ///
    /// The compound starts with zero stack references, so it is a release
    /// candidate until something pushes or stores it.
    pub fn register_compound(&mut self, item: &StackItem) {
        if let Some(id) = item.identity() {
            self.entry(item);
            self.zero_referred.insert(id);
            for child in item.sub_items() {
                self.add_reference(&child, item);
            }
        }
    }

    /// Releases every tracked component that is no longer reachable from
    /// a stack or slot, then returns the updated count.
    ///
    /// Reachability is computed by marking from all tracked items with
    /// direct stack references and traversing child edges; unmarked items
    /// are swept. Sweeping clears the released containers, which also
    /// breaks `Rc` cycles among them so the allocations actually drop.
    pub fn check_zero_referred(&mut self) -> usize {
        if self.zero_referred.is_empty() {
            return self.count();
        }
        self.zero_referred.clear();

        let mut live: HashSet<usize> = HashSet::new();
        let mut work: Vec<StackItem> = Vec::new();
        for (&id, tracked) in &self.tracked {
            if tracked.stack_references > 0 {
                live.insert(id);
                work.push(tracked.item.clone());
            }
        }
        while let Some(item) = work.pop() {
            for child in item.sub_items() {
                if let Some(id) = child.identity() {
                    if self.tracked.contains_key(&id) && live.insert(id) {
                        work.push(child);
                    }
                }
            }
        }

        let dead: Vec<usize> = self
            .tracked
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for id in &dead {
            if let Some(tracked) = self.tracked.remove(id) {
                self.references -= tracked.item.sub_items_count() as i64;
                for child in tracked.item.sub_items() {
                    if let Some(child_id) = child.identity() {
                        if let Some(child_tracked) = self.tracked.get_mut(&child_id) {
                            child_tracked.object_references.remove(id);
                        }
                    }
                }
                match &tracked.item {
                    StackItem::Array(inner) | StackItem::Struct(inner) => {
                        inner.borrow_mut().items.clear();
                    }
                    StackItem::Map(inner) => inner.borrow_mut().entries.clear(),
                    _ => {}
                }
            }
        }
        self.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_only_count() {
        let mut rc = ReferenceCounter::new();
        let item = StackItem::from(42i64);
        rc.add_stack_reference(&item, 1);
        rc.add_stack_reference(&item, 2);
        assert_eq!(rc.count(), 3);
        rc.remove_stack_reference(&item);
        rc.remove_stack_reference(&item);
        rc.remove_stack_reference(&item);
        assert_eq!(rc.count(), 0);
        // Nothing tracked, nothing to sweep.
        assert_eq!(rc.check_zero_referred(), 0);
    }

    #[test]
    fn compound_children_count() {
        let mut rc = ReferenceCounter::new();
        let arr = StackItem::new_array(
            &mut rc,
            vec![StackItem::from(1i64), StackItem::from(2i64)],
        );
        // Two child edges exist before the array is even pushed.
        assert_eq!(rc.count(), 2);
        rc.add_stack_reference(&arr, 1);
        assert_eq!(rc.count(), 3);
        rc.remove_stack_reference(&arr);
        // Popped but not yet swept.
        assert_eq!(rc.count(), 2);
        assert_eq!(rc.check_zero_referred(), 0);
    }

    #[test]
    fn nested_compounds_release_together() {
        let mut rc = ReferenceCounter::new();
        let inner = StackItem::new_array(&mut rc, vec![StackItem::from(1i64)]);
        let outer = StackItem::new_array(&mut rc, vec![inner]);
        rc.add_stack_reference(&outer, 1);
        assert_eq!(rc.count(), 3);
        rc.remove_stack_reference(&outer);
        assert_eq!(rc.check_zero_referred(), 0);
    }

    #[test]
    fn shared_child_survives_parent_release() {
        let mut rc = ReferenceCounter::new();
        let child = StackItem::new_array(&mut rc, vec![]);
        let parent = StackItem::new_array(&mut rc, vec![child.clone()]);
        rc.add_stack_reference(&parent, 1);
        rc.add_stack_reference(&child, 1);
        assert_eq!(rc.count(), 3);
        rc.remove_stack_reference(&parent);
        // The child is still on a stack; only the parent and its edge go.
        assert_eq!(rc.check_zero_referred(), 1);
        rc.remove_stack_reference(&child);
        assert_eq!(rc.check_zero_referred(), 0);
    }

    #[test]
    fn cyclic_component_is_released() {
        let mut rc = ReferenceCounter::new();
        let a = StackItem::new_array(&mut rc, vec![]);
        let b = StackItem::new_array(&mut rc, vec![]);
        // a -> b -> a
        if let (StackItem::Array(ia), StackItem::Array(ib)) = (&a, &b) {
            ia.borrow_mut().items.push(b.clone());
            ib.borrow_mut().items.push(a.clone());
        }
        rc.add_reference(&b, &a);
        rc.add_reference(&a, &b);
        rc.add_stack_reference(&a, 1);
        assert_eq!(rc.count(), 3);
        rc.remove_stack_reference(&a);
        // The cycle keeps both alive through object references, yet
        // nothing on a stack can reach them.
        assert_eq!(rc.check_zero_referred(), 0);
        // Containers were cleared so the Rc cycle is broken too.
        if let StackItem::Array(ia) = &a {
            assert!(ia.borrow().items.is_empty());
        }
    }

    #[test]
    fn buffer_tracking() {
        let mut rc = ReferenceCounter::new();
        let buf = StackItem::buffer(4);
        rc.add_stack_reference(&buf, 1);
        assert_eq!(rc.count(), 1);
        rc.remove_stack_reference(&buf);
        assert_eq!(rc.check_zero_referred(), 0);
    }

    #[test]
    fn duplicate_pushes_of_one_allocation() {
        let mut rc = ReferenceCounter::new();
        let arr = StackItem::new_array(&mut rc, vec![]);
        rc.add_stack_reference(&arr, 1);
        rc.add_stack_reference(&arr, 1);
        assert_eq!(rc.count(), 2);
        rc.remove_stack_reference(&arr);
        // One reference remains; the sweep must not release it.
        assert_eq!(rc.check_zero_referred(), 1);
        rc.remove_stack_reference(&arr);
        assert_eq!(rc.check_zero_referred(), 0);
    }
}
