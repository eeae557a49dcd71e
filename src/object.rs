//! Explicit-stack reference counting.
//!
//! Grounded on `original_source/drivers/acpi/common/cmdelete.c` and
//! `include/acobject.h`: the union-of-structs internal object there carries a 16-bit
//! `reference_count` in its common header, and `Acpi_cm_update_ref_count`/`_delete_internal_obj`
//! walk the variant-specific contributors (package elements, handler chains, field containers -
//! see spec.md §3 "Ownership" and §4.3) using a worklist rather than recursing, specifically
//! because packages can reference themselves by index (spec.md §8 invariant 9).
//!
//! `AmlValue` itself (`value.rs`) is managed with ordinary `Arc` reference counting, which is
//! idiomatic and memory-safe on its own. This module exists as the *auditing* layer described by
//! spec.md's design notes: something that can walk an object graph and update/report reference
//! counts using an explicit stack, for cases (tests, debugging, invariant checking) where we want
//! the C implementation's exact bookkeeping shape rather than relying on `Arc`'s built-in count.
//! `Node::children` is the generalisation of spec.md §4.3's "variant-specific contributors" list.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU16, Ordering};

/// One action applied to a popped `(node, action)` pair, mirroring spec.md §4.3.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RefAction {
    Increment,
    Decrement,
    /// Zeroes the count and disposes regardless of how many references are outstanding.
    ForceDelete,
}

/// A node in an object graph that can be walked for reference-count bookkeeping. Implemented by
/// test/auditing wrappers around real objects (packages, handler chains, field containers).
pub trait GraphNode {
    /// The node's own refcount cell.
    fn count(&self) -> &AtomicU16;

    /// Direct children this node contributes references to, per spec.md §3/§4.3 (e.g. a package's
    /// elements, a device's handler chain, a region's body-evaluator method).
    fn children(&self) -> Vec<Arc<dyn GraphNode>>;

    /// Called when the node's count reaches zero via `Decrement`, or unconditionally via
    /// `ForceDelete`. Default is a no-op; test doubles can observe teardown order through this.
    fn on_delete(&self) {}
}

/// Applies `action` to `root` and every object reachable from it, using an explicit worklist
/// instead of recursion. Each `(node, action)` pair is pushed and popped at most once per distinct
/// node reached via that action, so a package that contains a reference to itself (spec.md §8
/// invariant 9) terminates rather than looping forever.
pub fn update_ref_count(root: Arc<dyn GraphNode>, action: RefAction) {
    let mut stack: Vec<(Arc<dyn GraphNode>, RefAction)> = alloc::vec![(root, action)];
    let mut visited_this_action: Vec<*const ()> = Vec::new();

    while let Some((node, action)) = stack.pop() {
        let identity = Arc::as_ptr(&node) as *const ();
        if visited_this_action.contains(&identity) {
            continue;
        }
        visited_this_action.push(identity);

        let became_zero = match action {
            RefAction::Increment => {
                node.count().fetch_add(1, Ordering::AcqRel);
                false
            }
            RefAction::Decrement => {
                let previous = node.count().fetch_sub(1, Ordering::AcqRel);
                debug_assert!(previous > 0, "reference count underflow");
                previous == 1
            }
            RefAction::ForceDelete => {
                node.count().store(0, Ordering::Release);
                true
            }
        };

        if action == RefAction::Increment {
            for child in node.children() {
                stack.push((child, RefAction::Increment));
            }
            continue;
        }

        if became_zero {
            node.on_delete();
            for child in node.children() {
                stack.push((child, RefAction::Decrement));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use core::sync::atomic::AtomicUsize;

    struct TestNode {
        count: AtomicU16,
        children: Vec<Arc<dyn GraphNode>>,
        deletes: Arc<AtomicUsize>,
    }

    impl GraphNode for TestNode {
        fn count(&self) -> &AtomicU16 {
            &self.count
        }

        fn children(&self) -> Vec<Arc<dyn GraphNode>> {
            self.children.clone()
        }

        fn on_delete(&self) {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn invariant2_increment_then_decrement_is_a_no_op() {
        let deletes = Arc::new(AtomicUsize::new(0));
        let leaf: Arc<dyn GraphNode> =
            Arc::new(TestNode { count: AtomicU16::new(1), children: vec![], deletes: deletes.clone() });

        update_ref_count(leaf.clone(), RefAction::Increment);
        assert_eq!(leaf.count().load(Ordering::SeqCst), 2);
        update_ref_count(leaf.clone(), RefAction::Decrement);
        assert_eq!(leaf.count().load(Ordering::SeqCst), 1);
        assert_eq!(deletes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invariant9_self_referencing_package_terminates() {
        // A node that (via `Arc`) is its own child - models a package containing an index
        // reference to itself. The walker must visit it once per action and terminate.
        struct SelfRef {
            count: AtomicU16,
            me: spin::Once<Arc<dyn GraphNode>>,
        }

        impl GraphNode for SelfRef {
            fn count(&self) -> &AtomicU16 {
                &self.count
            }

            fn children(&self) -> Vec<Arc<dyn GraphNode>> {
                match self.me.get() {
                    Some(me) => vec![me.clone()],
                    None => vec![],
                }
            }
        }

        let node = Arc::new(SelfRef { count: AtomicU16::new(1), me: spin::Once::new() });
        let node_dyn: Arc<dyn GraphNode> = node.clone();
        node.me.call_once(|| node_dyn.clone());

        // Must terminate (this test times out / stack-overflows under a naive recursive walker).
        update_ref_count(node_dyn.clone(), RefAction::Decrement);
        assert_eq!(node.count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn force_delete_zeroes_regardless_of_count() {
        let deletes = Arc::new(AtomicUsize::new(0));
        let leaf: Arc<dyn GraphNode> =
            Arc::new(TestNode { count: AtomicU16::new(5), children: vec![], deletes: deletes.clone() });
        update_ref_count(leaf.clone(), RefAction::ForceDelete);
        assert_eq!(leaf.count().load(Ordering::SeqCst), 0);
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }
}
