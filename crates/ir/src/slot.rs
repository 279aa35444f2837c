//! The stack-slot algebra.
//!
//! A [`StackSlot`] names one abstract value on the target VM's stack. Slots
//! are small `Copy` values: variables and call sites are referenced by their
//! arena ids, so slot equality is identity equality for those variants and
//! value equality for literals. A [`Stack`] is an ordered sequence of slots,
//! bottom first.

use std::fmt;

use primitive_types::U256;
use smallvec::SmallVec;

use crate::graph::{CallId, DataFlowGraph, VarId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StackSlot {
    /// A compile-time constant, regenerable by a push at any time.
    Literal(U256),
    /// The current value of a (scope or ghost) variable.
    Variable(VarId),
    /// The `index`-th result of a call, before it is bound to variables.
    Temporary { call: CallId, index: u16 },
    /// The return label the caller pushes below the arguments of a user
    /// function call.
    CallReturnLabel(CallId),
    /// The label the current function frame returns through.
    FunctionReturnLabel,
    /// A live stack position whose value is dead.
    Junk,
}

/// A stack of abstract slots, bottom first (`last()` is the top).
pub type Stack = SmallVec<[StackSlot; 8]>;

/// Offset of the first occurrence of `slot` in `stack`, counted from the
/// bottom.
pub fn find_slot_offset(stack: &[StackSlot], slot: StackSlot) -> Option<usize> {
    stack.iter().position(|s| *s == slot)
}

/// All offsets of `slot` in `stack`, in increasing order.
pub fn find_all_slot_offsets(stack: &[StackSlot], slot: StackSlot) -> SmallVec<[usize; 4]> {
    stack
        .iter()
        .enumerate()
        .filter_map(|(idx, s)| (*s == slot).then_some(idx))
        .collect()
}

impl StackSlot {
    /// Slots the shuffler can produce out of thin air: dropping one is always
    /// cheaper than carrying it across an edge.
    pub fn is_regenerable(&self) -> bool {
        matches!(
            self,
            StackSlot::Literal(_) | StackSlot::Junk | StackSlot::CallReturnLabel(_)
        )
    }

    /// Renders the slot with names resolved against the owning graph.
    pub fn display<'a>(&self, graph: &'a DataFlowGraph) -> DisplaySlot<'a> {
        DisplaySlot { slot: *self, graph }
    }
}

pub struct DisplaySlot<'a> {
    slot: StackSlot,
    graph: &'a DataFlowGraph,
}

impl fmt::Display for DisplaySlot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot {
            StackSlot::Literal(value) => write!(f, "{value:#x}"),
            StackSlot::Variable(var) => write!(f, "{}", self.graph.var(var).name),
            StackSlot::Temporary { call, index } => {
                write!(f, "TMP[{}, {index}]", self.graph.call(call).name)
            }
            StackSlot::CallReturnLabel(call) => {
                write!(f, "RET[{}]", self.graph.call(call).name)
            }
            StackSlot::FunctionReturnLabel => write!(f, "RET"),
            StackSlot::Junk => write!(f, "JUNK"),
        }
    }
}

/// Renders a whole stack, bottom first: `[ a b JUNK ]`.
pub fn display_stack<'a>(stack: &'a [StackSlot], graph: &'a DataFlowGraph) -> DisplayStack<'a> {
    DisplayStack { stack, graph }
}

pub struct DisplayStack<'a> {
    stack: &'a [StackSlot],
    graph: &'a DataFlowGraph,
}

impl fmt::Display for DisplayStack<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for slot in self.stack {
            write!(f, " {}", slot.display(self.graph))?;
        }
        write!(f, " ]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets() {
        let a = StackSlot::Literal(U256::from(1));
        let b = StackSlot::Literal(U256::from(2));
        let stack: Stack = [a, b, a, StackSlot::Junk].into_iter().collect();

        assert_eq!(find_slot_offset(&stack, a), Some(0));
        assert_eq!(find_slot_offset(&stack, b), Some(1));
        assert_eq!(find_slot_offset(&stack, StackSlot::FunctionReturnLabel), None);
        assert_eq!(find_all_slot_offsets(&stack, a).as_slice(), &[0, 2]);
        assert_eq!(find_all_slot_offsets(&stack, StackSlot::Junk).as_slice(), &[3]);
    }

    #[test]
    fn singleton_variants_are_equal() {
        assert_eq!(StackSlot::Junk, StackSlot::Junk);
        assert_eq!(StackSlot::FunctionReturnLabel, StackSlot::FunctionReturnLabel);
        assert_ne!(StackSlot::Junk, StackSlot::FunctionReturnLabel);
    }
}
