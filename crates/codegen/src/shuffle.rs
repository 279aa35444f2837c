//! The stack shuffler: turn one stack shape into another using only
//! `swap`/`dup`/`push`/`pop`.
//!
//! [`shuffle_stack`] is a pure algorithm over abstract slots, parameterized
//! by a [`ShuffleOps`] sink. The layout generator runs it with a counting
//! sink to cost candidate layouts, the code generator with an opcode-emitting
//! sink, and [`unreachable_slots`] with a probing sink that records accesses
//! deeper than the VM can address.

use schist_ir::isa::REACHABLE_DEPTH;
use schist_ir::slot::{find_all_slot_offsets, find_slot_offset, Stack, StackSlot};

/// Callbacks invoked for every primitive the shuffler decides on.
///
/// Each callback runs *before* the corresponding mutation of the current
/// stack, and receives the pre-mutation stack as `current` where the
/// decision context matters. `swap(depth)` exchanges the top with the slot
/// `depth` positions below it; `dup(depth)` copies the `depth`-th slot
/// (1 = top) to the top.
pub trait ShuffleOps {
    fn swap(&mut self, depth: usize, current: &[StackSlot]);
    fn dup(&mut self, depth: usize, current: &[StackSlot]);
    fn push(&mut self, slot: &StackSlot, current: &[StackSlot]);
    fn pop(&mut self);
}

/// Mutates `current` in place until it equals `target`, reporting every step
/// to `ops`.
pub fn shuffle_stack<O: ShuffleOps>(current: &mut Stack, target: &[StackSlot], ops: &mut O) {
    loop {
        if current.as_slice() == target {
            return;
        }

        if current.is_empty() {
            while current.len() < target.len() {
                let slot = target[current.len()];
                ops.push(&slot, current);
                current.push(slot);
            }
            debug_assert_eq!(current.as_slice(), target);
            return;
        }

        let top = *current.last().unwrap();

        // A surplus copy on top is dead weight.
        if occurrences(target, top) < occurrences(current, top) {
            ops.pop();
            current.pop();
            continue;
        }

        let top_in_place =
            target.len() >= current.len() && target[current.len() - 1] == top;

        if top_in_place {
            if dup_undersupplied_slot(current, target, ops)
                || push_missing_slot(current, target, ops)
            {
                continue;
            }
            // Everything present in the right multiplicity; swap the deepest
            // out-of-place slot up and let the next rounds sink it.
            if let Some(offset) = (0..current.len())
                .find(|&i| current[i] != target[i] && current[i] != top)
            {
                swap_with_top(current, offset, ops);
                continue;
            }
            debug_assert_eq!(current.as_slice(), target);
            return;
        }

        // Sink the top into one of its still-wrong target positions.
        let mut moved = false;
        for offset in find_all_slot_offsets(target, top) {
            if offset >= current.len() {
                break;
            }
            if current[offset] != target[offset] {
                swap_with_top(current, offset, ops);
                moved = true;
                break;
            }
        }
        if moved {
            continue;
        }

        if dup_undersupplied_slot(current, target, ops) || push_missing_slot(current, target, ops)
        {
            continue;
        }
        unreachable!("stack shuffle cannot make progress");
    }
}

fn occurrences(stack: &[StackSlot], slot: StackSlot) -> usize {
    stack.iter().filter(|s| **s == slot).count()
}

fn swap_with_top<O: ShuffleOps>(current: &mut Stack, offset: usize, ops: &mut O) {
    let depth = current.len() - 1 - offset;
    ops.swap(depth, current);
    let last = current.len() - 1;
    current.swap(last, offset);
}

/// Duplicates the shallowest copy of a slot that `target` wants more often
/// than `current` has it.
fn dup_undersupplied_slot<O: ShuffleOps>(
    current: &mut Stack,
    target: &[StackSlot],
    ops: &mut O,
) -> bool {
    for offset in 0..current.len() {
        let slot = current[offset];
        if occurrences(current, slot) < occurrences(target, slot) {
            let depth = current.iter().rev().position(|s| *s == slot).unwrap() + 1;
            ops.dup(depth, current);
            current.push(slot);
            return true;
        }
    }
    false
}

fn push_missing_slot<O: ShuffleOps>(
    current: &mut Stack,
    target: &[StackSlot],
    ops: &mut O,
) -> bool {
    for slot in target {
        if find_slot_offset(current, *slot).is_none() {
            ops.push(slot, current);
            current.push(*slot);
            return true;
        }
    }
    false
}

/// Counts shuffle steps, with a heavy penalty for accesses out of reach;
/// used to rank candidate layouts.
#[derive(Default)]
pub struct ShuffleCost {
    pub ops: usize,
}

impl ShuffleOps for ShuffleCost {
    fn swap(&mut self, depth: usize, _current: &[StackSlot]) {
        self.ops += 1;
        if depth > REACHABLE_DEPTH {
            self.ops += 1000;
        }
    }

    fn dup(&mut self, depth: usize, _current: &[StackSlot]) {
        self.ops += 1;
        if depth > REACHABLE_DEPTH {
            self.ops += 1000;
        }
    }

    fn push(&mut self, _slot: &StackSlot, _current: &[StackSlot]) {}

    fn pop(&mut self) {}
}

pub(crate) fn common_prefix_len(a: &[StackSlot], b: &[StackSlot]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Dry-runs the shuffle from `current` to `target` and collects the slots
/// whose access depth would exceed the VM's reach.
pub fn unreachable_slots(current: &[StackSlot], target: &[StackSlot]) -> Vec<StackSlot> {
    let prefix_len = common_prefix_len(current, target);
    let prefix = &current[..prefix_len];
    let mut temporary: Stack = current[prefix_len..].iter().copied().collect();

    struct Probe<'a> {
        prefix: &'a [StackSlot],
        deep: Vec<StackSlot>,
    }

    impl Probe<'_> {
        fn record(&mut self, slot: StackSlot) {
            if !self.deep.contains(&slot) {
                self.deep.push(slot);
            }
        }
    }

    impl ShuffleOps for Probe<'_> {
        fn swap(&mut self, depth: usize, current: &[StackSlot]) {
            if depth > REACHABLE_DEPTH {
                self.record(current[current.len() - 1 - depth]);
            }
        }

        fn dup(&mut self, depth: usize, current: &[StackSlot]) {
            if depth > REACHABLE_DEPTH {
                self.record(current[current.len() - depth]);
            }
        }

        fn push(&mut self, slot: &StackSlot, current: &[StackSlot]) {
            // A push of a slot that lives deep in the stack becomes a dup at
            // emission; probe that depth.
            let depth = current
                .iter()
                .rev()
                .position(|s| s == slot)
                .or_else(|| {
                    self.prefix
                        .iter()
                        .rev()
                        .position(|s| s == slot)
                        .map(|d| d + current.len())
                });
            match depth {
                Some(depth) if depth + 1 > REACHABLE_DEPTH => self.record(*slot),
                Some(_) => {}
                None => {
                    // A temporary that is nowhere on the stack cannot be
                    // rematerialized at emission; its value is lost.
                    if matches!(slot, StackSlot::Temporary { .. }) {
                        self.record(*slot);
                    }
                }
            }
        }

        fn pop(&mut self) {}
    }

    let mut probe = Probe {
        prefix,
        deep: Vec::new(),
    };
    shuffle_stack(&mut temporary, &target[prefix_len..], &mut probe);
    probe.deep
}

#[cfg(test)]
mod tests {
    use super::*;
    use schist_ir::U256;

    #[derive(Debug, PartialEq, Eq, Clone)]
    enum Step {
        Swap(usize),
        Dup(usize),
        Push(StackSlot),
        Pop,
    }

    #[derive(Default)]
    struct Recorder {
        steps: Vec<Step>,
    }

    impl ShuffleOps for Recorder {
        fn swap(&mut self, depth: usize, _: &[StackSlot]) {
            self.steps.push(Step::Swap(depth));
        }
        fn dup(&mut self, depth: usize, _: &[StackSlot]) {
            self.steps.push(Step::Dup(depth));
        }
        fn push(&mut self, slot: &StackSlot, _: &[StackSlot]) {
            self.steps.push(Step::Push(*slot));
        }
        fn pop(&mut self) {
            self.steps.push(Step::Pop);
        }
    }

    fn lit(value: u64) -> StackSlot {
        StackSlot::Literal(U256::from(value))
    }

    fn run(current: &[StackSlot], target: &[StackSlot]) -> (Stack, Vec<Step>) {
        let mut stack: Stack = current.iter().copied().collect();
        let mut recorder = Recorder::default();
        shuffle_stack(&mut stack, target, &mut recorder);
        assert_eq!(stack.as_slice(), target);
        (stack, recorder.steps)
    }

    #[test]
    fn identical_stacks_are_untouched() {
        let stack = [lit(1), lit(2), StackSlot::Junk];
        let (_, steps) = run(&stack, &stack);
        assert!(steps.is_empty());
    }

    #[test]
    fn fills_an_empty_stack_with_pushes() {
        let (_, steps) = run(&[], &[lit(1), lit(2)]);
        assert_eq!(steps, [Step::Push(lit(1)), Step::Push(lit(2))]);
    }

    #[test]
    fn pops_surplus_slots() {
        let (_, steps) = run(&[lit(1), lit(2)], &[lit(1)]);
        assert_eq!(steps, [Step::Pop]);
    }

    #[test]
    fn swaps_two_slots() {
        let (_, steps) = run(&[lit(1), lit(2)], &[lit(2), lit(1)]);
        assert_eq!(steps, [Step::Swap(1)]);
    }

    #[test]
    fn dups_a_needed_copy() {
        let (_, steps) = run(&[lit(1)], &[lit(1), lit(1)]);
        assert_eq!(steps, [Step::Dup(1)]);
    }

    #[test]
    fn reverses_a_three_slot_stack() {
        let (_, steps) = run(&[lit(1), lit(2), lit(3)], &[lit(3), lit(2), lit(1)]);
        assert!(steps.iter().all(|s| matches!(s, Step::Swap(_))));
        assert!(steps.len() <= 3);
    }

    #[test]
    fn dups_from_depth_for_repeated_args() {
        // [a, b] -> [a, b, a]: `a` must be duplicated from depth 2.
        let (_, steps) = run(&[lit(10), lit(20)], &[lit(10), lit(20), lit(10)]);
        assert_eq!(steps, [Step::Dup(2)]);
    }

    #[test]
    fn cost_of_identity_is_zero() {
        let mut stack: Stack = [lit(1), lit(2)].into_iter().collect();
        let target = stack.clone();
        let mut cost = ShuffleCost::default();
        shuffle_stack(&mut stack, &target, &mut cost);
        assert_eq!(cost.ops, 0);
    }

    #[test]
    fn probe_reports_slots_out_of_reach() {
        // 18 distinct slots below, and the target wants the bottom one
        // duplicated on top: reaching it needs a dup deeper than 16.
        let current: Vec<StackSlot> = (0..18).map(lit).collect();
        let mut target = current.clone();
        target.push(lit(0));
        let deep = unreachable_slots(&current, &target);
        assert_eq!(deep, [lit(0)]);
    }

    #[test]
    fn probe_is_empty_for_reachable_layouts() {
        let current = [lit(1), lit(2), lit(3)];
        let target = [lit(3), lit(1), lit(2), lit(4)];
        assert!(unreachable_slots(&current, &target).is_empty());
    }
}
