//! Backwards stack layout generation.
//!
//! For every block the generator decides which stack shape it expects on
//! entry and leaves on exit, and for every operation the shape required
//! immediately before it. Layouts are propagated backwards from block exits:
//! the shape after an operation determines the cheapest shape before it
//! (computed symbolically, see [`SymSlot`]), joins combine the demands of
//! both successors, and loop back-edges trigger a bounded re-propagation of
//! the loop body. Two post-passes run afterwards: conditional-jump stitching
//! forces both arms of a branch to agree on their entry shape up to junk,
//! and a repair pass threads slots that would sink out of the VM's reach
//! through earlier operation layouts.

use std::collections::{BTreeSet, VecDeque};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use schist_ir::graph::{BlockId, DataFlowGraph, Exit, OpKind, Operation};
use schist_ir::slot::{
    display_stack, find_all_slot_offsets, find_slot_offset, Stack, StackSlot,
};

use crate::bitset::BitSet;
use crate::shuffle::{common_prefix_len, shuffle_stack, unreachable_slots, ShuffleCost};

/// Carrying more slots than this across an operation boundary forces the
/// layout into its deduplicated form.
const MAX_CARRIED_WIDTH: usize = 12;

/// Join candidates larger than this skip the permutation search.
const MAX_JOIN_SEARCH: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct BlockLayout {
    /// Stack shape the block expects on entry.
    pub entry: Stack,
    /// Stack shape present when the exit executes.
    pub exit: Stack,
    /// Per-operation shape required immediately before the operation; same
    /// order as the block's operations.
    pub operation_entry: Vec<Stack>,
}

#[derive(Debug, Default)]
pub struct StackLayout {
    infos: FxHashMap<BlockId, BlockLayout>,
}

impl StackLayout {
    pub fn block(&self, block: BlockId) -> &BlockLayout {
        self.infos
            .get(&block)
            .expect("no layout was generated for block")
    }

    pub fn operation_entry(&self, block: BlockId, index: usize) -> &Stack {
        &self.block(block).operation_entry[index]
    }

    pub fn has_block(&self, block: BlockId) -> bool {
        self.infos.contains_key(&block)
    }
}

/// A depth violation the repair pass could not eliminate.
#[derive(Debug, Clone)]
pub struct DepthIssue {
    pub block: BlockId,
    pub slots: Vec<StackSlot>,
}

pub struct LayoutGenerator<'a> {
    graph: &'a DataFlowGraph,
    layout: StackLayout,
}

impl<'a> LayoutGenerator<'a> {
    /// Generates layouts for the whole graph and reports unrepairable depth
    /// violations.
    pub fn run(graph: &'a DataFlowGraph) -> (StackLayout, Vec<DepthIssue>) {
        let mut generator = LayoutGenerator {
            graph,
            layout: StackLayout::default(),
        };

        generator.process_entry_point(graph.entry);
        for info in graph.functions.values() {
            generator.process_entry_point(info.entry);
        }

        generator.stitch_conditional_jumps(graph.entry);
        for info in graph.functions.values() {
            generator.stitch_conditional_jumps(info.entry);
        }

        let mut issues = Vec::new();
        generator.fix_stack_too_deep(graph.entry, &mut issues);
        for info in graph.functions.values() {
            generator.fix_stack_too_deep(info.entry, &mut issues);
        }

        (generator.layout, issues)
    }

    /// Backwards fixed point over the subgraph reachable from `entry`.
    fn process_entry_point(&mut self, entry: BlockId) {
        let mut to_visit: VecDeque<BlockId> = VecDeque::from([entry]);
        let mut visited: BitSet<BlockId> = BitSet::new();
        let mut backwards_jumps: Vec<(BlockId, BlockId)> = Vec::new();

        while let Some(block) = to_visit.pop_front() {
            if visited.contains(block) {
                continue;
            }

            let exit_layout: Option<Stack> = match &self.graph.block(block).exit {
                Exit::MainExit | Exit::Terminated => {
                    visited.insert(block);
                    Some(Stack::new())
                }
                Exit::Jump {
                    target,
                    backwards: true,
                } => {
                    visited.insert(block);
                    backwards_jumps.push((block, *target));
                    // The loop header may not be laid out yet; an empty
                    // guess is corrected by the back-edge pass below.
                    Some(
                        self.layout
                            .infos
                            .get(target)
                            .map(|info| info.entry.clone())
                            .unwrap_or_default(),
                    )
                }
                Exit::Jump {
                    target,
                    backwards: false,
                } => {
                    if visited.contains(*target) {
                        visited.insert(block);
                        Some(self.layout.block(*target).entry.clone())
                    } else {
                        to_visit.push_front(*target);
                        None
                    }
                }
                Exit::ConditionalJump {
                    condition,
                    non_zero,
                    zero,
                } => {
                    let zero_visited = visited.contains(*zero);
                    let non_zero_visited = visited.contains(*non_zero);
                    if zero_visited && non_zero_visited {
                        let mut stack = self.combine_stacks(
                            &self.layout.block(*zero).entry,
                            &self.layout.block(*non_zero).entry,
                        );
                        stack.push(*condition);
                        visited.insert(block);
                        Some(stack)
                    } else {
                        if !zero_visited {
                            to_visit.push_front(*zero);
                        }
                        if !non_zero_visited {
                            to_visit.push_front(*non_zero);
                        }
                        None
                    }
                }
                Exit::FunctionReturn { function } => {
                    visited.insert(block);
                    let info = self.graph.function(*function);
                    let mut stack: Stack = info
                        .return_variables
                        .iter()
                        .map(|v| StackSlot::Variable(*v))
                        .collect();
                    stack.push(StackSlot::FunctionReturnLabel);
                    Some(stack)
                }
            };

            if let Some(exit_layout) = exit_layout {
                let entry_layout = self.propagate_through_block(exit_layout.clone(), block);
                debug!(
                    "layout {block:?}: entry {}, exit {}",
                    display_stack(&entry_layout, self.graph),
                    display_stack(&exit_layout, self.graph),
                );
                self.layout.infos.get_mut(&block).unwrap().exit = exit_layout;
                // A deferred predecessor is re-enqueued through the entries
                // of the block that blocked it.
                for &pred in &self.graph.block(block).entries {
                    to_visit.push_back(pred);
                }
            }
        }

        // A loop body must leave everything the header demands. Where the
        // initial sweep guessed wrong, re-propagate from the back-edge
        // source; the demand set is bounded, so this terminates.
        for (block, target) in backwards_jumps {
            let header_entry = &self.layout.block(target).entry;
            let body_exit = &self.layout.block(block).exit;
            if header_entry
                .iter()
                .any(|slot| find_slot_offset(body_exit, *slot).is_none())
            {
                self.process_entry_point(block);
            }
        }
    }

    fn propagate_through_block(&mut self, exit_layout: Stack, block: BlockId) -> Stack {
        let operations = &self.graph.block(block).operations;
        let mut operation_entry = vec![Stack::new(); operations.len()];
        let mut stack = exit_layout;
        for (index, operation) in operations.iter().enumerate().rev() {
            stack = propagate_through_operation(stack, operation, &mut operation_entry[index]);
        }
        let info = self.layout.infos.entry(block).or_default();
        info.operation_entry = operation_entry;
        info.entry = stack.clone();
        stack
    }

    /// Picks the combined entry layout of a join's two successors: the
    /// common prefix stays, and the cheapest-to-reach permutation of the
    /// remaining carried slots is found by exhaustive search (bounded).
    fn combine_stacks(&self, stack1: &[StackSlot], stack2: &[StackSlot]) -> Stack {
        if stack1.is_empty() {
            return stack2.iter().copied().collect();
        }
        if stack2.is_empty() {
            return stack1.iter().copied().collect();
        }

        let prefix_len = common_prefix_len(stack1, stack2);
        let mut result: Stack = stack1[..prefix_len].iter().copied().collect();
        let rest1 = &stack1[prefix_len..];
        let rest2 = &stack2[prefix_len..];

        let mut candidate = Stack::new();
        for slot in rest1.iter().chain(rest2.iter()) {
            if find_slot_offset(&candidate, *slot).is_none() {
                candidate.push(*slot);
            }
        }
        candidate.retain(|slot| {
            !matches!(slot, StackSlot::Literal(_) | StackSlot::CallReturnLabel(_))
        });

        if candidate.len() > MAX_JOIN_SEARCH {
            result.extend(candidate);
            return result;
        }

        let evaluate = |candidate: &Stack| -> usize {
            let mut cost = ShuffleCost::default();
            let mut test = candidate.clone();
            shuffle_stack(&mut test, rest1, &mut cost);
            let mut test = candidate.clone();
            shuffle_stack(&mut test, rest2, &mut cost);
            cost.ops
        };

        // Heap's algorithm over all permutations of the candidate set.
        let mut best = candidate.clone();
        let mut best_cost = evaluate(&candidate);
        let n = candidate.len();
        let mut c = vec![0usize; n];
        let mut i = 1;
        while i < n {
            if c[i] < i {
                if i % 2 == 0 {
                    candidate.swap(0, i);
                } else {
                    candidate.swap(c[i], i);
                }
                let cost = evaluate(&candidate);
                if cost < best_cost {
                    best_cost = cost;
                    best = candidate.clone();
                }
                c[i] += 1;
                i = 1;
            } else {
                c[i] = 0;
                i += 1;
            }
        }

        result.extend(best);
        result
    }

    /// Forces both successors of every conditional jump to the branch's exit
    /// layout minus the condition, substituting junk for slots a successor
    /// does not need. The branch itself then shuffles nothing.
    fn stitch_conditional_jumps(&mut self, entry: BlockId) {
        let mut queue = VecDeque::from([entry]);
        let mut visited: BitSet<BlockId> = BitSet::new();

        while let Some(block) = queue.pop_front() {
            if !visited.insert(block) {
                continue;
            }
            match self.graph.block(block).exit {
                Exit::Jump {
                    target,
                    backwards: false,
                } => queue.push_back(target),
                Exit::ConditionalJump { non_zero, zero, .. } => {
                    let mut exit_layout = self.layout.block(block).exit.clone();
                    assert!(!exit_layout.is_empty(), "condition slot missing at branch");
                    exit_layout.pop();

                    for successor in [zero, non_zero] {
                        let mut new_entry = exit_layout.clone();
                        let current_entry = &self.layout.block(successor).entry;
                        for slot in new_entry.iter_mut() {
                            if find_slot_offset(current_entry, *slot).is_none() {
                                *slot = StackSlot::Junk;
                            }
                        }
                        self.layout.infos.get_mut(&successor).unwrap().entry = new_entry;
                    }
                    queue.push_back(zero);
                    queue.push_back(non_zero);
                }
                _ => {}
            }
        }
    }

    /// Heuristic repair of accesses beyond the VM's reach: inside a block,
    /// unreachable slots are threaded through the entry layouts of earlier
    /// operations (keeping them shallow); violations that survive at jump
    /// edges are reported.
    fn fix_stack_too_deep(&mut self, entry: BlockId, issues: &mut Vec<DepthIssue>) {
        let mut queue = VecDeque::from([entry]);
        let mut visited: BitSet<BlockId> = BitSet::new();

        while let Some(block) = queue.pop_front() {
            if !visited.insert(block) {
                continue;
            }

            // Two passes over the block: a repair can in principle introduce
            // a new violation earlier in the block, so scan once more and
            // report whatever survives.
            let mut residual = self.repair_block(block);
            if !residual.is_empty() {
                residual = self.repair_block(block);
            }
            if !residual.is_empty() {
                warn!(
                    "stack too deep in {block:?}: {} cannot be repaired",
                    display_stack(&residual, self.graph)
                );
                issues.push(DepthIssue {
                    block,
                    slots: residual.to_vec(),
                });
            }

            let stack = self.layout.block(block).exit.clone();
            match self.graph.block(block).exit {
                Exit::Jump { target, backwards } => {
                    let deep = unreachable_slots(&stack, &self.layout.block(target).entry);
                    if !deep.is_empty() {
                        warn!(
                            "stack too deep at jump {block:?} -> {target:?}: {}",
                            display_stack(&deep, self.graph)
                        );
                        issues.push(DepthIssue { block, slots: deep });
                    }
                    if !backwards {
                        queue.push_back(target);
                    }
                }
                Exit::ConditionalJump { non_zero, zero, .. } => {
                    for successor in [zero, non_zero] {
                        let deep = unreachable_slots(&stack, &self.layout.block(successor).entry);
                        if !deep.is_empty() {
                            warn!(
                                "stack too deep at branch {block:?} -> {successor:?}: {}",
                                display_stack(&deep, self.graph)
                            );
                            issues.push(DepthIssue { block, slots: deep });
                        }
                        queue.push_back(successor);
                    }
                }
                _ => {}
            }
        }
    }

    /// One repair sweep over a block; returns the slots still unreachable
    /// after it.
    fn repair_block(&mut self, block: BlockId) -> Stack {
        let operations = &self.graph.block(block).operations;
        let mut residual = Stack::new();
        let mut stack = self.layout.block(block).entry.clone();

        for index in 0..operations.len() {
            let operation = &operations[index];
            let operation_entry = self.layout.operation_entry(block, index).clone();
            let deep = unreachable_slots(&stack, &operation_entry);
            if !deep.is_empty() {
                debug!(
                    "threading unreachable slots {} above operation inputs in {block:?}",
                    display_stack(&deep, self.graph)
                );
                self.thread_through_earlier_operations(block, index, &deep);
                residual.extend(deep.iter().copied());
            }
            stack = operation_entry;
            for _ in 0..operation.input.len() {
                stack.pop();
            }
            stack.extend(operation.output.iter().copied());
        }

        let exit_layout = self.layout.block(block).exit.clone();
        let deep = unreachable_slots(&stack, &exit_layout);
        if !deep.is_empty() {
            self.thread_through_earlier_operations(block, operations.len(), &deep);
            residual.extend(deep.iter().copied());
        }
        residual
    }

    /// Inserts `slots` just below the operation inputs in the entry layouts
    /// of the first `upto` operations, keeping them within reach.
    fn thread_through_earlier_operations(
        &mut self,
        block: BlockId,
        upto: usize,
        slots: &[StackSlot],
    ) {
        let input_lens: Vec<usize> = self.graph.block(block).operations[..upto]
            .iter()
            .map(|op| op.input.len())
            .collect();
        let info = self.layout.infos.get_mut(&block).unwrap();
        for index in (0..upto).rev() {
            let entry = &mut info.operation_entry[index];
            let keep = entry.len() - input_lens[index];
            let mut threaded: Stack = entry[..keep].iter().copied().collect();
            threaded.extend(slots.iter().copied());
            threaded.extend(entry[keep..].iter().copied());
            *entry = threaded;
        }
    }
}

/// A symbolic stack entry during per-operation back-propagation: either a
/// slot that comes from the pre-operation stack (position `i`), or an
/// operation output that must end up at each position in its target set.
#[derive(Debug, Clone)]
enum SymSlot {
    Previous(usize),
    Target(BTreeSet<usize>),
}

fn is_placed(layout: &[SymSlot], position: usize) -> bool {
    match layout.get(position) {
        Some(SymSlot::Target(targets)) => targets.contains(&position),
        _ => false,
    }
}

/// Rearranges the symbolic layout until every target entry sits at (copies
/// of it cover) exactly its target positions. `Previous` entries are content
/// anywhere and fill the remaining positions.
fn permute_with_dups(layout: &mut Vec<SymSlot>) {
    'outer: loop {
        let n = layout.len();
        if n == 0 {
            return;
        }

        if let SymSlot::Target(targets) = &layout[n - 1] {
            // No remaining demand: drop the top.
            if targets.is_empty() {
                layout.pop();
                continue;
            }
            // Sink the top into one of its target positions, displacing
            // whatever is not settled there.
            let sink_to = if targets.contains(&(n - 1)) {
                None
            } else {
                targets
                    .iter()
                    .copied()
                    .find(|&position| position < n - 1 && !is_placed(layout, position))
            };
            if let Some(position) = sink_to {
                layout.swap(position, n - 1);
                continue 'outer;
            }
        }

        // Duplicate a slot that must cover further positions. Carving the
        // position just past the top keeps the copy settled immediately.
        for index in 0..n {
            let SymSlot::Target(targets) = &layout[index] else {
                continue;
            };
            if targets.len() > 1 {
                let carved = if targets.contains(&n) {
                    n
                } else {
                    *targets
                        .iter()
                        .find(|&&p| p != index)
                        .expect("a multi-target entry has a position to carve")
                };
                let SymSlot::Target(targets) = &mut layout[index] else {
                    unreachable!();
                };
                targets.remove(&carved);
                layout.push(SymSlot::Target(BTreeSet::from([carved])));
                continue 'outer;
            }
        }

        // Bring the deepest unsettled entry up; the next rounds sink it.
        for index in 0..n.saturating_sub(1) {
            if let SymSlot::Target(targets) = &layout[index] {
                if !targets.contains(&index) {
                    layout.swap(index, n - 1);
                    continue 'outer;
                }
            }
        }
        return;
    }
}

/// Computes the ideal stack shape before an operation, given the shape after
/// it (`post`) and the symbolic layout relating the two.
fn ideal_layout_before(post: &[StackSlot], mut symbolic: Vec<SymSlot>) -> Stack {
    permute_with_dups(&mut symbolic);

    let mut ideal: Vec<Option<StackSlot>> = vec![None; post.len()];
    for (slot, sym) in post.iter().zip(symbolic.iter()) {
        if let SymSlot::Previous(index) = sym {
            ideal[*index] = Some(*slot);
        }
    }
    while matches!(ideal.last(), Some(None)) {
        ideal.pop();
    }
    ideal
        .into_iter()
        .map(|slot| slot.expect("previous slots form a dense prefix"))
        .collect()
}

/// Back-propagates `exit_stack` through one operation, recording the
/// operation's entry layout into `record`.
fn propagate_through_operation(
    exit_stack: Stack,
    operation: &Operation,
    record: &mut Stack,
) -> Stack {
    // Where do the operation's outputs have to end up?
    let mut target_positions: Vec<BTreeSet<usize>> =
        vec![BTreeSet::new(); operation.output.len()];
    let mut num_to_keep = 0;
    for (index, output) in operation.output.iter().enumerate() {
        for offset in find_all_slot_offsets(&exit_stack, *output) {
            target_positions[index].insert(offset);
            num_to_keep += 1;
        }
    }

    let mut symbolic: Vec<SymSlot> = (0..exit_stack.len() - num_to_keep)
        .map(SymSlot::Previous)
        .collect();
    symbolic.extend(target_positions.into_iter().map(SymSlot::Target));
    let mut stack = ideal_layout_before(&exit_stack, symbolic);

    // An assignment kills every older copy of the assigned variables.
    if let OpKind::Assignment { variables } = &operation.kind {
        for slot in stack.iter_mut() {
            if let StackSlot::Variable(var) = slot {
                if variables.contains(var) {
                    *slot = StackSlot::Junk;
                }
            }
        }
    }

    stack.extend(operation.input.iter().copied());
    *record = stack.clone();

    // Compression: anything on top that can be regenerated (or duplicated
    // from below) on demand is cheaper to drop than to carry.
    while let Some(&top) = stack.last() {
        if top.is_regenerable() {
            stack.pop();
            continue;
        }
        if find_slot_offset(&stack[..stack.len() - 1], top).is_some() {
            stack.pop();
            continue;
        }
        break;
    }

    // Very wide layouts get deduplicated wholesale.
    if stack.len() > MAX_CARRIED_WIDTH {
        let mut compressed = Stack::new();
        for slot in &stack {
            if matches!(slot, StackSlot::Literal(_) | StackSlot::CallReturnLabel(_)) {
                continue;
            }
            if find_slot_offset(&compressed, *slot).is_some() {
                continue;
            }
            compressed.push(*slot);
        }
        stack = compressed;
    }

    stack
}

#[cfg(test)]
mod tests {
    use super::*;
    use schist_ir::graph::DataFlowGraph;
    use schist_ir::test_util::{lower, AstFactory};
    use schist_ir::U256;
    use smallvec::smallvec;

    fn lit(value: u64) -> StackSlot {
        StackSlot::Literal(U256::from(value))
    }

    fn generate(graph: &DataFlowGraph) -> StackLayout {
        let (layout, issues) = LayoutGenerator::run(graph);
        assert!(issues.is_empty(), "unexpected depth issues: {issues:?}");
        layout
    }

    /// Entry/exit consistency: within each laid-out block, every operation's
    /// entry layout ends in the operation's inputs, and applying the
    /// operation chain reaches each following boundary without leaving the
    /// VM's reach.
    fn check_consistency(graph: &DataFlowGraph, layout: &StackLayout) {
        for (block, data) in graph.blocks.iter() {
            if !layout.has_block(block) {
                continue;
            }
            for (index, operation) in data.operations.iter().enumerate() {
                let entry = layout.operation_entry(block, index);
                assert!(entry.len() >= operation.input.len());
                assert_eq!(
                    &entry[entry.len() - operation.input.len()..],
                    operation.input.as_slice(),
                    "operation entry layout must end in the operation's input"
                );

                let mut stack = entry.clone();
                DataFlowGraph::apply_operation(&mut stack, operation);
                let next_boundary = if index + 1 < data.operations.len() {
                    layout.operation_entry(block, index + 1)
                } else {
                    &layout.block(block).exit
                };
                assert!(
                    unreachable_slots(&stack, next_boundary).is_empty(),
                    "the stack after an operation must reach the next layout"
                );
            }
        }
    }

    #[test]
    fn straight_line_layouts() {
        let mut f = AstFactory::default();
        let root = f.block([f.expr_stmt(f.call("sstore", [f.lit(0), f.lit(42)]))]);
        let (graph, _) = lower(&root);
        let layout = generate(&graph);

        let info = layout.block(graph.entry);
        // Literal-only layouts compress to nothing across the block edge.
        assert!(info.entry.is_empty());
        assert!(info.exit.is_empty());
        assert_eq!(
            layout.operation_entry(graph.entry, 0).as_slice(),
            &[lit(42), lit(0)]
        );
        check_consistency(&graph, &layout);
    }

    #[test]
    fn local_reuse_needs_one_carried_slot() {
        let mut f = AstFactory::default();
        let root = f.block([
            f.let_single("x", f.lit(7)),
            f.let_single("y", f.call("add", [f.ident("x"), f.ident("x")])),
            f.expr_stmt(f.call("sstore", [f.lit(0), f.ident("y")])),
        ]);
        let (graph, _) = lower(&root);
        let layout = generate(&graph);

        // `add` consumes x twice but the block carries x only once.
        let add_entry = layout.operation_entry(graph.entry, 1);
        let xs = add_entry
            .iter()
            .filter(|s| matches!(s, StackSlot::Variable(_)))
            .count();
        assert_eq!(xs, 2);
        check_consistency(&graph, &layout);
    }

    #[test]
    fn loop_header_carries_the_counter_once() {
        let mut f = AstFactory::default();
        let pre = f.block([f.let_single("i", f.lit(0))]);
        let post = f.block([f.assign_single("i", f.call("add", [f.ident("i"), f.lit(1)]))]);
        let body = f.block([f.expr_stmt(f.call("sstore", [f.ident("i"), f.ident("i")]))]);
        let root = f.block([f.for_(pre, f.call("lt", [f.ident("i"), f.lit(10)]), post, body)]);
        let (graph, _) = lower(&root);
        let layout = generate(&graph);

        // Find the loop header: target of the back-edge.
        let header = graph
            .blocks
            .iter()
            .find_map(|(_, block)| match block.exit {
                Exit::Jump {
                    target,
                    backwards: true,
                } => Some(target),
                _ => None,
            })
            .expect("missing back-edge");

        let header_entry = &layout.block(header).entry;
        let counter_copies = header_entry
            .iter()
            .filter(|s| matches!(s, StackSlot::Variable(_)))
            .count();
        assert_eq!(counter_copies, 1, "{header_entry:?}");
        check_consistency(&graph, &layout);
    }

    #[test]
    fn branch_arms_agree_after_stitching() {
        let mut f = AstFactory::default();
        let body = f.block([f.expr_stmt(f.call("sstore", [f.lit(0), f.ident("a")]))]);
        let root = f.block([
            f.let_single("a", f.lit(1)),
            f.let_single("b", f.lit(2)),
            f.if_(f.call("lt", [f.ident("a"), f.ident("b")]), body),
        ]);
        let (graph, _) = lower(&root);
        let layout = generate(&graph);

        let Exit::ConditionalJump { non_zero, zero, .. } = graph.block(graph.entry).exit else {
            panic!("expected a branch");
        };
        let exit = &layout.block(graph.entry).exit;
        let nz = &layout.block(non_zero).entry;
        let z = &layout.block(zero).entry;
        assert_eq!(nz.len(), exit.len() - 1);
        assert_eq!(z.len(), exit.len() - 1);
        for index in 0..nz.len() {
            let same_nz = nz[index] == exit[index] || nz[index] == StackSlot::Junk;
            let same_z = z[index] == exit[index] || z[index] == StackSlot::Junk;
            assert!(same_nz && same_z);
        }
        check_consistency(&graph, &layout);
    }

    #[test]
    fn stitching_is_idempotent() {
        let mut f = AstFactory::default();
        let body = f.block([f.expr_stmt(f.call("sstore", [f.lit(0), f.ident("a")]))]);
        let root = f.block([
            f.let_single("a", f.lit(1)),
            f.if_(f.call("iszero", [f.ident("a")]), body),
        ]);
        let (graph, _) = lower(&root);

        let mut generator = LayoutGenerator {
            graph: &graph,
            layout: StackLayout::default(),
        };
        generator.process_entry_point(graph.entry);
        generator.stitch_conditional_jumps(graph.entry);
        let once: Vec<(BlockId, Stack)> = graph
            .blocks
            .iter()
            .filter(|(b, _)| generator.layout.has_block(*b))
            .map(|(b, _)| (b, generator.layout.block(b).entry.clone()))
            .collect();

        generator.stitch_conditional_jumps(graph.entry);
        for (block, entry) in once {
            assert_eq!(&entry, &generator.layout.block(block).entry);
        }
    }

    #[test]
    fn permute_settles_singleton_targets() {
        // [Previous(0), Target{0}] -> the target sinks below the carried
        // slot.
        let mut layout = vec![
            SymSlot::Previous(0),
            SymSlot::Target(BTreeSet::from([0])),
        ];
        permute_with_dups(&mut layout);
        assert!(matches!(&layout[0], SymSlot::Target(t) if t.contains(&0)));
        assert!(matches!(layout[1], SymSlot::Previous(0)));
    }

    #[test]
    fn permute_duplicates_multi_targets() {
        let mut layout = vec![SymSlot::Target(BTreeSet::from([0, 1, 2]))];
        permute_with_dups(&mut layout);
        assert_eq!(layout.len(), 3);
        for (index, entry) in layout.iter().enumerate() {
            assert!(matches!(entry, SymSlot::Target(t) if t.contains(&index)));
        }
    }

    #[test]
    fn permute_pops_unused_outputs() {
        let mut layout = vec![
            SymSlot::Previous(0),
            SymSlot::Target(BTreeSet::new()),
        ];
        permute_with_dups(&mut layout);
        assert_eq!(layout.len(), 1);
        assert!(matches!(layout[0], SymSlot::Previous(0)));
    }

    #[test]
    fn combine_keeps_the_common_prefix() {
        let mut f = AstFactory::default();
        let root = f.block([]);
        let (graph, _) = lower(&root);
        let generator = LayoutGenerator {
            graph: &graph,
            layout: StackLayout::default(),
        };

        let a: Stack = smallvec![StackSlot::Junk, lit(1), StackSlot::Junk];
        let b: Stack = smallvec![StackSlot::Junk, lit(2), StackSlot::Junk];
        let combined = generator.combine_stacks(&a, &b);
        // Prefix [Junk] is kept; literals are dropped from the candidate
        // set; one junk remains as carried slot.
        assert_eq!(combined.as_slice(), &[StackSlot::Junk, StackSlot::Junk]);
    }
}
