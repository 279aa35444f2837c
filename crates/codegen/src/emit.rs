//! Forward code emission.
//!
//! Walks the graph from the program entry, realizes the chosen stack layouts
//! with `swap`/`dup`/`pop`/push instructions and stitches blocks together
//! with labels and jumps. Each block is emitted at most once; jump targets
//! with a single predecessor are inlined, everything else is staged and
//! drained afterwards (functions last, each with its own frame convention:
//! return label below the reversed parameters).

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

use schist_ir::analysis::FuncId;
use schist_ir::dialect::Dialect;
use schist_ir::graph::{
    ArgShape, BlockId, CallId, DataFlowGraph, Exit, OpKind, Operation, VarId,
};
use schist_ir::isa::{Assembly, Instruction, JumpKind, LabelId};
use schist_ir::slot::{find_slot_offset, Stack, StackSlot};
use schist_ir::U256;

use crate::bitset::BitSet;
use crate::layout::StackLayout;
use crate::shuffle::{common_prefix_len, shuffle_stack, unreachable_slots, ShuffleOps};

pub struct CodeGenerator<'a> {
    assembly: &'a mut dyn Assembly,
    dialect: &'a dyn Dialect,
    graph: &'a DataFlowGraph,
    layout: &'a StackLayout,
    /// Model of the runtime stack.
    stack: Stack,
    return_labels: FxHashMap<CallId, LabelId>,
    block_labels: FxHashMap<BlockId, LabelId>,
    function_labels: FxHashMap<FuncId, LabelId>,
    generated: BitSet<BlockId>,
    generated_functions: BitSet<FuncId>,
    staged_blocks: VecDeque<BlockId>,
    staged_functions: Vec<FuncId>,
    current_function: Option<FuncId>,
    use_named_labels: bool,
}

impl<'a> CodeGenerator<'a> {
    pub fn run(
        assembly: &mut dyn Assembly,
        dialect: &dyn Dialect,
        graph: &DataFlowGraph,
        layout: &StackLayout,
        use_named_labels: bool,
    ) {
        let mut generator = CodeGenerator {
            assembly,
            dialect,
            graph,
            layout,
            stack: Stack::new(),
            return_labels: FxHashMap::default(),
            block_labels: FxHashMap::default(),
            function_labels: FxHashMap::default(),
            generated: BitSet::new(),
            generated_functions: BitSet::new(),
            staged_blocks: VecDeque::new(),
            staged_functions: Vec::new(),
            current_function: None,
            use_named_labels,
        };
        generator.emit_block(graph.entry);
        generator.generate_staged();
    }

    fn emit_block(&mut self, block: BlockId) {
        if !self.generated.insert(block) {
            return;
        }
        trace!("emitting {block:?}");

        if let Some(&label) = self.block_labels.get(&block) {
            self.assembly.append_label(label);
        }

        let entry_layout = self.layout.block(block).entry.clone();
        assert_layout_compatible(&self.stack, &entry_layout);
        self.stack = entry_layout;
        assert_eq!(self.assembly.stack_height(), self.stack.len());

        for (index, operation) in self.graph.block(block).operations.iter().enumerate() {
            let target = self.layout.operation_entry(block, index).clone();
            self.create_stack_layout(&target);
            self.visit_operation(operation);
        }

        let exit_layout = self.layout.block(block).exit.clone();
        self.create_stack_layout(&exit_layout);

        match self.graph.block(block).exit {
            Exit::MainExit => {
                self.assembly.append_instruction(Instruction::Stop);
            }
            Exit::Jump { target, .. } => {
                let target_entry = self.layout.block(target).entry.clone();
                self.create_stack_layout(&target_entry);

                if !self.block_labels.contains_key(&target)
                    && self.graph.block(target).entries.len() == 1
                {
                    self.emit_block(target);
                } else {
                    let label = self.block_label(target);
                    assert_eq!(self.stack, target_entry);
                    self.assembly.append_jump_to(label, 0, JumpKind::Ordinary);
                    if !self.generated.contains(target) {
                        self.staged_blocks.push_back(target);
                    }
                }
            }
            Exit::ConditionalJump { non_zero, zero, .. } => {
                let non_zero_label = self.block_label(non_zero);
                self.assembly.append_jump_to_if(non_zero_label);
                self.stack.pop();

                assert_layout_compatible(&self.stack, &self.layout.block(non_zero).entry);
                assert_layout_compatible(&self.stack, &self.layout.block(zero).entry);

                if !self.generated.contains(non_zero) {
                    self.staged_blocks.push_back(non_zero);
                }

                let zero_label = self.block_label(zero);
                if self.generated.contains(zero) {
                    self.assembly
                        .append_jump_to(zero_label, 0, JumpKind::Ordinary);
                } else {
                    self.emit_block(zero);
                }
            }
            Exit::FunctionReturn { function } => {
                assert_eq!(self.current_function, Some(function));
                let info = self.graph.function(function);
                let mut exit_stack: Stack = info
                    .return_variables
                    .iter()
                    .map(|v| StackSlot::Variable(*v))
                    .collect();
                exit_stack.push(StackSlot::FunctionReturnLabel);

                self.create_stack_layout(&exit_stack);
                self.assembly.set_source_location(info.loc);
                self.assembly.append_jump(0, JumpKind::OutOfFunction);
                self.assembly.set_stack_height(0);
                self.stack.clear();
            }
            Exit::Terminated => {}
        }
    }

    fn visit_operation(&mut self, operation: &Operation) {
        match &operation.kind {
            OpKind::BuiltinCall { call, arguments } => {
                let call_site = self.graph.call(*call);
                self.validate_arguments(&call_site.arguments, *arguments);

                self.assembly.set_source_location(operation.loc);
                let builtin = self
                    .dialect
                    .builtin(&call_site.name)
                    .expect("builtin vanished from the dialect");
                builtin.generate_code(*call, self.graph, self.assembly);

                for _ in 0..operation.input.len() {
                    self.stack.pop();
                }
                self.stack.extend(operation.output.iter().copied());
                assert_eq!(self.assembly.stack_height(), self.stack.len());
            }
            OpKind::FunctionCall { call, function } => {
                let return_label = self.return_label(*call);
                let call_site = self.graph.call(*call);
                let arguments = call_site.arguments.len();
                self.validate_arguments(&call_site.arguments, arguments);
                // The caller's return label sits right below the arguments.
                let below_args = self.stack.len() - arguments - 1;
                assert_eq!(
                    self.stack[below_args],
                    StackSlot::CallReturnLabel(*call),
                    "return label missing below the call arguments"
                );

                let info = self.graph.function(*function);
                let height_delta =
                    info.return_variables.len() as i32 - arguments as i32 - 1;
                let function_label = self.function_label(*function);

                self.assembly.set_source_location(operation.loc);
                self.assembly
                    .append_jump_to(function_label, height_delta, JumpKind::IntoFunction);
                self.assembly.append_label(return_label);

                for _ in 0..arguments + 1 {
                    self.stack.pop();
                }
                self.stack.extend(operation.output.iter().copied());
                assert_eq!(self.assembly.stack_height(), self.stack.len());
            }
            OpKind::Assignment { variables } => {
                // Older copies of the assigned variables are dead from here.
                for slot in self.stack.iter_mut() {
                    if let StackSlot::Variable(var) = slot {
                        if variables.contains(var) {
                            *slot = StackSlot::Junk;
                        }
                    }
                }
                let first = self.stack.len() - variables.len();
                for (offset, var) in variables.iter().enumerate() {
                    self.stack[first + offset] = StackSlot::Variable(*var);
                }
            }
        }
    }

    /// Checks the top of the model stack against the shapes of the call's
    /// source arguments.
    fn validate_arguments(&self, shapes: &SmallVec<[ArgShape; 4]>, arguments: usize) {
        let top = &self.stack[self.stack.len() - arguments..];
        for (shape, slot) in shapes.iter().rev().zip(top.iter()) {
            let matches = match shape {
                ArgShape::Literal(value) => *slot == StackSlot::Literal(*value),
                ArgShape::Variable(var) => *slot == StackSlot::Variable(*var),
                ArgShape::Call(call) => {
                    matches!(slot, StackSlot::Temporary { call: c, .. } if c == call)
                }
            };
            assert!(
                matches,
                "stack slot {} does not match the source argument",
                slot.display(self.graph)
            );
        }
    }

    /// Shuffles the model stack (and the runtime stack, via emitted
    /// opcodes) into `target`.
    fn create_stack_layout(&mut self, target: &[StackSlot]) {
        let prefix_len = common_prefix_len(&self.stack, target);

        // If some needed slot already sits out of reach, bring copies up
        // front, deepest first, before the shuffle runs.
        if !unreachable_slots(&self.stack, target).is_empty() {
            let snapshot: Stack = self.stack[prefix_len..].iter().copied().collect();
            let mut by_depth: Vec<(usize, StackSlot)> = target[prefix_len..]
                .iter()
                .filter_map(|slot| {
                    self.stack
                        .iter()
                        .rev()
                        .position(|s| s == slot)
                        .map(|depth| (depth, *slot))
                })
                .collect();
            by_depth.sort_by_key(|(depth, _)| *depth);
            by_depth.dedup();
            for (_, slot) in by_depth.into_iter().rev() {
                if find_slot_offset(&snapshot, slot).is_none() {
                    let depth = self.stack.iter().rev().position(|s| *s == slot).unwrap();
                    self.assembly
                        .append_instruction(Instruction::dup(depth + 1));
                    self.stack.push(slot);
                }
            }
        }

        let mut temporary: Stack = self.stack[prefix_len..].iter().copied().collect();
        let mut ops = EmitShuffle {
            assembly: &mut *self.assembly,
            graph: self.graph,
            prefix: &self.stack[..prefix_len],
            return_labels: &mut self.return_labels,
            current_function: self.current_function,
        };
        shuffle_stack(&mut temporary, &target[prefix_len..], &mut ops);

        self.stack.truncate(prefix_len);
        self.stack.extend(temporary);
        debug_assert_eq!(self.stack.as_slice(), target);
    }

    fn emit_function(&mut self, function: FuncId) {
        assert!(self.current_function.is_none());
        self.current_function = Some(function);
        let info = self.graph.function(function);

        // Frame convention: the caller leaves the return label below the
        // arguments, so the callee sees its first parameter on top.
        self.stack.clear();
        self.stack.push(StackSlot::FunctionReturnLabel);
        for param in info.parameters.iter().rev() {
            self.stack.push(StackSlot::Variable(*param));
        }
        self.assembly.set_stack_height(self.stack.len());
        self.assembly.set_source_location(info.loc);

        let label = self.function_labels[&function];
        self.assembly.append_label(label);

        let entry_layout = self.layout.block(info.entry).entry.clone();
        let entry = info.entry;
        self.create_stack_layout(&entry_layout);
        self.emit_block(entry);

        self.current_function = None;
    }

    fn generate_staged(&mut self) {
        self.drain_staged_blocks();

        let mut next = 0;
        while next < self.staged_functions.len() {
            let function = self.staged_functions[next];
            next += 1;

            if self.generated_functions.insert(function) {
                self.emit_function(function);
            }
            // Blocks staged while emitting the function body belong to it
            // and need its frame context.
            assert!(self.current_function.is_none());
            self.current_function = Some(function);
            self.drain_staged_blocks();
            self.current_function = None;
        }
    }

    fn drain_staged_blocks(&mut self) {
        while let Some(block) = self.staged_blocks.pop_front() {
            self.stack = self.layout.block(block).entry.clone();
            self.assembly.set_stack_height(self.stack.len());
            self.emit_block(block);
        }
    }

    fn block_label(&mut self, block: BlockId) -> LabelId {
        if let Some(&label) = self.block_labels.get(&block) {
            return label;
        }
        let label = self.assembly.new_label();
        self.block_labels.insert(block, label);
        label
    }

    fn function_label(&mut self, function: FuncId) -> LabelId {
        if let Some(&label) = self.function_labels.get(&function) {
            return label;
        }
        let info = self.graph.function(function);
        let label = if self.use_named_labels {
            self.assembly.named_label(
                &info.name,
                info.parameters.len(),
                info.return_variables.len(),
            )
        } else {
            self.assembly.new_label()
        };
        self.function_labels.insert(function, label);
        self.staged_functions.push(function);
        label
    }

    fn return_label(&mut self, call: CallId) -> LabelId {
        if let Some(&label) = self.return_labels.get(&call) {
            return label;
        }
        let label = self.assembly.new_label();
        self.return_labels.insert(call, label);
        label
    }
}

/// Two stacks agree if they match slot for slot, junk standing in for
/// anything.
fn assert_layout_compatible(current: &[StackSlot], desired: &[StackSlot]) {
    for (current_slot, desired_slot) in current.iter().zip(desired.iter()) {
        assert!(
            *desired_slot == StackSlot::Junk || current_slot == desired_slot,
            "incompatible stack layouts"
        );
    }
}

/// Shuffle sink that emits opcodes and materializes pushed slots.
struct EmitShuffle<'a> {
    assembly: &'a mut dyn Assembly,
    graph: &'a DataFlowGraph,
    /// Common prefix of the model stack the shuffle never touches.
    prefix: &'a [StackSlot],
    return_labels: &'a mut FxHashMap<CallId, LabelId>,
    current_function: Option<FuncId>,
}

impl EmitShuffle<'_> {
    fn is_return_variable(&self, var: VarId) -> bool {
        self.current_function
            .map(|function| {
                self.graph
                    .function(function)
                    .return_variables
                    .contains(&var)
            })
            .unwrap_or(false)
    }
}

impl ShuffleOps for EmitShuffle<'_> {
    fn swap(&mut self, depth: usize, _current: &[StackSlot]) {
        self.assembly.append_instruction(Instruction::swap(depth));
    }

    fn dup(&mut self, depth: usize, _current: &[StackSlot]) {
        self.assembly.append_instruction(Instruction::dup(depth));
    }

    fn push(&mut self, slot: &StackSlot, current: &[StackSlot]) {
        // Prefer duplicating an existing copy, wherever one lives.
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
        if let Some(depth) = depth {
            self.assembly.append_instruction(Instruction::dup(depth + 1));
            return;
        }

        match *slot {
            StackSlot::Literal(value) => self.assembly.append_constant(value),
            StackSlot::CallReturnLabel(call) => {
                let label = *self
                    .return_labels
                    .entry(call)
                    .or_insert_with(|| self.assembly.new_label());
                self.assembly.append_label_reference(label);
            }
            StackSlot::Variable(var) if self.is_return_variable(var) => {
                // Return variables start out zero-initialized.
                self.assembly.append_constant(U256::zero());
            }
            StackSlot::Junk => {
                // Cheapest deterministic filler; the value is never read.
                self.assembly.append_instruction(Instruction::Pc);
            }
            _ => panic!(
                "slot {} cannot be materialized",
                slot.display(self.graph)
            ),
        }
    }

    fn pop(&mut self) {
        self.assembly.append_instruction(Instruction::Pop);
    }
}
