pub mod analysis;
pub mod ast;
pub mod builder;
pub mod dialect;
pub mod graph;
pub mod isa;
pub mod slot;
pub mod test_util;

pub use analysis::{analyze, AnalysisInfo, FuncId};
pub use builder::{BuildError, GraphBuilder};
pub use dialect::{BaseDialect, Builtin, ControlFlowSideEffects, Dialect};
pub use graph::{
    BasicBlock, BlockId, CallId, DataFlowGraph, Exit, FunctionInfo, OpKind, Operation, VarId,
};
pub use isa::{Assembly, Instruction, JumpKind, LabelId, REACHABLE_DEPTH};
pub use slot::{display_stack, find_all_slot_offsets, find_slot_offset, Stack, StackSlot};

pub use primitive_types::U256;
