//! The data flow graph: basic blocks of stack operations, linked into a
//! control flow graph.
//!
//! All nodes live in append-only arenas owned by [`DataFlowGraph`], so block,
//! variable and call-site references are plain ids that stay valid for the
//! whole pipeline. Back-edges are ids like any other edge; there is no owning
//! cycle anywhere.

use cranelift_entity::entity_impl;
use cranelift_entity::PrimaryMap;
use indexmap::IndexMap;
use primitive_types::U256;
use smallvec::SmallVec;
use smol_str::{format_smolstr, SmolStr};

use crate::analysis::FuncId;
use crate::ast::SourceLoc;
use crate::slot::Stack;

/// An opaque reference to a [`BasicBlock`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);
entity_impl!(BlockId, "block");

/// An opaque reference to a [`Variable`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub u32);
entity_impl!(VarId, "var");

/// An opaque reference to a [`CallSite`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallId(pub u32);
entity_impl!(CallId, "call");

/// A variable the graph knows about: either a scope variable interned by the
/// builder, or a ghost variable synthesized while lowering `switch`.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: SmolStr,
    pub loc: SourceLoc,
}

/// The shape of one stack-passed call argument, kept for consistency checks
/// at emission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgShape {
    Literal(U256),
    Variable(VarId),
    Call(CallId),
}

/// One call site, interned per AST call expression (plus one ghost site per
/// `switch` case comparison).
#[derive(Debug, Clone)]
pub struct CallSite {
    /// Callee name (builtin or user function).
    pub name: SmolStr,
    /// Shapes of the stack-passed arguments, in source order.
    pub arguments: SmallVec<[ArgShape; 4]>,
    pub returns: u16,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub enum OpKind {
    /// A dialect builtin. `arguments` is the number of stack-passed
    /// arguments (literal arguments are inlined at emission).
    BuiltinCall { call: CallId, arguments: usize },
    /// A user function call; `input` starts with the call's return label at
    /// the bottom.
    FunctionCall { call: CallId, function: FuncId },
    /// Binding of the top `variables.len()` slots to variables, in source
    /// order (last variable on top).
    Assignment { variables: SmallVec<[VarId; 2]> },
}

/// One step of a basic block: consumes `input` from the top of the stack and
/// leaves `output` there.
#[derive(Debug, Clone)]
pub struct Operation {
    pub input: Stack,
    pub output: Stack,
    pub kind: OpKind,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, Default)]
pub enum Exit {
    /// Program halt.
    #[default]
    MainExit,
    Jump {
        target: BlockId,
        /// Set only on the back-edge of a loop.
        backwards: bool,
    },
    ConditionalJump {
        condition: crate::slot::StackSlot,
        non_zero: BlockId,
        zero: BlockId,
    },
    FunctionReturn {
        function: FuncId,
    },
    /// Unreachable tail after a terminating builtin; nothing is emitted.
    Terminated,
}

impl Exit {
    /// All successor blocks, back-edges included.
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match *self {
            Exit::Jump { target, .. } => [target].into_iter().collect(),
            Exit::ConditionalJump { non_zero, zero, .. } => {
                [non_zero, zero].into_iter().collect()
            }
            Exit::MainExit | Exit::FunctionReturn { .. } | Exit::Terminated => SmallVec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    /// Predecessors; pruned to reachable blocks after construction.
    pub entries: SmallVec<[BlockId; 4]>,
    pub operations: Vec<Operation>,
    pub exit: Exit,
}

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub function: FuncId,
    pub name: SmolStr,
    pub entry: BlockId,
    pub parameters: SmallVec<[VarId; 4]>,
    pub return_variables: SmallVec<[VarId; 4]>,
    pub loc: SourceLoc,
}

#[derive(Debug)]
pub struct DataFlowGraph {
    pub blocks: PrimaryMap<BlockId, BasicBlock>,
    pub vars: PrimaryMap<VarId, Variable>,
    pub calls: PrimaryMap<CallId, CallSite>,
    /// Program start.
    pub entry: BlockId,
    /// One entry per user function, in definition order.
    pub functions: IndexMap<FuncId, FunctionInfo>,
    ghost_count: u32,
}

impl DataFlowGraph {
    pub fn new() -> Self {
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(BasicBlock::default());
        Self {
            blocks,
            vars: PrimaryMap::new(),
            calls: PrimaryMap::new(),
            entry,
            functions: IndexMap::new(),
            ghost_count: 0,
        }
    }

    pub fn make_block(&mut self) -> BlockId {
        self.blocks.push(BasicBlock::default())
    }

    pub fn make_var(&mut self, name: SmolStr, loc: SourceLoc) -> VarId {
        self.vars.push(Variable { name, loc })
    }

    /// A fresh variable with no source counterpart, used to lower `switch`.
    pub fn make_ghost_var(&mut self) -> VarId {
        let name = format_smolstr!("GHOST[{}]", self.ghost_count);
        self.ghost_count += 1;
        self.vars.push(Variable {
            name,
            loc: SourceLoc::NONE,
        })
    }

    pub fn make_call(&mut self, call: CallSite) -> CallId {
        self.calls.push(call)
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id]
    }

    pub fn var(&self, id: VarId) -> &Variable {
        &self.vars[id]
    }

    pub fn call(&self, id: CallId) -> &CallSite {
        &self.calls[id]
    }

    pub fn function(&self, id: FuncId) -> &FunctionInfo {
        &self.functions[&id]
    }

    /// `input`/`output` of every operation expressed as a stack delta; used
    /// by consistency checks.
    pub fn apply_operation(stack: &mut Stack, operation: &Operation) {
        for _ in 0..operation.input.len() {
            stack.pop();
        }
        stack.extend(operation.output.iter().copied());
    }
}

impl Default for DataFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}
