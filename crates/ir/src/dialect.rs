//! Builtin dialects.
//!
//! The graph builder and the code generator query builtins through the
//! [`Dialect`] trait: arity and control-flow effects during lowering, opcode
//! emission during code generation. [`BaseDialect`] is the stock catalogue,
//! mapping each builtin to a single VM instruction.

use crate::graph::{CallId, DataFlowGraph};
use crate::isa::{Assembly, Instruction};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlFlowSideEffects {
    /// The builtin never returns; everything after it is unreachable.
    pub terminates: bool,
}

pub trait Builtin {
    fn name(&self) -> &str;
    /// Total number of arguments, literal ones included.
    fn parameters(&self) -> usize;
    fn returns(&self) -> usize;
    /// Whether argument `index` is consumed as an immediate instead of being
    /// passed on the stack.
    fn literal_argument(&self, index: usize) -> bool;
    fn control_flow_side_effects(&self) -> ControlFlowSideEffects {
        ControlFlowSideEffects::default()
    }
    /// Emits the builtin's code. The stack arguments are on top of the stack
    /// in callee order when this runs.
    fn generate_code(&self, call: CallId, graph: &DataFlowGraph, assembly: &mut dyn Assembly);
}

pub trait Dialect {
    fn builtin(&self, name: &str) -> Option<&dyn Builtin>;
    /// The builtin used for the synthetic case comparisons of `switch`.
    fn equality_builtin(&self) -> &dyn Builtin;
}

/// A builtin backed by exactly one instruction.
#[derive(Debug, Clone, Copy)]
struct OpcodeBuiltin {
    name: &'static str,
    instruction: Instruction,
    terminates: bool,
}

impl Builtin for OpcodeBuiltin {
    fn name(&self) -> &str {
        self.name
    }

    fn parameters(&self) -> usize {
        self.instruction.pops()
    }

    fn returns(&self) -> usize {
        self.instruction.pushes()
    }

    fn literal_argument(&self, _index: usize) -> bool {
        false
    }

    fn control_flow_side_effects(&self) -> ControlFlowSideEffects {
        ControlFlowSideEffects {
            terminates: self.terminates,
        }
    }

    fn generate_code(&self, _call: CallId, _graph: &DataFlowGraph, assembly: &mut dyn Assembly) {
        assembly.append_instruction(self.instruction);
    }
}

/// The stock EVM-flavoured dialect.
pub struct BaseDialect {
    builtins: Vec<OpcodeBuiltin>,
}

impl BaseDialect {
    pub fn new() -> Self {
        use Instruction::*;
        let table = [
            ("add", Add),
            ("mul", Mul),
            ("sub", Sub),
            ("div", Div),
            ("mod", Mod),
            ("lt", Lt),
            ("gt", Gt),
            ("eq", Eq),
            ("iszero", IsZero),
            ("and", And),
            ("or", Or),
            ("xor", Xor),
            ("not", Not),
            ("mload", MLoad),
            ("mstore", MStore),
            ("sload", SLoad),
            ("sstore", SStore),
        ];
        let mut builtins: Vec<OpcodeBuiltin> = table
            .into_iter()
            .map(|(name, instruction)| OpcodeBuiltin {
                name,
                instruction,
                terminates: false,
            })
            .collect();
        builtins.extend([
            OpcodeBuiltin {
                name: "stop",
                instruction: Stop,
                terminates: true,
            },
            OpcodeBuiltin {
                name: "revert",
                instruction: Revert,
                terminates: true,
            },
            OpcodeBuiltin {
                name: "return",
                instruction: Return,
                terminates: true,
            },
        ]);
        Self { builtins }
    }

    /// Extends the catalogue with another single-opcode builtin.
    pub fn with_builtin(
        mut self,
        name: &'static str,
        instruction: Instruction,
        terminates: bool,
    ) -> Self {
        self.builtins.push(OpcodeBuiltin {
            name,
            instruction,
            terminates,
        });
        self
    }
}

impl Default for BaseDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for BaseDialect {
    fn builtin(&self, name: &str) -> Option<&dyn Builtin> {
        self.builtins
            .iter()
            .find(|b| b.name == name)
            .map(|b| b as &dyn Builtin)
    }

    fn equality_builtin(&self) -> &dyn Builtin {
        self.builtin("eq").expect("base dialect defines `eq`")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_catalogue() {
        let dialect = BaseDialect::new();

        let add = dialect.builtin("add").unwrap();
        assert_eq!(add.parameters(), 2);
        assert_eq!(add.returns(), 1);
        assert!(!add.control_flow_side_effects().terminates);

        assert!(dialect
            .builtin("revert")
            .unwrap()
            .control_flow_side_effects()
            .terminates);
        assert!(dialect.builtin("keccak256").is_none());
        assert_eq!(dialect.equality_builtin().name(), "eq");
    }

    #[test]
    fn extending_the_catalogue() {
        let dialect = BaseDialect::new().with_builtin("pc", Instruction::Pc, false);

        let pc = dialect.builtin("pc").unwrap();
        assert_eq!(pc.parameters(), 0);
        assert_eq!(pc.returns(), 1);
        assert!(!pc.control_flow_side_effects().terminates);
    }
}
