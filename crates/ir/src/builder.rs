//! Lowering of the structured AST into the data flow graph.
//!
//! A single pass over the tree. Expressions produce [`StackSlot`]s,
//! statements append [`Operation`]s to the current block and split it at
//! control flow. After construction, predecessor edges coming from blocks
//! that are unreachable from the program entry or any function entry are
//! pruned.

use primitive_types::U256;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};
use smol_str::SmolStr;
use thiserror::Error;

use crate::analysis::{AnalysisInfo, DeclId, ScopeEntry, ScopeId};
use crate::ast;
use crate::dialect::Dialect;
use crate::graph::{
    ArgShape, BasicBlock, BlockId, CallSite, DataFlowGraph, Exit, FunctionInfo, OpKind, Operation,
    VarId,
};
use crate::slot::{Stack, StackSlot};

#[derive(Debug, Clone, Error)]
pub enum BuildError {
    /// The name resolves to nothing in scope. External identifier access is
    /// not supported; the upstream pipeline rejects such programs.
    #[error("identifier `{0}` does not resolve to a declaration")]
    UnresolvedIdentifier(SmolStr),
}

struct ForLoopInfo {
    after_loop: BlockId,
    post: BlockId,
}

pub struct GraphBuilder<'a> {
    graph: &'a mut DataFlowGraph,
    info: &'a AnalysisInfo,
    dialect: &'a dyn Dialect,
    /// Scope declarations already interned into the graph's variable arena.
    vars: FxHashMap<DeclId, VarId>,
    current: Option<BlockId>,
    scope: Option<ScopeId>,
    for_loop: Option<ForLoopInfo>,
    function_exit: Option<BlockId>,
}

impl<'a> GraphBuilder<'a> {
    /// Lowers `root` into a fresh graph.
    pub fn build(
        info: &AnalysisInfo,
        dialect: &dyn Dialect,
        root: &ast::Block,
    ) -> Result<DataFlowGraph, BuildError> {
        let mut graph = DataFlowGraph::new();
        let entry = graph.entry;
        let mut builder = GraphBuilder {
            graph: &mut graph,
            info,
            dialect,
            vars: FxHashMap::default(),
            current: Some(entry),
            scope: None,
            for_loop: None,
            function_exit: None,
        };
        builder.block(root)?;
        prune_unreachable_entries(&mut graph);
        Ok(graph)
    }

    fn cur(&mut self) -> &mut BasicBlock {
        let id = self.current.expect("no current block");
        self.graph.block_mut(id)
    }

    fn lookup_variable(&mut self, ident: &ast::Identifier) -> Result<VarId, BuildError> {
        let scope = self.scope.expect("no current scope");
        match self.info.lookup(scope, &ident.name) {
            Some(ScopeEntry::Variable(decl)) => Ok(self.intern_decl(decl)),
            Some(ScopeEntry::Function(_)) => {
                panic!("`{}` names a function where a variable is expected", ident.name)
            }
            None => Err(BuildError::UnresolvedIdentifier(ident.name.clone())),
        }
    }

    fn intern_decl(&mut self, decl: DeclId) -> VarId {
        if let Some(&var) = self.vars.get(&decl) {
            return var;
        }
        let data = self.info.decl(decl);
        let var = self.graph.make_var(data.name.clone(), data.loc);
        self.vars.insert(decl, var);
        var
    }

    fn expression(&mut self, expression: &ast::Expression) -> Result<StackSlot, BuildError> {
        match expression {
            ast::Expression::Literal(lit) => Ok(StackSlot::Literal(lit.value)),
            ast::Expression::Identifier(ident) => {
                Ok(StackSlot::Variable(self.lookup_variable(ident)?))
            }
            ast::Expression::FunctionCall(call) => {
                let output = self.visit_call(call)?;
                assert_eq!(output.len(), 1, "expression call must return a single value");
                Ok(output[0])
            }
        }
    }

    /// Appends the operation for a call and returns its output slots.
    ///
    /// Arguments are evaluated right to left, so the first source argument
    /// ends up on top of the stack.
    fn visit_call(&mut self, call: &ast::FunctionCall) -> Result<Stack, BuildError> {
        let dialect = self.dialect;
        let name = &call.name.name;

        if let Some(builtin) = dialect.builtin(name) {
            let mut input = Stack::new();
            for (index, argument) in call.arguments.iter().enumerate().rev() {
                if builtin.literal_argument(index) {
                    assert!(
                        argument.as_literal().is_some(),
                        "literal argument of `{name}` must be a literal expression"
                    );
                    continue;
                }
                input.push(self.expression(argument)?);
            }
            let arguments = input.len();
            let call_id = self.graph.make_call(CallSite {
                name: name.clone(),
                arguments: shapes_in_source_order(&input),
                returns: builtin.returns() as u16,
                loc: call.loc,
            });
            let output: Stack = (0..builtin.returns())
                .map(|index| StackSlot::Temporary {
                    call: call_id,
                    index: index as u16,
                })
                .collect();
            self.cur().operations.push(Operation {
                input,
                output: output.clone(),
                kind: OpKind::BuiltinCall {
                    call: call_id,
                    arguments,
                },
                loc: call.loc,
            });
            Ok(output)
        } else {
            let scope = self.scope.expect("no current scope");
            let function = match self.info.lookup(scope, name) {
                Some(ScopeEntry::Function(function)) => function,
                Some(ScopeEntry::Variable(_)) => {
                    panic!("`{name}` names a variable where a function is expected")
                }
                None => return Err(BuildError::UnresolvedIdentifier(name.clone())),
            };
            let decl = self.info.function(function);
            assert_eq!(decl.parameters, call.arguments.len(), "call arity mismatch");
            let returns = decl.returns;

            let mut reversed_args = Stack::new();
            for argument in call.arguments.iter().rev() {
                reversed_args.push(self.expression(argument)?);
            }
            let call_id = self.graph.make_call(CallSite {
                name: name.clone(),
                arguments: shapes_in_source_order(&reversed_args),
                returns: returns as u16,
                loc: call.loc,
            });
            let mut input = Stack::new();
            input.push(StackSlot::CallReturnLabel(call_id));
            input.extend(reversed_args);
            let output: Stack = (0..returns)
                .map(|index| StackSlot::Temporary {
                    call: call_id,
                    index: index as u16,
                })
                .collect();
            self.cur().operations.push(Operation {
                input,
                output: output.clone(),
                kind: OpKind::FunctionCall {
                    call: call_id,
                    function,
                },
                loc: call.loc,
            });
            Ok(output)
        }
    }

    fn block(&mut self, block: &ast::Block) -> Result<(), BuildError> {
        let saved = self.scope;
        self.scope = Some(self.info.scope_of_block(block.id));
        for statement in &block.statements {
            self.statement(statement)?;
        }
        self.scope = saved;
        Ok(())
    }

    fn statement(&mut self, statement: &ast::Statement) -> Result<(), BuildError> {
        match statement {
            ast::Statement::Expression(stmt) => self.expression_statement(stmt),
            ast::Statement::VariableDeclaration(stmt) => self.variable_declaration(stmt),
            ast::Statement::Assignment(stmt) => self.assignment(stmt),
            ast::Statement::If(stmt) => self.if_statement(stmt),
            ast::Statement::Switch(stmt) => self.switch_statement(stmt),
            ast::Statement::ForLoop(stmt) => self.for_loop(stmt),
            ast::Statement::Break(_) => {
                let target = self
                    .for_loop
                    .as_ref()
                    .expect("`break` outside of a loop")
                    .after_loop;
                self.jump(target);
                self.current = Some(self.graph.make_block());
                Ok(())
            }
            ast::Statement::Continue(_) => {
                let target = self
                    .for_loop
                    .as_ref()
                    .expect("`continue` outside of a loop")
                    .post;
                self.jump(target);
                self.current = Some(self.graph.make_block());
                Ok(())
            }
            ast::Statement::Leave(_) => {
                let target = self.function_exit.expect("`leave` outside of a function");
                self.jump(target);
                self.current = Some(self.graph.make_block());
                Ok(())
            }
            ast::Statement::Block(block) => self.block(block),
            ast::Statement::FunctionDefinition(def) => self.function_definition(def),
        }
    }

    fn expression_statement(&mut self, stmt: &ast::ExpressionStatement) -> Result<(), BuildError> {
        let ast::Expression::FunctionCall(call) = &stmt.expression else {
            panic!("only calls can appear in statement position");
        };
        let output = self.visit_call(call)?;
        assert!(output.is_empty(), "statement call must not return values");

        let dialect = self.dialect;
        if let Some(builtin) = dialect.builtin(&call.name.name) {
            if builtin.control_flow_side_effects().terminates {
                self.cur().exit = Exit::Terminated;
                self.current = Some(self.graph.make_block());
            }
        }
        Ok(())
    }

    fn variable_declaration(&mut self, stmt: &ast::VariableDeclaration) -> Result<(), BuildError> {
        let variables: SmallVec<[VarId; 2]> = stmt
            .variables
            .iter()
            .map(|v| self.lookup_variable(v))
            .collect::<Result<_, _>>()?;
        let input = match &stmt.value {
            // Uninitialized declarations are zero-initialized.
            None => (0..variables.len())
                .map(|_| StackSlot::Literal(U256::zero()))
                .collect(),
            Some(value) => self.rhs_slots(value, variables.len())?,
        };
        self.append_assignment(variables, input, stmt.loc);
        Ok(())
    }

    fn assignment(&mut self, stmt: &ast::Assignment) -> Result<(), BuildError> {
        let variables: SmallVec<[VarId; 2]> = stmt
            .targets
            .iter()
            .map(|v| self.lookup_variable(v))
            .collect::<Result<_, _>>()?;
        let input = self.rhs_slots(&stmt.value, variables.len())?;
        self.append_assignment(variables, input, stmt.loc);
        Ok(())
    }

    fn rhs_slots(
        &mut self,
        value: &ast::Expression,
        expected: usize,
    ) -> Result<Stack, BuildError> {
        match value {
            ast::Expression::FunctionCall(call) => {
                let output = self.visit_call(call)?;
                assert_eq!(output.len(), expected, "value count mismatch in assignment");
                Ok(output)
            }
            other => {
                assert_eq!(expected, 1, "a single value cannot bind multiple variables");
                Ok(smallvec![self.expression(other)?])
            }
        }
    }

    fn append_assignment(&mut self, variables: SmallVec<[VarId; 2]>, input: Stack, loc: ast::SourceLoc) {
        let output: Stack = variables
            .iter()
            .map(|v| StackSlot::Variable(*v))
            .collect();
        self.cur().operations.push(Operation {
            input,
            output,
            kind: OpKind::Assignment { variables },
            loc,
        });
    }

    fn if_statement(&mut self, stmt: &ast::If) -> Result<(), BuildError> {
        let condition = self.expression(&stmt.condition)?;
        let (if_branch, after_if) = self.make_conditional_jump(condition);
        self.current = Some(if_branch);
        self.block(&stmt.body)?;
        self.jump(after_if);
        Ok(())
    }

    fn switch_statement(&mut self, stmt: &ast::Switch) -> Result<(), BuildError> {
        let scrutinee = self.expression(&stmt.expression)?;
        // Bind the scrutinee to a ghost variable so every case comparison is
        // an explicit dataflow operation.
        let ghost = self.graph.make_ghost_var();
        self.append_assignment(smallvec![ghost], smallvec![scrutinee], stmt.loc);

        let after_switch = self.graph.make_block();
        let (last, head) = stmt
            .cases
            .split_last()
            .expect("switch must have at least one case");

        for case in head {
            let value = case
                .value
                .as_ref()
                .expect("only the last case may be the default");
            let compare = self.make_value_compare(ghost, value, stmt.loc);
            let (case_branch, else_branch) = self.make_conditional_jump(compare);
            self.current = Some(case_branch);
            self.block(&case.body)?;
            self.jump(after_switch);
            self.current = Some(else_branch);
        }

        if let Some(value) = &last.value {
            let compare = self.make_value_compare(ghost, value, stmt.loc);
            let case_branch = self.graph.make_block();
            self.set_conditional_jump(compare, case_branch, after_switch);
            self.current = Some(case_branch);
            self.block(&last.body)?;
        } else {
            self.block(&last.body)?;
        }
        self.jump(after_switch);
        Ok(())
    }

    /// `eq(value, ghost)` against a ghost call site; returns the comparison
    /// result slot.
    fn make_value_compare(
        &mut self,
        ghost: VarId,
        value: &ast::Literal,
        loc: ast::SourceLoc,
    ) -> StackSlot {
        let equality = self.dialect.equality_builtin();
        assert_eq!(equality.parameters(), 2, "equality builtin must be binary");
        assert_eq!(equality.returns(), 1, "equality builtin must return one value");

        let call_id = self.graph.make_call(CallSite {
            name: equality.name().into(),
            arguments: smallvec![
                ArgShape::Literal(value.value),
                ArgShape::Variable(ghost)
            ],
            returns: 1,
            loc,
        });
        let result = StackSlot::Temporary {
            call: call_id,
            index: 0,
        };
        self.cur().operations.push(Operation {
            input: smallvec![StackSlot::Variable(ghost), StackSlot::Literal(value.value)],
            output: smallvec![result],
            kind: OpKind::BuiltinCall {
                call: call_id,
                arguments: 2,
            },
            loc,
        });
        result
    }

    fn for_loop(&mut self, stmt: &ast::ForLoop) -> Result<(), BuildError> {
        // The pre block's scope spans condition, body and post.
        let saved_scope = self.scope;
        self.scope = Some(self.info.scope_of_block(stmt.pre.id));
        self.block(&stmt.pre)?;

        // A constant condition specializes the loop shape.
        let constant_condition = stmt.condition.as_literal().map(|value| !value.is_zero());

        let loop_condition = self.graph.make_block();
        let loop_body = self.graph.make_block();
        let post = self.graph.make_block();
        let after_loop = self.graph.make_block();

        let saved_loop = self.for_loop.replace(ForLoopInfo { after_loop, post });
        match constant_condition {
            Some(true) => {
                self.jump(loop_body);
                self.block(&stmt.body)?;
                self.jump(post);
                self.block(&stmt.post)?;
                self.jump_backwards(loop_body);
            }
            Some(false) => {
                self.jump(after_loop);
            }
            None => {
                self.jump(loop_condition);
                let condition = self.expression(&stmt.condition)?;
                self.set_conditional_jump(condition, loop_body, after_loop);
                self.current = Some(loop_body);
                self.block(&stmt.body)?;
                self.jump(post);
                self.block(&stmt.post)?;
                self.jump_backwards(loop_condition);
            }
        }
        self.for_loop = saved_loop;
        self.current = Some(after_loop);
        self.scope = saved_scope;
        Ok(())
    }

    fn function_definition(&mut self, def: &ast::FunctionDefinition) -> Result<(), BuildError> {
        let scope = self.scope.expect("no current scope");
        let Some(ScopeEntry::Function(function)) = self.info.lookup(scope, &def.name) else {
            panic!("function `{}` is not registered in scope", def.name);
        };

        let virtual_scope = self.info.virtual_scope(function);
        let mut virtual_var = |builder: &mut Self, ident: &ast::Identifier| -> VarId {
            let Some(ScopeEntry::Variable(decl)) = builder.info.lookup(virtual_scope, &ident.name)
            else {
                panic!("`{}` missing from the function's virtual scope", ident.name);
            };
            builder.intern_decl(decl)
        };
        let parameters: SmallVec<[VarId; 4]> = def
            .parameters
            .iter()
            .map(|p| virtual_var(self, p))
            .collect();
        let return_variables: SmallVec<[VarId; 4]> =
            def.returns.iter().map(|r| virtual_var(self, r)).collect();

        let entry = self.graph.make_block();
        self.graph.functions.insert(
            function,
            FunctionInfo {
                function,
                name: def.name.clone(),
                entry,
                parameters,
                return_variables,
                loc: def.loc,
            },
        );

        let exit = self.graph.make_block();
        self.graph.block_mut(exit).exit = Exit::FunctionReturn { function };

        // The body is lowered with fresh builder state; in particular a
        // loop surrounding the definition must not capture `break`s.
        let saved = (
            self.current,
            self.scope,
            self.for_loop.take(),
            self.function_exit,
        );
        self.current = Some(entry);
        self.function_exit = Some(exit);
        self.block(&def.body)?;
        self.jump(exit);
        (self.current, self.scope, self.for_loop, self.function_exit) = saved;
        Ok(())
    }

    fn make_conditional_jump(&mut self, condition: StackSlot) -> (BlockId, BlockId) {
        let non_zero = self.graph.make_block();
        let zero = self.graph.make_block();
        self.set_conditional_jump(condition, non_zero, zero);
        (non_zero, zero)
    }

    fn set_conditional_jump(&mut self, condition: StackSlot, non_zero: BlockId, zero: BlockId) {
        let current = self.current.expect("no current block");
        self.graph.block_mut(current).exit = Exit::ConditionalJump {
            condition,
            non_zero,
            zero,
        };
        self.graph.block_mut(non_zero).entries.push(current);
        self.graph.block_mut(zero).entries.push(current);
        self.current = None;
    }

    fn jump(&mut self, target: BlockId) {
        self.jump_inner(target, false);
    }

    fn jump_backwards(&mut self, target: BlockId) {
        self.jump_inner(target, true);
    }

    fn jump_inner(&mut self, target: BlockId, backwards: bool) {
        let current = self.current.expect("no current block");
        self.graph.block_mut(current).exit = Exit::Jump { target, backwards };
        self.graph.block_mut(target).entries.push(current);
        self.current = Some(target);
    }
}

fn shapes_in_source_order(reversed_input: &[StackSlot]) -> SmallVec<[ArgShape; 4]> {
    reversed_input
        .iter()
        .rev()
        .map(|slot| match *slot {
            StackSlot::Literal(value) => ArgShape::Literal(value),
            StackSlot::Variable(var) => ArgShape::Variable(var),
            StackSlot::Temporary { call, .. } => ArgShape::Call(call),
            _ => unreachable!("argument expressions produce literal, variable or call slots"),
        })
        .collect()
}

/// Drops predecessor edges that originate in blocks unreachable from the
/// program entry or any function entry. Unreachable blocks stay in the arena
/// but end up orphaned.
fn prune_unreachable_entries(graph: &mut DataFlowGraph) {
    let mut worklist: Vec<BlockId> = vec![graph.entry];
    worklist.extend(graph.functions.values().map(|info| info.entry));
    let mut visited: FxHashSet<BlockId> = worklist.iter().copied().collect();

    while let Some(block) = worklist.pop() {
        for succ in graph.block(block).exit.successors() {
            if visited.insert(succ) {
                worklist.push(succ);
            }
        }
    }

    let reachable: Vec<BlockId> = visited.iter().copied().collect();
    for block in reachable {
        graph
            .block_mut(block)
            .entries
            .retain(|entry| visited.contains(entry));
    }
}
