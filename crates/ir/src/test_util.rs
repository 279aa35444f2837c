//! Construction sugar for tests: hand-building ASTs without a parser.

use primitive_types::U256;
use smol_str::SmolStr;

use crate::analysis::{analyze, AnalysisInfo};
use crate::ast::*;
use crate::builder::GraphBuilder;
use crate::dialect::{BaseDialect, Dialect};
use crate::graph::DataFlowGraph;

/// Hands out [`AstId`]s and builds nodes; a stand-in for the parser.
#[derive(Default)]
pub struct AstFactory {
    next_id: u32,
}

impl AstFactory {
    fn id(&mut self) -> AstId {
        let id = AstId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn block(&mut self, statements: impl IntoIterator<Item = Statement>) -> Block {
        Block {
            id: self.id(),
            statements: statements.into_iter().collect(),
            loc: SourceLoc::NONE,
        }
    }

    pub fn lit(&self, value: u64) -> Expression {
        Expression::Literal(Literal {
            value: U256::from(value),
            loc: SourceLoc::NONE,
        })
    }

    pub fn ident(&self, name: &str) -> Expression {
        Expression::Identifier(self.name(name))
    }

    pub fn name(&self, name: &str) -> Identifier {
        Identifier {
            name: SmolStr::new(name),
            loc: SourceLoc::NONE,
        }
    }

    pub fn call(&self, name: &str, arguments: impl IntoIterator<Item = Expression>) -> Expression {
        Expression::FunctionCall(FunctionCall {
            name: self.name(name),
            arguments: arguments.into_iter().collect(),
            loc: SourceLoc::NONE,
        })
    }

    pub fn expr_stmt(&self, expression: Expression) -> Statement {
        Statement::Expression(ExpressionStatement {
            expression,
            loc: SourceLoc::NONE,
        })
    }

    pub fn let_(
        &self,
        names: impl IntoIterator<Item = &'static str>,
        value: Option<Expression>,
    ) -> Statement {
        Statement::VariableDeclaration(VariableDeclaration {
            variables: names.into_iter().map(|n| self.name(n)).collect(),
            value,
            loc: SourceLoc::NONE,
        })
    }

    pub fn let_single(&self, name: &'static str, value: Expression) -> Statement {
        self.let_([name], Some(value))
    }

    pub fn assign(
        &self,
        names: impl IntoIterator<Item = &'static str>,
        value: Expression,
    ) -> Statement {
        Statement::Assignment(Assignment {
            targets: names.into_iter().map(|n| self.name(n)).collect(),
            value,
            loc: SourceLoc::NONE,
        })
    }

    pub fn assign_single(&self, name: &'static str, value: Expression) -> Statement {
        self.assign([name], value)
    }

    pub fn if_(&self, condition: Expression, body: Block) -> Statement {
        Statement::If(If {
            condition,
            body,
            loc: SourceLoc::NONE,
        })
    }

    pub fn case(&self, value: u64, body: Block) -> Case {
        Case {
            value: Some(Literal {
                value: U256::from(value),
                loc: SourceLoc::NONE,
            }),
            body,
            loc: SourceLoc::NONE,
        }
    }

    pub fn default_case(&self, body: Block) -> Case {
        Case {
            value: None,
            body,
            loc: SourceLoc::NONE,
        }
    }

    pub fn switch(&self, expression: Expression, cases: impl IntoIterator<Item = Case>) -> Statement {
        Statement::Switch(Switch {
            expression,
            cases: cases.into_iter().collect(),
            loc: SourceLoc::NONE,
        })
    }

    pub fn for_(
        &self,
        pre: Block,
        condition: Expression,
        post: Block,
        body: Block,
    ) -> Statement {
        Statement::ForLoop(ForLoop {
            pre,
            condition,
            post,
            body,
            loc: SourceLoc::NONE,
        })
    }

    pub fn function(
        &self,
        name: &str,
        parameters: impl IntoIterator<Item = &'static str>,
        returns: impl IntoIterator<Item = &'static str>,
        body: Block,
    ) -> Statement {
        Statement::FunctionDefinition(FunctionDefinition {
            name: SmolStr::new(name),
            parameters: parameters.into_iter().map(|n| self.name(n)).collect(),
            returns: returns.into_iter().map(|n| self.name(n)).collect(),
            body,
            loc: SourceLoc::NONE,
        })
    }

    pub fn break_(&self) -> Statement {
        Statement::Break(SourceLoc::NONE)
    }

    pub fn continue_(&self) -> Statement {
        Statement::Continue(SourceLoc::NONE)
    }

    pub fn leave(&self) -> Statement {
        Statement::Leave(SourceLoc::NONE)
    }
}

pub fn base_dialect() -> BaseDialect {
    BaseDialect::new()
}

/// Analyzes and lowers `root` with the base dialect.
pub fn lower(root: &Block) -> (DataFlowGraph, AnalysisInfo) {
    let info = analyze(root);
    let dialect = base_dialect();
    let graph = GraphBuilder::build(&info, &dialect, root).expect("lowering failed");
    (graph, info)
}

/// Analyzes and lowers `root` with a caller-provided dialect.
pub fn lower_with(root: &Block, dialect: &dyn Dialect) -> (DataFlowGraph, AnalysisInfo) {
    let info = analyze(root);
    let graph = GraphBuilder::build(&info, dialect, root).expect("lowering failed");
    (graph, info)
}
