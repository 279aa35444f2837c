//! Name resolution results consumed by the graph builder.
//!
//! [`AnalysisInfo`] is the backend's view of the upstream analysis pass: a
//! scope per block, a virtual scope per function carrying its parameters and
//! return variables, and arenas giving every declaration a stable identity.
//! [`analyze`] is the standard producer, a single walk over the AST.
//! Semantic validation (duplicate names, reads of undeclared variables in
//! invalid positions, …) is not this module's job; it is assumed to have
//! happened before the backend runs.

use cranelift_entity::entity_impl;
use cranelift_entity::PrimaryMap;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::ast::{self, AstId, SourceLoc};

/// An opaque reference to a [`Scope`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeId(pub u32);
entity_impl!(ScopeId, "scope");

/// An opaque reference to a variable declaration.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeclId(pub u32);
entity_impl!(DeclId, "decl");

/// An opaque reference to a function declaration.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncId(pub u32);
entity_impl!(FuncId, "func");

#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: SmolStr,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: SmolStr,
    pub parameters: usize,
    pub returns: usize,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeEntry {
    Variable(DeclId),
    Function(FuncId),
}

#[derive(Debug, Default)]
pub struct Scope {
    parent: Option<ScopeId>,
    entries: FxHashMap<SmolStr, ScopeEntry>,
}

#[derive(Debug, Default)]
pub struct AnalysisInfo {
    pub scopes: PrimaryMap<ScopeId, Scope>,
    pub decls: PrimaryMap<DeclId, VarDecl>,
    pub functions: PrimaryMap<FuncId, FunctionDecl>,
    block_scopes: FxHashMap<AstId, ScopeId>,
    virtual_scopes: FxHashMap<FuncId, ScopeId>,
}

impl AnalysisInfo {
    /// The scope opened by the given block.
    ///
    /// Panics if the block was not part of the analyzed tree; mixing trees
    /// and analysis results is a caller bug.
    pub fn scope_of_block(&self, block: AstId) -> ScopeId {
        *self
            .block_scopes
            .get(&block)
            .expect("block has no scope; AST and analysis info do not match")
    }

    /// The synthetic scope holding a function's parameters and return
    /// variables.
    pub fn virtual_scope(&self, func: FuncId) -> ScopeId {
        *self
            .virtual_scopes
            .get(&func)
            .expect("function has no virtual scope")
    }

    /// Resolves `name` from `scope` outward through its parents.
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Option<ScopeEntry> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let scope = &self.scopes[id];
            if let Some(entry) = scope.entries.get(name) {
                return Some(*entry);
            }
            current = scope.parent;
        }
        None
    }

    pub fn decl(&self, id: DeclId) -> &VarDecl {
        &self.decls[id]
    }

    pub fn function(&self, id: FuncId) -> &FunctionDecl {
        &self.functions[id]
    }

    fn make_scope(&mut self, parent: Option<ScopeId>) -> ScopeId {
        self.scopes.push(Scope {
            parent,
            entries: FxHashMap::default(),
        })
    }

    fn declare_var(&mut self, scope: ScopeId, name: &ast::Identifier) -> DeclId {
        let decl = self.decls.push(VarDecl {
            name: name.name.clone(),
            loc: name.loc,
        });
        self.scopes[scope]
            .entries
            .insert(name.name.clone(), ScopeEntry::Variable(decl));
        decl
    }
}

/// Builds the [`AnalysisInfo`] for a program rooted at `root`.
pub fn analyze(root: &ast::Block) -> AnalysisInfo {
    let mut info = AnalysisInfo::default();
    visit_block(&mut info, None, root);
    info
}

fn visit_block(info: &mut AnalysisInfo, parent: Option<ScopeId>, block: &ast::Block) -> ScopeId {
    let scope = info.make_scope(parent);
    info.block_scopes.insert(block.id, scope);

    // Functions are hoisted: visible throughout the enclosing block.
    for stmt in &block.statements {
        if let ast::Statement::FunctionDefinition(def) = stmt {
            let func = info.functions.push(FunctionDecl {
                name: def.name.clone(),
                parameters: def.parameters.len(),
                returns: def.returns.len(),
                loc: def.loc,
            });
            info.scopes[scope]
                .entries
                .insert(def.name.clone(), ScopeEntry::Function(func));
        }
    }

    for stmt in &block.statements {
        visit_statement(info, scope, stmt);
    }

    scope
}

fn visit_statement(info: &mut AnalysisInfo, scope: ScopeId, stmt: &ast::Statement) {
    match stmt {
        ast::Statement::VariableDeclaration(decl) => {
            for var in &decl.variables {
                info.declare_var(scope, var);
            }
        }
        ast::Statement::If(stmt) => {
            visit_block(info, Some(scope), &stmt.body);
        }
        ast::Statement::Switch(stmt) => {
            for case in &stmt.cases {
                visit_block(info, Some(scope), &case.body);
            }
        }
        ast::Statement::ForLoop(stmt) => {
            // The pre block's scope encloses condition, body and post.
            let pre_scope = visit_block(info, Some(scope), &stmt.pre);
            visit_block(info, Some(pre_scope), &stmt.body);
            visit_block(info, Some(pre_scope), &stmt.post);
        }
        ast::Statement::Block(block) => {
            visit_block(info, Some(scope), block);
        }
        ast::Statement::FunctionDefinition(def) => {
            let Some(ScopeEntry::Function(func)) = info.lookup(scope, &def.name) else {
                unreachable!("function was hoisted above");
            };
            let virtual_scope = info.make_scope(Some(scope));
            info.virtual_scopes.insert(func, virtual_scope);
            for var in def.parameters.iter().chain(def.returns.iter()) {
                info.declare_var(virtual_scope, var);
            }
            visit_block(info, Some(virtual_scope), &def.body);
        }
        ast::Statement::Expression(_)
        | ast::Statement::Assignment(_)
        | ast::Statement::Break(_)
        | ast::Statement::Continue(_)
        | ast::Statement::Leave(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::AstFactory;

    #[test]
    fn lexical_scoping() {
        let mut f = AstFactory::default();
        let inner = f.block([f.let_single("x", f.lit(2))]);
        let inner_id = inner.id;
        let root = f.block([
            f.let_single("x", f.lit(1)),
            f.let_single("y", f.lit(1)),
            ast::Statement::Block(inner),
        ]);

        let info = analyze(&root);
        let outer_scope = info.scope_of_block(root.id);
        let inner_scope = info.scope_of_block(inner_id);

        let outer_x = info.lookup(outer_scope, "x").unwrap();
        let inner_x = info.lookup(inner_scope, "x").unwrap();
        assert_ne!(outer_x, inner_x, "inner `x` shadows outer `x`");

        // `y` is only declared in the outer scope and is found from both.
        assert_eq!(info.lookup(inner_scope, "y"), info.lookup(outer_scope, "y"));
        assert!(info.lookup(outer_scope, "z").is_none());
    }

    #[test]
    fn function_scopes() {
        let mut f = AstFactory::default();
        let body = f.block([f.assign_single("r", f.ident("p"))]);
        let body_id = body.id;
        let root = f.block([f.function("id", ["p"], ["r"], body)]);

        let info = analyze(&root);
        let root_scope = info.scope_of_block(root.id);
        let Some(ScopeEntry::Function(func)) = info.lookup(root_scope, "id") else {
            panic!("function not hoisted into the defining scope");
        };
        assert_eq!(info.function(func).parameters, 1);
        assert_eq!(info.function(func).returns, 1);

        let virtual_scope = info.virtual_scope(func);
        assert!(matches!(
            info.lookup(virtual_scope, "p"),
            Some(ScopeEntry::Variable(_))
        ));
        assert!(matches!(
            info.lookup(virtual_scope, "r"),
            Some(ScopeEntry::Variable(_))
        ));

        // The body resolves parameters through the virtual scope.
        let body_scope = info.scope_of_block(body_id);
        assert_eq!(info.lookup(body_scope, "p"), info.lookup(virtual_scope, "p"));
    }
}
