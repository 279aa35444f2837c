//! The optimizing stack-machine backend: data flow graph construction,
//! backwards stack layout generation, and forward code emission.

pub mod bitset;
pub mod emit;
pub mod error;
pub mod layout;
pub mod shuffle;

pub use emit::CodeGenerator;
pub use error::CodegenError;
pub use layout::{BlockLayout, DepthIssue, LayoutGenerator, StackLayout};

use schist_ir::analysis::AnalysisInfo;
use schist_ir::ast;
use schist_ir::dialect::Dialect;
use schist_ir::graph::DataFlowGraph;
use schist_ir::isa::Assembly;
use schist_ir::GraphBuilder;

/// Compiles `root` and appends the resulting instruction stream to
/// `assembly`.
///
/// The three passes run strictly in sequence: lowering to the data flow
/// graph, stack layout generation, code emission. Unrepairable stack-depth
/// violations abandon emission and are reported to the caller.
pub fn compile(
    assembly: &mut dyn Assembly,
    analysis: &AnalysisInfo,
    root: &ast::Block,
    dialect: &dyn Dialect,
    use_named_labels: bool,
) -> Result<(), CodegenError> {
    let graph = GraphBuilder::build(analysis, dialect, root)?;
    compile_graph(assembly, &graph, dialect, use_named_labels)
}

/// Lower-level entry point for callers that already hold a graph.
pub fn compile_graph(
    assembly: &mut dyn Assembly,
    graph: &DataFlowGraph,
    dialect: &dyn Dialect,
    use_named_labels: bool,
) -> Result<(), CodegenError> {
    let (layout, issues) = LayoutGenerator::run(graph);
    if !issues.is_empty() {
        let count = issues.iter().map(|issue| issue.slots.len()).sum();
        let details = issues
            .iter()
            .map(|issue| {
                format!(
                    "{:?}: {}",
                    issue.block,
                    schist_ir::display_stack(&issue.slots, graph)
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        return Err(CodegenError::StackTooDeep { count, details });
    }
    CodeGenerator::run(assembly, dialect, graph, &layout, use_named_labels);
    Ok(())
}
