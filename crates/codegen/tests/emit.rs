//! End-to-end emission scenarios: structured source, hand-built as an AST,
//! through analysis, lowering, layout and code generation, asserted against
//! the recorded instruction stream.

mod common;

use common::{Event, RecordingAssembly};

use schist_codegen::{compile, CodegenError};
use schist_ir::isa::{Instruction, JumpKind};
use schist_ir::test_util::AstFactory;
use schist_ir::{analyze, BaseDialect, U256};

fn compile_to_events(root: &schist_ir::ast::Block) -> RecordingAssembly {
    let info = analyze(root);
    let dialect = BaseDialect::new();
    let mut assembly = RecordingAssembly::new();
    compile(&mut assembly, &info, root, &dialect, false).expect("compilation failed");
    assembly
}

/// An empty program compiles to a lone halt.
#[test]
fn empty_program() {
    let mut f = AstFactory::default();
    let root = f.block([]);
    let assembly = compile_to_events(&root);
    assert_eq!(assembly.events, [Event::Instr(Instruction::Stop)]);
}

/// `sstore(0, 42)`: push the value, push the key, store, halt.
#[test]
fn constant_store() {
    let mut f = AstFactory::default();
    let root = f.block([f.expr_stmt(f.call("sstore", [f.lit(0), f.lit(42)]))]);
    let assembly = compile_to_events(&root);
    assert_eq!(
        assembly.events,
        [
            Event::Constant(U256::from(42)),
            Event::Constant(U256::from(0)),
            Event::Instr(Instruction::SStore),
            Event::Instr(Instruction::Stop),
        ]
    );
}

/// `let x := 7  let y := add(x, x)  sstore(0, y)`: the second use of `x` is
/// a single dup, and nothing needs swapping.
#[test]
fn local_variable_reuse() {
    let mut f = AstFactory::default();
    let root = f.block([
        f.let_single("x", f.lit(7)),
        f.let_single("y", f.call("add", [f.ident("x"), f.ident("x")])),
        f.expr_stmt(f.call("sstore", [f.lit(0), f.ident("y")])),
    ]);
    let assembly = compile_to_events(&root);

    let dups = assembly
        .instructions()
        .filter(|i| matches!(i, Instruction::Dup(_)))
        .count();
    let swaps = assembly
        .instructions()
        .filter(|i| matches!(i, Instruction::Swap(_)))
        .count();
    assert_eq!(dups, 1, "{:?}", assembly.events);
    assert_eq!(swaps, 0, "{:?}", assembly.events);
    assert_eq!(assembly.count(Instruction::Add), 1);
    assert_eq!(assembly.count(Instruction::SStore), 1);
    assert_eq!(assembly.count(Instruction::Stop), 1);
}

/// `if lt(a, b) { sstore(0, 1) }`: condition, conditional jump to the then
/// label, fall-through halt, then-body behind the label.
#[test]
fn branch() {
    let mut f = AstFactory::default();
    let body = f.block([f.expr_stmt(f.call("sstore", [f.lit(0), f.lit(1)]))]);
    let root = f.block([
        f.let_single("a", f.lit(1)),
        f.let_single("b", f.lit(2)),
        f.if_(f.call("lt", [f.ident("a"), f.ident("b")]), body),
    ]);
    let assembly = compile_to_events(&root);

    assert_eq!(assembly.count(Instruction::Lt), 1);
    assert_eq!(assembly.count(Instruction::Stop), 1);

    let then_label = assembly
        .events
        .iter()
        .find_map(|event| match event {
            Event::JumpToIf(label) => Some(*label),
            _ => None,
        })
        .expect("missing conditional jump");
    let label_position = assembly
        .events
        .iter()
        .position(|event| *event == Event::Label(then_label))
        .expect("then label never appended");
    let store_position = assembly
        .events
        .iter()
        .position(|event| *event == Event::Instr(Instruction::SStore))
        .expect("missing store");
    assert!(
        store_position > label_position,
        "the then-body must sit behind its label"
    );
}

/// `for { let i := 0 } lt(i, 10) { i := add(i, 1) } { sstore(i, i) }`: the
/// loop round-trips through one labeled header and never reaches deeper
/// than three slots.
#[test]
fn counting_loop() {
    let mut f = AstFactory::default();
    let pre = f.block([f.let_single("i", f.lit(0))]);
    let post = f.block([f.assign_single("i", f.call("add", [f.ident("i"), f.lit(1)]))]);
    let body = f.block([f.expr_stmt(f.call("sstore", [f.ident("i"), f.ident("i")]))]);
    let root = f.block([f.for_(pre, f.call("lt", [f.ident("i"), f.lit(10)]), post, body)]);
    let assembly = compile_to_events(&root);

    // Entry jump to the header plus the back-edge target the same label.
    let header_jumps: Vec<_> = assembly
        .events
        .iter()
        .filter_map(|event| match event {
            Event::JumpTo(label, _, JumpKind::Ordinary) => Some(*label),
            _ => None,
        })
        .collect();
    assert_eq!(header_jumps.len(), 2, "{:?}", assembly.events);
    assert_eq!(header_jumps[0], header_jumps[1]);

    for instruction in assembly.instructions() {
        match instruction {
            Instruction::Swap(depth) | Instruction::Dup(depth) => {
                assert!(depth <= 3, "loop body reaches depth {depth}");
            }
            _ => {}
        }
    }
    assert_eq!(assembly.count(Instruction::SStore), 1);
    assert_eq!(assembly.count(Instruction::Add), 1);
}

/// `function f() -> a, b { a := 1 b := 2 }  let x, y := f()`: the call
/// pushes its return label, jumps into the function, and the function
/// returns out through the label with a clean frame.
#[test]
fn function_with_two_returns() {
    let mut f = AstFactory::default();
    let body = f.block([f.assign_single("a", f.lit(1)), f.assign_single("b", f.lit(2))]);
    let root = f.block([
        f.function("f", [], ["a", "b"], body),
        f.let_(["x", "y"], Some(f.call("f", []))),
    ]);
    let assembly = compile_to_events(&root);

    let call_position = assembly
        .events
        .iter()
        .position(|event| matches!(event, Event::JumpTo(_, _, JumpKind::IntoFunction)))
        .expect("missing call jump");
    let Event::JumpTo(_, height_delta, _) = assembly.events[call_position] else {
        unreachable!();
    };
    // Two returns, no arguments, minus the consumed return label.
    assert_eq!(height_delta, 1);

    // The return label is pushed right before the call and lands right
    // after it.
    let Event::LabelRef(return_label) = assembly.events[call_position - 1] else {
        panic!("no return label pushed before the call");
    };
    assert_eq!(
        assembly.events[call_position + 1],
        Event::Label(return_label)
    );

    // The function body returns out-of-function with the frame consumed.
    assert!(assembly
        .events
        .iter()
        .any(|event| matches!(event, Event::Jump(0, JumpKind::OutOfFunction))));

    // x and y are dead afterwards; their slots are popped before the halt.
    assert_eq!(assembly.count(Instruction::Pop), 2);
    assert_eq!(assembly.count(Instruction::Stop), 1);
}

/// A terminating builtin ends the block without a halt of its own.
#[test]
fn terminating_builtin() {
    let mut f = AstFactory::default();
    let root = f.block([f.expr_stmt(f.call("revert", [f.lit(0), f.lit(0)]))]);
    let assembly = compile_to_events(&root);
    assert_eq!(
        assembly.events,
        [
            Event::Constant(U256::from(0)),
            Event::Instr(Instruction::Dup(1)),
            Event::Instr(Instruction::Revert),
        ]
    );
}

/// Function labels become named labels on request.
#[test]
fn named_function_labels() {
    let mut f = AstFactory::default();
    let body = f.block([f.assign_single("r", f.lit(1))]);
    let root = f.block([
        f.function("answer", [], ["r"], body),
        f.let_single("x", f.call("answer", [])),
        f.expr_stmt(f.call("sstore", [f.lit(0), f.ident("x")])),
    ]);

    let info = analyze(&root);
    let dialect = BaseDialect::new();
    let mut assembly = RecordingAssembly::new();
    compile(&mut assembly, &info, &root, &dialect, true).expect("compilation failed");

    assert!(assembly.named.iter().any(|(_, name)| name == "answer"));
}

/// Unresolved names are reported, not asserted on.
#[test]
fn unresolved_identifier_is_an_error() {
    let mut f = AstFactory::default();
    let root = f.block([f.let_single("x", f.ident("nowhere"))]);

    let info = analyze(&root);
    let dialect = BaseDialect::new();
    let mut assembly = RecordingAssembly::new();
    let result = compile(&mut assembly, &info, &root, &dialect, false);
    assert!(matches!(result, Err(CodegenError::Build(_))));
}
