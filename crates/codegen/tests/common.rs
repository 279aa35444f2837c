//! A recording [`Assembly`] sink for end-to-end emission tests.

use schist_ir::ast::SourceLoc;
use schist_ir::isa::{Assembly, Instruction, JumpKind, LabelId};
use schist_ir::U256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Instr(Instruction),
    Constant(U256),
    Label(LabelId),
    LabelRef(LabelId),
    JumpTo(LabelId, i32, JumpKind),
    JumpToIf(LabelId),
    Jump(i32, JumpKind),
}

#[derive(Default)]
pub struct RecordingAssembly {
    pub events: Vec<Event>,
    /// Names passed to `named_label`.
    pub named: Vec<(LabelId, String)>,
    next_label: u32,
    height: usize,
}

impl RecordingAssembly {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instructions(&self) -> impl Iterator<Item = Instruction> + '_ {
        self.events.iter().filter_map(|event| match event {
            Event::Instr(instruction) => Some(*instruction),
            _ => None,
        })
    }

    pub fn count(&self, looked_for: Instruction) -> usize {
        self.instructions().filter(|i| *i == looked_for).count()
    }
}

impl Assembly for RecordingAssembly {
    fn append_instruction(&mut self, instruction: Instruction) {
        self.height = self.height + instruction.pushes() - instruction.pops();
        self.events.push(Event::Instr(instruction));
    }

    fn append_constant(&mut self, value: U256) {
        self.height += 1;
        self.events.push(Event::Constant(value));
    }

    fn append_label(&mut self, label: LabelId) {
        self.events.push(Event::Label(label));
    }

    fn append_label_reference(&mut self, label: LabelId) {
        self.height += 1;
        self.events.push(Event::LabelRef(label));
    }

    fn append_jump_to(&mut self, label: LabelId, stack_height_delta: i32, kind: JumpKind) {
        self.height = (self.height as i64 + stack_height_delta as i64) as usize;
        self.events.push(Event::JumpTo(label, stack_height_delta, kind));
    }

    fn append_jump_to_if(&mut self, label: LabelId) {
        self.height -= 1;
        self.events.push(Event::JumpToIf(label));
    }

    fn append_jump(&mut self, stack_height_delta: i32, kind: JumpKind) {
        self.height = (self.height as i64 + stack_height_delta as i64) as usize;
        self.events.push(Event::Jump(stack_height_delta, kind));
    }

    fn new_label(&mut self) -> LabelId {
        let label = LabelId(self.next_label);
        self.next_label += 1;
        label
    }

    fn named_label(&mut self, name: &str, _parameters: usize, _returns: usize) -> LabelId {
        let label = self.new_label();
        self.named.push((label, name.to_string()));
        label
    }

    fn set_stack_height(&mut self, height: usize) {
        self.height = height;
    }

    fn stack_height(&self) -> usize {
        self.height
    }

    fn set_source_location(&mut self, _loc: SourceLoc) {}
}
