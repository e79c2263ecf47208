use botblocks_common::{NodeId, MOTOR_COUNT, SENSOR_COUNT};
use botblocks_graph::block::*;
use botblocks_sema::{SlotAllocator, MAX_SLOTS};

use crate::bytecode::*;
use crate::CompileError;

/// Forward-reference target, bound to an address once the code it names is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Label(usize);

/// Jump targets of the innermost loop being compiled.
#[derive(Debug, Clone, Copy)]
struct LoopContext {
    continue_label: Label,
    break_label: Label,
}

/// Lowers the statement chain of a block graph into linear bytecode.
pub struct Compiler<'g> {
    pub(crate) graph: &'g Graph,
    pub(crate) slots: SlotAllocator,
    code: Vec<Instruction>,

    /// Label -> bound address.
    labels: Vec<Option<usize>>,
    /// (instruction index, label) pairs resolved in `finish`.
    patches: Vec<(usize, Label)>,

    loops: Vec<LoopContext>,
}

impl<'g> Compiler<'g> {
    pub fn new(graph: &'g Graph, slots: SlotAllocator) -> Self {
        Self {
            graph,
            slots,
            code: Vec::new(),
            labels: Vec::new(),
            patches: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Resolve every jump and freeze the program. Fails only when the code
    /// or a slot space outgrows the 16-bit operands.
    pub fn finish(mut self, name: &str) -> Result<Program, CompileError> {
        let end = self.code.len();
        if end > MAX_PROGRAM_LEN {
            return Err(CompileError::ProgramTooLarge {
                len: end,
                limit: MAX_PROGRAM_LEN,
            });
        }
        let slots = self.slots.counts();
        if slots.largest() > MAX_SLOTS {
            return Err(CompileError::TooManySlots {
                count: slots.largest(),
                limit: MAX_SLOTS,
            });
        }

        for (at, label) in std::mem::take(&mut self.patches) {
            let target = self.labels[label.0].unwrap_or(end);
            self.code[at].b = target as i16;
        }
        Ok(Program::new(
            name,
            self.code,
            slots,
            self.slots.variable_names().to_vec(),
        ))
    }

    // ── Emission helpers ────────────────────────────────

    pub(crate) fn emit(&mut self, ins: Instruction) -> usize {
        self.code.push(ins);
        self.code.len() - 1
    }

    pub(crate) fn op(&mut self, op: Opcode) {
        self.emit(Instruction::new(op));
    }

    pub(crate) fn push(&mut self, value: f32) {
        self.emit(Instruction::push(value));
    }

    pub(crate) fn load(&mut self, slot: u16) {
        self.emit(Instruction::with_a(Opcode::Load, slot as i16));
    }

    pub(crate) fn store(&mut self, slot: u16) {
        self.emit(Instruction::with_a(Opcode::Store, slot as i16));
    }

    pub(crate) fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub(crate) fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    /// Emit JMP/JZ with an unresolved target.
    pub(crate) fn jump(&mut self, op: Opcode, label: Label) {
        let at = self.emit(Instruction::new(op));
        self.patches.push((at, label));
    }

    // ── Statement compilation ───────────────────────────

    pub fn compile_chain(&mut self, first: Option<NodeId>) {
        let graph = self.graph;
        for id in graph.chain(first) {
            self.compile_statement(id);
        }
    }

    fn compile_statement(&mut self, id: NodeId) {
        let graph = self.graph;
        match graph.kind(id) {
            BlockKind::SetVariable => {
                let slot = self.slots.slot_for(&graph.variable_name(id));
                self.compile_input(id, "VALUE");
                self.store(slot);
            }
            BlockKind::ChangeVariable => {
                let slot = self.slots.slot_for(&graph.variable_name(id));
                self.load(slot);
                self.compile_input(id, "DELTA");
                self.op(Opcode::Add);
                self.store(slot);
            }
            BlockKind::If => self.compile_if(id),
            BlockKind::Repeat => self.compile_repeat(id),
            BlockKind::WhileUntil => {
                let until = graph.field_choice(id, "MODE") == "UNTIL";
                self.compile_while(id, until);
            }
            BlockKind::For => self.compile_for(id),
            BlockKind::FlowControl => {
                // Outside any loop a break/continue has nothing to jump to.
                let Some(ctx) = self.loops.last().copied() else {
                    return;
                };
                match graph.field_choice(id, "FLOW").as_str() {
                    "BREAK" => self.jump(Opcode::Jmp, ctx.break_label),
                    "CONTINUE" | "CONTINUE_WITH_NEXT_ITERATION" => {
                        self.jump(Opcode::Jmp, ctx.continue_label)
                    }
                    _ => {}
                }
            }
            BlockKind::Drive => {
                let dir = match graph.field_choice(id, "DIRECTION").as_str() {
                    "BACKWARD" => DriveDirection::Backward,
                    _ => DriveDirection::Forward,
                };
                self.compile_input(id, "SPEED");
                self.emit(Instruction::with_a(Opcode::Drive, dir as i16));
            }
            BlockKind::Motor => {
                let motor = self.small_field(id, "MOTOR", MOTOR_COUNT);
                self.compile_input(id, "SPEED");
                self.emit(Instruction::with_a(Opcode::Motor, motor));
            }
            BlockKind::Stop => self.op(Opcode::Stop),
            BlockKind::SetSpeed => {
                self.compile_input(id, "PERCENT");
                self.op(Opcode::Speed);
            }
            BlockKind::TurnTimed => {
                let dir = match graph.field_choice(id, "DIRECTION").as_str() {
                    "RIGHT" => TurnDirection::Right,
                    _ => TurnDirection::Left,
                };
                self.compile_input(id, "SPEED");
                self.compile_input(id, "DURATION");
                self.emit(Instruction::with_a(Opcode::Turn, dir as i16));
            }
            BlockKind::RampSpeed => {
                self.compile_input(id, "TARGET");
                self.compile_input(id, "DURATION");
                self.op(Opcode::Ramp);
            }
            BlockKind::GoHome => self.op(Opcode::Home),
            BlockKind::RecordStart => {
                self.emit(Instruction::with_a(Opcode::Record, RecordMode::Start as i16));
            }
            BlockKind::RecordStop => {
                self.emit(Instruction::with_a(Opcode::Record, RecordMode::Stop as i16));
            }
            BlockKind::Replay => self.op(Opcode::Replay),
            BlockKind::Wait => {
                self.compile_input(id, "MS");
                self.op(Opcode::Wait);
            }
            BlockKind::WaitSensor => {
                let channel = self.small_field(id, "CHANNEL", SENSOR_COUNT);
                let cmp = match compare_op(&graph.field_choice(id, "OP")) {
                    Some(BinOp::Eq) => SensorCompare::Eq,
                    Some(BinOp::Ne) => SensorCompare::Ne,
                    Some(BinOp::Lt) => SensorCompare::Lt,
                    Some(BinOp::Le) => SensorCompare::Le,
                    Some(BinOp::Ge) => SensorCompare::Ge,
                    _ => SensorCompare::Gt,
                };
                self.compile_input(id, "THRESHOLD");
                self.emit(Instruction::with_ab(
                    Opcode::WaitSensor,
                    channel,
                    cmp as i16,
                ));
            }
            BlockKind::CountLaps => {
                let channel = self.small_field(id, "CHANNEL", SENSOR_COUNT);
                self.compile_input(id, "LAPS");
                self.compile_input(id, "THRESHOLD");
                self.emit(Instruction::with_a(Opcode::Laps, channel));
            }
            BlockKind::Autopilot => {
                self.compile_input(id, "SPEED");
                self.compile_input(id, "DURATION");
                self.op(Opcode::Autopilot);
            }

            // Hat and value blocks are not statements; anything unrecognised
            // compiles to nothing so every graph stays runnable.
            BlockKind::Start
            | BlockKind::Number
            | BlockKind::Boolean
            | BlockKind::GetVariable
            | BlockKind::Arithmetic
            | BlockKind::Modulo
            | BlockKind::Single
            | BlockKind::Compare
            | BlockKind::LogicOperation
            | BlockKind::Negate
            | BlockKind::Sensor
            | BlockKind::Timer
            | BlockKind::Pid
            | BlockKind::Smooth
            | BlockKind::Schmitt
            | BlockKind::Edge
            | BlockKind::Unknown(_) => {}
        }
    }

    /// if / else-if* / else: each branch tests its condition once, top to bottom.
    fn compile_if(&mut self, id: NodeId) {
        let graph = self.graph;
        let end = self.new_label();
        for i in 0..graph.if_branch_count(id) {
            let next_branch = self.new_label();
            self.compile_input(id, &format!("IF{i}"));
            self.jump(Opcode::Jz, next_branch);
            self.compile_chain(graph.input(id, &format!("DO{i}")));
            self.jump(Opcode::Jmp, end);
            self.bind(next_branch);
        }
        self.compile_chain(graph.input(id, "ELSE"));
        self.bind(end);
    }

    /// repeat N: `counter < count` is tested before every iteration, so N <= 0 runs nothing.
    fn compile_repeat(&mut self, id: NodeId) {
        let count = self.slots.anonymous("repeat.count");
        let counter = self.slots.anonymous("repeat.i");
        self.compile_input(id, "TIMES");
        self.store(count);
        self.push(0.0);
        self.store(counter);

        let top = self.new_label();
        let next = self.new_label();
        let exit = self.new_label();

        self.bind(top);
        self.load(counter);
        self.load(count);
        self.op(Opcode::Lt);
        self.jump(Opcode::Jz, exit);

        self.compile_loop_body(id, "DO", next, exit);

        self.bind(next);
        self.load(counter);
        self.push(1.0);
        self.op(Opcode::Add);
        self.store(counter);
        self.jump(Opcode::Jmp, top);
        self.bind(exit);
    }

    fn compile_while(&mut self, id: NodeId, until: bool) {
        let top = self.new_label();
        let exit = self.new_label();

        self.bind(top);
        self.compile_input(id, "BOOL");
        if until {
            self.op(Opcode::Not);
        }
        self.jump(Opcode::Jz, exit);

        self.compile_loop_body(id, "DO", top, exit);

        self.jump(Opcode::Jmp, top);
        self.bind(exit);
    }

    /// for var from A to B by C: `to` and `by` are evaluated once; the test
    /// `(by >= 0 && var <= to) || (by < 0 && var >= to)` handles both directions.
    fn compile_for(&mut self, id: NodeId) {
        let var = self.slots.slot_for(&self.graph.variable_name(id));
        let to = self.slots.anonymous("for.to");
        let by = self.slots.anonymous("for.by");

        self.compile_input(id, "FROM");
        self.store(var);
        self.compile_input(id, "TO");
        self.store(to);
        if self.graph.input(id, "BY").is_some() {
            self.compile_input(id, "BY");
        } else {
            // A missing step would never terminate; count up by one instead.
            self.push(1.0);
        }
        self.store(by);

        let top = self.new_label();
        let next = self.new_label();
        let exit = self.new_label();

        self.bind(top);
        self.load(by);
        self.push(0.0);
        self.op(Opcode::Ge);
        self.load(var);
        self.load(to);
        self.op(Opcode::Le);
        self.op(Opcode::And);
        self.load(by);
        self.push(0.0);
        self.op(Opcode::Lt);
        self.load(var);
        self.load(to);
        self.op(Opcode::Ge);
        self.op(Opcode::And);
        self.op(Opcode::Or);
        self.jump(Opcode::Jz, exit);

        self.compile_loop_body(id, "DO", next, exit);

        self.bind(next);
        self.load(var);
        self.load(by);
        self.op(Opcode::Add);
        self.store(var);
        self.jump(Opcode::Jmp, top);
        self.bind(exit);
    }

    fn compile_loop_body(&mut self, id: NodeId, input: &str, next: Label, exit: Label) {
        self.loops.push(LoopContext {
            continue_label: next,
            break_label: exit,
        });
        self.compile_chain(self.graph.input(id, input));
        self.loops.pop();
    }

    /// Small integer field (motor index, sensor channel) clamped to `0..count`.
    pub(crate) fn small_field(&self, id: NodeId, name: &str, count: usize) -> i16 {
        let raw = self.graph.field_number(id, name, 0.0);
        if raw.is_nan() {
            return 0;
        }
        (raw as i64).clamp(0, count as i64 - 1) as i16
    }
}
