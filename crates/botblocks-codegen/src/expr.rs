use botblocks_common::{NodeId, SENSOR_COUNT};
use botblocks_graph::block::*;
use botblocks_sema::StatefulFamily;

use crate::bytecode::*;
use crate::compile::Compiler;

impl Compiler<'_> {
    /// Compile the value plugged into `input`, or the literal zero when the
    /// socket is empty or holds something that is not a value block.
    pub(crate) fn compile_input(&mut self, id: NodeId, input: &str) {
        match self.graph.input(id, input) {
            Some(child) => self.compile_expr(child),
            None => self.push(0.0),
        }
    }

    /// Post-order emission: operands first, then the operator.
    pub fn compile_expr(&mut self, id: NodeId) {
        let graph = self.graph;
        match graph.kind(id) {
            BlockKind::Number => {
                let value = graph.field_number(id, "NUM", 0.0) as f32;
                self.push(if value.is_finite() { value } else { 0.0 });
            }
            BlockKind::Boolean => {
                let truth = graph.field_choice(id, "BOOL") == "TRUE";
                self.push(if truth { 1.0 } else { 0.0 });
            }
            BlockKind::GetVariable => {
                let slot = self.slots.slot_for(&graph.variable_name(id));
                self.load(slot);
            }
            BlockKind::Arithmetic
            | BlockKind::Modulo
            | BlockKind::Compare
            | BlockKind::LogicOperation => {
                let (left, right) = match graph.kind(id) {
                    BlockKind::Modulo => ("DIVIDEND", "DIVISOR"),
                    _ => ("A", "B"),
                };
                match graph.binary_op(id) {
                    Some(BinOp::Pow) => self.compile_power(id, left, right),
                    Some(op) => {
                        self.compile_input(id, left);
                        self.compile_input(id, right);
                        self.op(binary_opcode(op));
                    }
                    None => self.push(0.0),
                }
            }
            BlockKind::Single | BlockKind::Negate => {
                let operand = match graph.kind(id) {
                    BlockKind::Negate => "BOOL",
                    _ => "NUM",
                };
                match graph.unary_op(id) {
                    Some(op) => {
                        self.compile_input(id, operand);
                        self.op(match op {
                            UnaryOp::Neg => Opcode::Neg,
                            UnaryOp::Abs => Opcode::Abs,
                            UnaryOp::Not => Opcode::Not,
                        });
                    }
                    None => self.push(0.0),
                }
            }
            BlockKind::Sensor => {
                let channel = self.small_field(id, "CHANNEL", SENSOR_COUNT);
                self.emit(Instruction::with_a(Opcode::Sensor, channel));
            }
            BlockKind::Timer => self.op(Opcode::Timer),
            BlockKind::Pid => {
                let slot = self.slots.slot_for_stateful(StatefulFamily::Pid, id);
                self.compile_input(id, "ERROR");
                self.compile_input(id, "KP");
                self.compile_input(id, "KI");
                self.compile_input(id, "KD");
                self.emit(Instruction::with_a(Opcode::Pid, slot as i16));
            }
            BlockKind::Smooth => {
                let slot = self.slots.slot_for_stateful(StatefulFamily::Smooth, id);
                let window = graph.field_number(id, "WINDOW", 4.0);
                let window = if window.is_nan() {
                    1
                } else {
                    window.clamp(1.0, i16::MAX as f64) as i16
                };
                self.compile_input(id, "VALUE");
                self.emit(Instruction::with_ab(Opcode::Smooth, slot as i16, window));
            }
            BlockKind::Schmitt => {
                let slot = self.slots.slot_for_stateful(StatefulFamily::Schmitt, id);
                self.compile_input(id, "VALUE");
                self.compile_input(id, "LOW");
                self.compile_input(id, "HIGH");
                self.emit(Instruction::with_a(Opcode::Schmitt, slot as i16));
            }
            BlockKind::Edge => {
                let slot = self.slots.slot_for_stateful(StatefulFamily::Edge, id);
                let mode = match graph.field_choice(id, "MODE").as_str() {
                    "FALLING" => EdgeMode::Falling,
                    "BOTH" => EdgeMode::Both,
                    _ => EdgeMode::Rising,
                };
                self.compile_input(id, "VALUE");
                self.emit(Instruction::with_ab(Opcode::Edge, slot as i16, mode as i16));
            }

            // Statement blocks in a value socket and unknown blocks read as zero.
            BlockKind::Start
            | BlockKind::SetVariable
            | BlockKind::ChangeVariable
            | BlockKind::If
            | BlockKind::Repeat
            | BlockKind::WhileUntil
            | BlockKind::For
            | BlockKind::FlowControl
            | BlockKind::Drive
            | BlockKind::Motor
            | BlockKind::Stop
            | BlockKind::SetSpeed
            | BlockKind::TurnTimed
            | BlockKind::RampSpeed
            | BlockKind::GoHome
            | BlockKind::RecordStart
            | BlockKind::RecordStop
            | BlockKind::Replay
            | BlockKind::Wait
            | BlockKind::WaitSensor
            | BlockKind::CountLaps
            | BlockKind::Autopilot
            | BlockKind::Unknown(_) => self.push(0.0),
        }
    }

    /// `base ^ exp` as a multiply loop that runs while `exp >= 1`, counting
    /// the exponent down. Meaningful for small non-negative integer exponents.
    /// Negative exponents and those below one take the zero-iteration path
    /// and yield 1; other fractions drop their fractional part.
    fn compile_power(&mut self, id: NodeId, base_input: &str, exp_input: &str) {
        let base = self.slots.anonymous("pow.base");
        let exp = self.slots.anonymous("pow.exp");
        let acc = self.slots.anonymous("pow.acc");

        self.compile_input(id, base_input);
        self.store(base);
        self.compile_input(id, exp_input);
        self.store(exp);
        self.push(1.0);
        self.store(acc);

        let top = self.new_label();
        let done = self.new_label();
        self.bind(top);
        self.load(exp);
        self.push(1.0);
        self.op(Opcode::Ge);
        self.jump(Opcode::Jz, done);
        self.load(acc);
        self.load(base);
        self.op(Opcode::Mul);
        self.store(acc);
        self.load(exp);
        self.push(1.0);
        self.op(Opcode::Sub);
        self.store(exp);
        self.jump(Opcode::Jmp, top);
        self.bind(done);
        self.load(acc);
    }
}

fn binary_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Add,
        BinOp::Sub => Opcode::Sub,
        BinOp::Mul => Opcode::Mul,
        BinOp::Div => Opcode::Div,
        BinOp::Mod => Opcode::Mod,
        BinOp::Eq => Opcode::Eq,
        BinOp::Ne => Opcode::Ne,
        BinOp::Lt => Opcode::Lt,
        BinOp::Le => Opcode::Le,
        BinOp::Gt => Opcode::Gt,
        BinOp::Ge => Opcode::Ge,
        BinOp::And => Opcode::And,
        BinOp::Or => Opcode::Or,
        // Lowered as a loop by `compile_power`.
        BinOp::Pow => Opcode::Mul,
    }
}
