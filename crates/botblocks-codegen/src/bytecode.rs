use botblocks_sema::SlotCounts;
use serde::{Deserialize, Serialize};

// =============================================================================
// OPCODE - the VM's instruction set
// =============================================================================

/// Stack-machine opcodes. The discriminant is the on-device encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // literals & variables
    PushF,
    Load,
    Store,

    // arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Abs,

    // comparison (push 1.0 / 0.0)
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // logic (operands are never short-circuited)
    And,
    Or,
    Not,

    // control flow: target in `b`
    Jmp,
    Jz,

    // inputs
    Sensor,
    Timer,

    // stateful controllers: slot in `a`
    Pid,
    Smooth,
    Schmitt,
    Edge,

    // immediate motor commands
    Drive,
    Motor,
    Stop,
    Speed,

    // auxiliary actions (span many ticks)
    Turn,
    Ramp,
    Home,
    Record,
    Replay,
    Laps,
    Autopilot,

    // suspension points
    Wait,
    WaitSensor,
}

impl Opcode {
    pub const ALL: [Opcode; 40] = [
        Opcode::PushF,
        Opcode::Load,
        Opcode::Store,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Mod,
        Opcode::Neg,
        Opcode::Abs,
        Opcode::Eq,
        Opcode::Ne,
        Opcode::Lt,
        Opcode::Le,
        Opcode::Gt,
        Opcode::Ge,
        Opcode::And,
        Opcode::Or,
        Opcode::Not,
        Opcode::Jmp,
        Opcode::Jz,
        Opcode::Sensor,
        Opcode::Timer,
        Opcode::Pid,
        Opcode::Smooth,
        Opcode::Schmitt,
        Opcode::Edge,
        Opcode::Drive,
        Opcode::Motor,
        Opcode::Stop,
        Opcode::Speed,
        Opcode::Turn,
        Opcode::Ramp,
        Opcode::Home,
        Opcode::Record,
        Opcode::Replay,
        Opcode::Laps,
        Opcode::Autopilot,
        Opcode::Wait,
        Opcode::WaitSensor,
    ];

    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            PushF => "PUSHF",
            Load => "LOAD",
            Store => "STORE",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            Neg => "NEG",
            Abs => "ABS",
            Eq => "EQ",
            Ne => "NE",
            Lt => "LT",
            Le => "LE",
            Gt => "GT",
            Ge => "GE",
            And => "AND",
            Or => "OR",
            Not => "NOT",
            Jmp => "JMP",
            Jz => "JZ",
            Sensor => "SENSOR",
            Timer => "TIMER",
            Pid => "PID",
            Smooth => "SMOOTH",
            Schmitt => "SCHMITT",
            Edge => "EDGE",
            Drive => "DRIVE",
            Motor => "MOTOR",
            Stop => "STOP",
            Speed => "SPEED",
            Turn => "TURN",
            Ramp => "RAMP",
            Home => "HOME",
            Record => "RECORD",
            Replay => "REPLAY",
            Laps => "LAPS",
            Autopilot => "AUTOPILOT",
            Wait => "WAIT",
            WaitSensor => "WAIT_SENSOR",
        }
    }

    /// Returns (pops, pushes) for an opcode.
    pub fn stack_effect(self) -> (usize, usize) {
        use Opcode::*;
        match self {
            PushF | Load | Sensor | Timer => (0, 1),
            Store => (1, 0),

            Add | Sub | Mul | Div | Mod => (2, 1),
            Eq | Ne | Lt | Le | Gt | Ge => (2, 1),
            And | Or => (2, 1),
            Neg | Abs | Not => (1, 1),

            Jmp => (0, 0),
            Jz => (1, 0),

            Pid => (4, 1),
            Schmitt => (3, 1),
            Smooth | Edge => (1, 1),

            Drive | Motor | Speed => (1, 0),
            Stop => (0, 0),
            Turn | Ramp | Laps | Autopilot => (2, 0),
            Home | Record | Replay => (0, 0),

            // WAIT_SENSOR keeps its threshold while it waits; net effect is the same.
            Wait | WaitSensor => (1, 0),
        }
    }
}

// ── Small operands ──────────────────────────────────────

/// `a` of DRIVE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveDirection {
    Forward = 0,
    Backward = 1,
}

/// `a` of TURN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDirection {
    Left = 0,
    Right = 1,
}

/// `a` of RECORD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    Start = 0,
    Stop = 1,
}

/// `b` of EDGE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeMode {
    Rising = 0,
    Falling = 1,
    Both = 2,
}

/// `b` of WAIT_SENSOR: how the reading is compared with the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorCompare {
    Eq = 0,
    Ne = 1,
    Lt = 2,
    Le = 3,
    Gt = 4,
    Ge = 5,
}

impl DriveDirection {
    pub fn from_operand(v: i16) -> Self {
        if v == 1 {
            Self::Backward
        } else {
            Self::Forward
        }
    }
}

impl TurnDirection {
    pub fn from_operand(v: i16) -> Self {
        if v == 1 {
            Self::Right
        } else {
            Self::Left
        }
    }
}

impl RecordMode {
    pub fn from_operand(v: i16) -> Self {
        if v == 1 {
            Self::Stop
        } else {
            Self::Start
        }
    }
}

impl EdgeMode {
    pub fn from_operand(v: i16) -> Self {
        match v {
            1 => Self::Falling,
            2 => Self::Both,
            _ => Self::Rising,
        }
    }
}

impl SensorCompare {
    pub fn from_operand(v: i16) -> Self {
        match v {
            0 => Self::Eq,
            1 => Self::Ne,
            2 => Self::Lt,
            3 => Self::Le,
            5 => Self::Ge,
            _ => Self::Gt,
        }
    }

    pub fn holds(self, reading: f32, threshold: f32) -> bool {
        match self {
            Self::Eq => reading == threshold,
            Self::Ne => reading != threshold,
            Self::Lt => reading < threshold,
            Self::Le => reading <= threshold,
            Self::Gt => reading > threshold,
            Self::Ge => reading >= threshold,
        }
    }
}

// =============================================================================
// INSTRUCTION / PROGRAM
// =============================================================================

/// Longest program whose jump targets, including the halt address at the
/// end, fit the signed 16-bit `b` operand.
pub const MAX_PROGRAM_LEN: usize = i16::MAX as usize;

/// One fixed-width instruction: `{opcode, a, b, f}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Opcode,
    pub a: i16,
    pub b: i16,
    pub f: f32,
}

impl Instruction {
    pub fn new(op: Opcode) -> Self {
        Self {
            op,
            a: 0,
            b: 0,
            f: 0.0,
        }
    }

    pub fn with_a(op: Opcode, a: i16) -> Self {
        Self { a, ..Self::new(op) }
    }

    pub fn with_ab(op: Opcode, a: i16, b: i16) -> Self {
        Self {
            a,
            b,
            ..Self::new(op)
        }
    }

    pub fn push(f: f32) -> Self {
        Self {
            f,
            ..Self::new(Opcode::PushF)
        }
    }

    pub fn is_jump(&self) -> bool {
        matches!(self.op, Opcode::Jmp | Opcode::Jz)
    }
}

/// A finished, immutable bytecode program plus the slot counts that size
/// the runtime's static arrays.
#[derive(Debug, Clone, Serialize)]
pub struct Program {
    name: String,
    instructions: Vec<Instruction>,
    slots: SlotCounts,
    /// Slot index -> variable name, for listings.
    variables: Vec<String>,
}

impl Program {
    /// Build a program from raw parts. Jump targets beyond the end are clamped
    /// to the end, which is the halt address.
    pub fn new(
        name: impl Into<String>,
        mut instructions: Vec<Instruction>,
        slots: SlotCounts,
        variables: Vec<String>,
    ) -> Self {
        let end = i16::try_from(instructions.len()).unwrap_or(i16::MAX);
        for ins in instructions.iter_mut().filter(|i| i.is_jump()) {
            ins.b = ins.b.clamp(0, end);
        }
        Self {
            name: name.into(),
            instructions,
            slots,
            variables,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn get(&self, pc: usize) -> Option<&Instruction> {
        self.instructions.get(pc)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn slots(&self) -> SlotCounts {
        self.slots
    }

    pub fn variable_names(&self) -> &[String] {
        &self.variables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_opcodes_listed_in_encoding_order() {
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(*op as usize, i, "{} out of order", op.mnemonic());
        }
    }

    #[test]
    fn test_jump_targets_clamped_to_end() {
        let program = Program::new(
            "p",
            vec![
                Instruction::with_ab(Opcode::Jmp, 0, 99),
                Instruction::with_ab(Opcode::Jz, 0, -4),
            ],
            SlotCounts::default(),
            Vec::new(),
        );
        assert_eq!(program.instructions()[0].b, 2);
        assert_eq!(program.instructions()[1].b, 0);
    }

    #[test]
    fn test_oversized_program_keeps_targets_non_negative() {
        let mut code = vec![Instruction::new(Opcode::Stop); MAX_PROGRAM_LEN + 100];
        code[0] = Instruction::with_ab(Opcode::Jmp, 0, 5);
        let program = Program::new("p", code, SlotCounts::default(), Vec::new());
        assert_eq!(program.instructions()[0].b, 5);
    }

    #[test]
    fn test_operand_decoding_defaults() {
        assert_eq!(DriveDirection::from_operand(7), DriveDirection::Forward);
        assert_eq!(TurnDirection::from_operand(1), TurnDirection::Right);
        assert_eq!(EdgeMode::from_operand(-1), EdgeMode::Rising);
        assert_eq!(SensorCompare::from_operand(42), SensorCompare::Gt);
        assert!(SensorCompare::Le.holds(3.0, 3.0));
        assert!(!SensorCompare::Lt.holds(3.0, 3.0));
    }
}
