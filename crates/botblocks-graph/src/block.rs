use std::collections::BTreeMap;

use botblocks_common::{NodeId, Span};
use serde::{Deserialize, Serialize};

/// A loaded block program: every block lives in one arena, linked by `NodeId`.
#[derive(Debug, Clone)]
pub struct Graph {
    /// User-chosen program name (not yet sanitized).
    pub name: String,
    /// Arena of blocks, in pre-order of the source document.
    pub nodes: Vec<Node>,
    /// Top-level blocks in document order.
    pub roots: Vec<NodeId>,
    /// Source span of each top-level stack, parallel to `roots`.
    pub root_spans: Vec<Span>,
}

/// One block: its kind plus named literal fields and named child slots.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: BlockKind,
    pub fields: BTreeMap<String, FieldValue>,
    /// Value inputs and statement inputs share one namespace.
    pub inputs: BTreeMap<String, NodeId>,
    /// Following statement in the chain.
    pub next: Option<NodeId>,
}

/// A literal field as it appears in the editor's document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().parse().ok(),
            FieldValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        }
    }

    /// Text form; enumerated choices are compared upper-case.
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        }
    }
}

// ── Block kinds ─────────────────────────────────────────

/// Every block type the compiler understands. Anything else is `Unknown`
/// and lowers to nothing (statements) or the literal zero (values).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// "when program starts" hat block.
    Start,

    // statements
    SetVariable,
    ChangeVariable,
    If,
    Repeat,
    WhileUntil,
    For,
    FlowControl,
    Drive,
    Motor,
    Stop,
    SetSpeed,
    TurnTimed,
    RampSpeed,
    GoHome,
    RecordStart,
    RecordStop,
    Replay,
    Wait,
    WaitSensor,
    CountLaps,
    Autopilot,

    // values
    Number,
    Boolean,
    GetVariable,
    Arithmetic,
    Modulo,
    Single,
    Compare,
    LogicOperation,
    Negate,
    Sensor,
    Timer,
    Pid,
    Smooth,
    Schmitt,
    Edge,

    Unknown(String),
}

pub(crate) const TYPE_NAMES: &[(&str, BlockKind)] = &[
    ("robot_start", BlockKind::Start),
    ("variables_set", BlockKind::SetVariable),
    ("math_change", BlockKind::ChangeVariable),
    ("controls_if", BlockKind::If),
    ("controls_repeat_ext", BlockKind::Repeat),
    ("controls_whileUntil", BlockKind::WhileUntil),
    ("controls_for", BlockKind::For),
    ("controls_flow_statements", BlockKind::FlowControl),
    ("robot_drive", BlockKind::Drive),
    ("robot_motor", BlockKind::Motor),
    ("robot_stop", BlockKind::Stop),
    ("robot_set_speed", BlockKind::SetSpeed),
    ("robot_turn_timed", BlockKind::TurnTimed),
    ("robot_ramp_speed", BlockKind::RampSpeed),
    ("robot_go_home", BlockKind::GoHome),
    ("robot_record_start", BlockKind::RecordStart),
    ("robot_record_stop", BlockKind::RecordStop),
    ("robot_replay", BlockKind::Replay),
    ("robot_wait", BlockKind::Wait),
    ("robot_wait_sensor", BlockKind::WaitSensor),
    ("robot_count_laps", BlockKind::CountLaps),
    ("robot_autopilot", BlockKind::Autopilot),
    ("math_number", BlockKind::Number),
    ("logic_boolean", BlockKind::Boolean),
    ("variables_get", BlockKind::GetVariable),
    ("math_arithmetic", BlockKind::Arithmetic),
    ("math_modulo", BlockKind::Modulo),
    ("math_single", BlockKind::Single),
    ("logic_compare", BlockKind::Compare),
    ("logic_operation", BlockKind::LogicOperation),
    ("logic_negate", BlockKind::Negate),
    ("robot_sensor", BlockKind::Sensor),
    ("robot_timer", BlockKind::Timer),
    ("robot_pid", BlockKind::Pid),
    ("robot_smooth", BlockKind::Smooth),
    ("robot_schmitt", BlockKind::Schmitt),
    ("robot_edge", BlockKind::Edge),
];

impl BlockKind {
    pub fn from_type_name(name: &str) -> Self {
        TYPE_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, kind)| kind.clone())
            .unwrap_or_else(|| BlockKind::Unknown(name.to_string()))
    }

    pub fn type_name(&self) -> &str {
        match self {
            BlockKind::Unknown(name) => name,
            known => TYPE_NAMES
                .iter()
                .find(|(_, kind)| kind == known)
                .map(|(n, _)| *n)
                .unwrap_or("unknown"),
        }
    }
}

// ── Graph access ────────────────────────────────────────

impl Graph {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &BlockKind {
        &self.node(id).kind
    }

    /// Named child block (value or statement input), if connected.
    pub fn input(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.node(id).inputs.get(name).copied()
    }

    pub fn field(&self, id: NodeId, name: &str) -> Option<&FieldValue> {
        self.node(id).fields.get(name)
    }

    /// Upper-cased text of an enumerated field, or `""` when absent.
    pub fn field_choice(&self, id: NodeId, name: &str) -> String {
        self.field(id, name)
            .map(|f| f.as_text().to_ascii_uppercase())
            .unwrap_or_default()
    }

    /// Numeric field, `default` when absent or unparsable.
    pub fn field_number(&self, id: NodeId, name: &str, default: f64) -> f64 {
        self.field(id, name)
            .and_then(FieldValue::as_number)
            .unwrap_or(default)
    }

    /// Variable name carried by a `VAR` field. Missing names share one slot.
    pub fn variable_name(&self, id: NodeId) -> String {
        self.field(id, "VAR")
            .map(FieldValue::as_text)
            .unwrap_or_else(|| "item".to_string())
    }

    /// Walk a statement chain starting at `first`, following `next` links.
    pub fn chain(&self, first: Option<NodeId>) -> Chain<'_> {
        Chain {
            graph: self,
            cursor: first,
        }
    }

    /// Source span of a top-level stack.
    pub fn root_span(&self, id: NodeId) -> Option<Span> {
        let at = self.roots.iter().position(|&root| root == id)?;
        self.root_spans.get(at).copied()
    }

    /// Top-level "when program starts" blocks, in document order.
    pub fn start_blocks(&self) -> Vec<NodeId> {
        self.roots
            .iter()
            .copied()
            .filter(|&id| *self.kind(id) == BlockKind::Start)
            .collect()
    }
}

/// Iterator over a statement chain.
#[derive(Debug)]
pub struct Chain<'g> {
    graph: &'g Graph,
    cursor: Option<NodeId>,
}

impl Iterator for Chain<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cursor?;
        self.cursor = self.graph.node(id).next;
        Some(id)
    }
}

// ── Operators ───────────────────────────────────────────

/// Two-operand operators carried by arithmetic, comparison and logic blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Not,
}

/// Comparison choice of a `logic_compare` or `robot_wait_sensor` block.
pub fn compare_op(choice: &str) -> Option<BinOp> {
    match choice {
        "EQ" => Some(BinOp::Eq),
        "NEQ" => Some(BinOp::Ne),
        "LT" => Some(BinOp::Lt),
        "LTE" => Some(BinOp::Le),
        "GT" => Some(BinOp::Gt),
        "GTE" => Some(BinOp::Ge),
        _ => None,
    }
}

impl BlockKind {
    /// Kinds that lower as statements. Everything else is only meaningful
    /// in a value input.
    pub fn is_statement(&self) -> bool {
        use BlockKind::*;
        matches!(
            self,
            SetVariable
                | ChangeVariable
                | If
                | Repeat
                | WhileUntil
                | For
                | FlowControl
                | Drive
                | Motor
                | Stop
                | SetSpeed
                | TurnTimed
                | RampSpeed
                | GoHome
                | RecordStart
                | RecordStop
                | Replay
                | Wait
                | WaitSensor
                | CountLaps
                | Autopilot
        )
    }

    pub fn is_value(&self) -> bool {
        use BlockKind::*;
        matches!(
            self,
            Number
                | Boolean
                | GetVariable
                | Arithmetic
                | Modulo
                | Single
                | Compare
                | LogicOperation
                | Negate
                | Sensor
                | Timer
                | Pid
                | Smooth
                | Schmitt
                | Edge
        )
    }

    /// Inputs the compiler lowers for this kind (`controls_if` is dynamic,
    /// see [`Graph::children`]).
    pub fn input_names(&self) -> &'static [&'static str] {
        use BlockKind::*;
        match self {
            SetVariable => &["VALUE"],
            ChangeVariable => &["DELTA"],
            Repeat => &["TIMES", "DO"],
            WhileUntil => &["BOOL", "DO"],
            For => &["FROM", "TO", "BY", "DO"],
            Drive | Motor => &["SPEED"],
            SetSpeed => &["PERCENT"],
            TurnTimed | Autopilot => &["SPEED", "DURATION"],
            RampSpeed => &["TARGET", "DURATION"],
            Wait => &["MS"],
            WaitSensor => &["THRESHOLD"],
            CountLaps => &["LAPS", "THRESHOLD"],
            Arithmetic | Compare | LogicOperation => &["A", "B"],
            Modulo => &["DIVIDEND", "DIVISOR"],
            Single => &["NUM"],
            Negate => &["BOOL"],
            Pid => &["ERROR", "KP", "KI", "KD"],
            Smooth | Edge => &["VALUE"],
            Schmitt => &["VALUE", "LOW", "HIGH"],
            Start | If | FlowControl | Stop | GoHome | RecordStart | RecordStop | Replay
            | Number | Boolean | GetVariable | Sensor | Timer | Unknown(_) => &[],
        }
    }
}

impl Graph {
    /// Operator of a two-operand value block; `None` for other kinds and
    /// for unrecognised `OP` choices.
    pub fn binary_op(&self, id: NodeId) -> Option<BinOp> {
        let op = self.field_choice(id, "OP");
        match self.kind(id) {
            BlockKind::Arithmetic => match op.as_str() {
                "ADD" => Some(BinOp::Add),
                "MINUS" => Some(BinOp::Sub),
                "MULTIPLY" => Some(BinOp::Mul),
                "DIVIDE" => Some(BinOp::Div),
                "POWER" => Some(BinOp::Pow),
                _ => None,
            },
            BlockKind::Modulo => Some(BinOp::Mod),
            BlockKind::Compare => compare_op(&op),
            BlockKind::LogicOperation => match op.as_str() {
                "AND" => Some(BinOp::And),
                "OR" => Some(BinOp::Or),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn unary_op(&self, id: NodeId) -> Option<UnaryOp> {
        match self.kind(id) {
            BlockKind::Single => match self.field_choice(id, "OP").as_str() {
                "NEG" => Some(UnaryOp::Neg),
                "ABS" => Some(UnaryOp::Abs),
                _ => None,
            },
            BlockKind::Negate => Some(UnaryOp::Not),
            _ => None,
        }
    }

    /// Number of `IFn`/`DOn` branches on a `controls_if` block.
    pub fn if_branch_count(&self, id: NodeId) -> usize {
        self.node(id)
            .inputs
            .keys()
            .filter_map(|name| {
                name.strip_prefix("IF")
                    .or_else(|| name.strip_prefix("DO"))
                    .and_then(|n| n.parse::<usize>().ok())
            })
            // Branch indices are dense; anything past the input count is stray.
            .filter(|&n| n < self.node(id).inputs.len())
            .map(|n| n + 1)
            .max()
            .unwrap_or(0)
    }

    /// Child blocks the compiler will lower, in lowering order.
    pub fn children(&self, id: NodeId) -> Vec<(NodeId, InputKind)> {
        let kind = self.kind(id);
        match kind {
            BlockKind::If => {
                let mut out = Vec::new();
                for i in 0..self.if_branch_count(id) {
                    if let Some(cond) = self.input(id, &format!("IF{i}")) {
                        out.push((cond, InputKind::Value));
                    }
                    if let Some(body) = self.input(id, &format!("DO{i}")) {
                        out.push((body, InputKind::Statements));
                    }
                }
                if let Some(body) = self.input(id, "ELSE") {
                    out.push((body, InputKind::Statements));
                }
                out
            }
            BlockKind::Arithmetic | BlockKind::Compare | BlockKind::LogicOperation
                if self.binary_op(id).is_none() =>
            {
                Vec::new()
            }
            BlockKind::Single if self.unary_op(id).is_none() => Vec::new(),
            _ => kind
                .input_names()
                .iter()
                .filter_map(|name| {
                    let input_kind = if *name == "DO" {
                        InputKind::Statements
                    } else {
                        InputKind::Value
                    };
                    self.input(id, name).map(|c| (c, input_kind))
                })
                .collect(),
        }
    }
}

/// Whether an input holds a single value block or a statement chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Value,
    Statements,
}
