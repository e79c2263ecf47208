use codespan_reporting::files::SimpleFiles;
use serde::{Deserialize, Serialize};

/// Byte offset into source text.
pub type ByteOffset = usize;

/// A span of source code, represented as a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: ByteOffset,
    pub end: ByteOffset,
}

impl Span {
    pub fn new(start: ByteOffset, end: ByteOffset) -> Self {
        Self { start, end }
    }

    pub fn to_range(self) -> std::ops::Range<usize> {
        self.start..self.end
    }

    /// The same span moved `by` bytes to the right.
    pub fn shift(self, by: ByteOffset) -> Span {
        Span::new(self.start + by, self.end + by)
    }
}

/// File id for codespan-reporting.
pub type FileId = usize;

/// Source file database using codespan-reporting.
pub type SourceDb = SimpleFiles<String, String>;

/// Stable identity of a block inside one loaded graph (its arena index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ── Robot constants ─────────────────────────────────────

/// Number of logical motor channels: front-left, front-right, rear-left, rear-right.
pub const MOTOR_COUNT: usize = 4;

/// Number of analog sensor channels.
pub const SENSOR_COUNT: usize = 4;

/// Motor commands are clamped to `[-MOTOR_LIMIT, MOTOR_LIMIT]`.
pub const MOTOR_LIMIT: f32 = 100.0;

/// Proportional gain of the line-following autopilot.
pub const AUTOPILOT_GAIN: f32 = 0.5;

/// Anti-windup bound for the PID integral term.
pub const PID_INTEGRAL_LIMIT: f32 = 1000.0;

/// Sizing of the fixed runtime arrays on the target device.
///
/// The compiler's stack-depth check and the emitted `#define`s read the
/// same values, so the hosted VM and the generated runtime agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeLimits {
    /// Operand stack entries.
    pub stack_capacity: usize,
    /// Maximum instructions executed per scheduler tick.
    pub step_budget: usize,
    /// Maximum recorded drive commands.
    pub track_capacity: usize,
    /// Largest smoothing window (ring buffer length per slot).
    pub smooth_window_max: usize,
}

impl RuntimeLimits {
    /// 8-bit AVR boards (2 KiB of RAM).
    pub fn avr() -> Self {
        Self {
            stack_capacity: 16,
            step_budget: 32,
            track_capacity: 32,
            smooth_window_max: 8,
        }
    }

    /// ESP32-class boards.
    pub fn esp32() -> Self {
        Self {
            stack_capacity: 32,
            step_budget: 128,
            track_capacity: 128,
            smooth_window_max: 16,
        }
    }
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self::avr()
    }
}

/// Clamp a motor command into the legal range. NaN maps to 0.
pub fn clamp_motor(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(-MOTOR_LIMIT, MOTOR_LIMIT)
    }
}
