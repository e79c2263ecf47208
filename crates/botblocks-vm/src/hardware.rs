use botblocks_common::{MOTOR_COUNT, SENSOR_COUNT};

/// The narrow contract the runtime needs from a board.
pub trait Hardware {
    /// Monotonic milliseconds.
    fn now_ms(&self) -> u64;
    /// Set all four motors; values are already clamped to ±100.
    fn drive(&mut self, motors: [f32; MOTOR_COUNT]);
    /// Analog reading of `channel` (0..=3) in 0..=100.
    fn sensor_read(&mut self, channel: u8) -> f32;
}

/// One recorded `drive()` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveCall {
    pub at_ms: u64,
    pub motors: [f32; MOTOR_COUNT],
}

/// In-memory board: a manual clock, settable sensors and a log of every
/// motor command.
#[derive(Debug, Clone, Default)]
pub struct SimHardware {
    now: u64,
    sensors: [f32; SENSOR_COUNT],
    drives: Vec<DriveCall>,
}

impl SimHardware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, ms: u64) {
        self.now += ms;
    }

    pub fn set_sensor(&mut self, channel: u8, value: f32) {
        if let Some(slot) = self.sensors.get_mut(channel as usize) {
            *slot = value;
        }
    }

    pub fn drives(&self) -> &[DriveCall] {
        &self.drives
    }
}

impl Hardware for SimHardware {
    fn now_ms(&self) -> u64 {
        self.now
    }

    fn drive(&mut self, motors: [f32; MOTOR_COUNT]) {
        self.drives.push(DriveCall {
            at_ms: self.now,
            motors,
        });
    }

    fn sensor_read(&mut self, channel: u8) -> f32 {
        self.sensors.get(channel as usize).copied().unwrap_or(0.0)
    }
}
