use botblocks_common::{clamp_motor, MOTOR_COUNT};

use crate::hardware::Hardware;

/// One recorded motor output, relative to the start of recording.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackEntry {
    pub offset_ms: u64,
    pub motors: [f32; MOTOR_COUNT],
}

/// Bounded log of motor outputs for replay and go-home.
#[derive(Debug, Clone)]
pub struct Track {
    entries: Vec<TrackEntry>,
    capacity: usize,
    recording: bool,
    start_ms: u64,
    end_offset: u64,
}

impl Track {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            recording: false,
            start_ms: 0,
            end_offset: 0,
        }
    }

    /// Discard the previous track and start a new one at `now`.
    pub fn start(&mut self, now: u64) {
        self.entries.clear();
        self.recording = true;
        self.start_ms = now;
        self.end_offset = 0;
    }

    /// Close the track at `now`. No-op when not recording.
    pub fn stop(&mut self, now: u64) {
        if self.recording {
            self.recording = false;
            self.end_offset = now.saturating_sub(self.start_ms);
        }
    }

    /// Entries past capacity are dropped.
    fn record(&mut self, now: u64, motors: [f32; MOTOR_COUNT]) {
        if self.recording && self.entries.len() < self.capacity {
            self.entries.push(TrackEntry {
                offset_ms: now.saturating_sub(self.start_ms),
                motors,
            });
        }
    }

    pub fn entries(&self) -> &[TrackEntry] {
        &self.entries
    }

    /// Offset at which recording stopped.
    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The four logical motor channels and the speed multiplier.
///
/// Every output reaches the hardware as `command × speed / 100`, clamped.
#[derive(Debug, Clone)]
pub struct MotorBus {
    command: [f32; MOTOR_COUNT],
    speed: f32,
    track: Track,
}

impl MotorBus {
    pub fn new(track_capacity: usize) -> Self {
        Self {
            command: [0.0; MOTOR_COUNT],
            speed: 100.0,
            track: Track::new(track_capacity),
        }
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn track_mut(&mut self) -> &mut Track {
        &mut self.track
    }

    /// Left side is m1/m3, right side m2/m4.
    pub fn set_sides(&mut self, left: f32, right: f32) {
        let (left, right) = (clamp_motor(left), clamp_motor(right));
        self.command = [left, right, left, right];
    }

    pub fn set_motor(&mut self, motor: usize, value: f32) {
        if let Some(slot) = self.command.get_mut(motor) {
            *slot = clamp_motor(value);
        }
    }

    pub fn set_speed(&mut self, percent: f32) {
        self.speed = if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 100.0)
        };
    }

    /// Send the current command to the hardware.
    pub fn emit(&mut self, now: u64, hw: &mut dyn Hardware) {
        let motors = self.command.map(|c| clamp_motor(c * self.speed / 100.0));
        hw.drive(motors);
        self.track.record(now, motors);
    }

    pub fn stop(&mut self, now: u64, hw: &mut dyn Hardware) {
        self.command = [0.0; MOTOR_COUNT];
        self.emit(now, hw);
    }
}
