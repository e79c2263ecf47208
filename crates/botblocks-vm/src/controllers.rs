use botblocks_codegen::bytecode::EdgeMode;
use botblocks_common::{RuntimeLimits, PID_INTEGRAL_LIMIT};
use botblocks_sema::SlotCounts;

#[derive(Debug, Clone, Copy, Default)]
pub struct PidState {
    integral: f32,
    prev_error: f32,
    last_ms: Option<u64>,
}

impl PidState {
    /// One controller update. `dt` is measured from the previous update and
    /// is zero on the first, so the first output has no I or D part.
    pub fn update(&mut self, error: f32, kp: f32, ki: f32, kd: f32, now: u64) -> f32 {
        let dt = self
            .last_ms
            .map(|last| now.saturating_sub(last) as f32 / 1000.0)
            .unwrap_or(0.0);
        self.integral =
            (self.integral + error * dt).clamp(-PID_INTEGRAL_LIMIT, PID_INTEGRAL_LIMIT);
        let derivative = if dt > 0.0 {
            (error - self.prev_error) / dt
        } else {
            0.0
        };
        self.prev_error = error;
        self.last_ms = Some(now);
        kp * error + ki * self.integral + kd * derivative
    }
}

/// Moving average over a ring buffer. The first sample fills the window.
#[derive(Debug, Clone)]
pub struct SmoothState {
    buf: Vec<f32>,
    next: usize,
    max_window: usize,
}

impl SmoothState {
    pub fn new(max_window: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_window),
            next: 0,
            max_window: max_window.max(1),
        }
    }

    pub fn update(&mut self, window: i16, value: f32) -> f32 {
        let window = (window.max(1) as usize).min(self.max_window);
        if self.buf.len() != window {
            self.buf.clear();
            self.buf.resize(window, value);
            self.next = 0;
        } else {
            self.buf[self.next] = value;
            self.next = (self.next + 1) % window;
        }
        self.buf.iter().sum::<f32>() / window as f32
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SchmittState {
    high: bool,
}

impl SchmittState {
    pub fn update(&mut self, value: f32, low: f32, high: f32) -> f32 {
        if value >= high {
            self.high = true;
        } else if value <= low {
            self.high = false;
        }
        if self.high {
            1.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeState {
    prev: Option<bool>,
}

impl EdgeState {
    /// 1.0 on the selected transition of `value != 0`, otherwise 0.0.
    pub fn update(&mut self, mode: EdgeMode, value: f32) -> f32 {
        let current = value != 0.0;
        let fired = match self.prev {
            None => false,
            Some(prev) => match mode {
                EdgeMode::Rising => !prev && current,
                EdgeMode::Falling => prev && !current,
                EdgeMode::Both => prev != current,
            },
        };
        self.prev = Some(current);
        if fired {
            1.0
        } else {
            0.0
        }
    }
}

/// Persistent controller state, one array per family sized from the
/// program's slot counts.
#[derive(Debug, Clone)]
pub struct Controllers {
    pub pid: Vec<PidState>,
    pub smooth: Vec<SmoothState>,
    pub schmitt: Vec<SchmittState>,
    pub edge: Vec<EdgeState>,
}

impl Controllers {
    pub fn new(slots: SlotCounts, limits: &RuntimeLimits) -> Self {
        Self {
            pid: vec![PidState::default(); SlotCounts::array_len(slots.pid)],
            smooth: vec![
                SmoothState::new(limits.smooth_window_max);
                SlotCounts::array_len(slots.smooth)
            ],
            schmitt: vec![SchmittState::default(); SlotCounts::array_len(slots.schmitt)],
            edge: vec![EdgeState::default(); SlotCounts::array_len(slots.edge)],
        }
    }
}
