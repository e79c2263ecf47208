use botblocks_common::{AUTOPILOT_GAIN, MOTOR_COUNT};

use crate::hardware::Hardware;
use crate::motors::{MotorBus, TrackEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Running,
    Done,
}

/// A multi-tick action. While one is active it owns every tick; bytecode
/// does not run until it reports `Done`.
#[derive(Debug, Clone)]
pub(crate) enum Action {
    /// Spin in place until `until`.
    Turn { until: u64 },
    /// Move the speed multiplier linearly from `from` to `to`.
    Ramp {
        from: f32,
        to: f32,
        started: u64,
        duration: u64,
    },
    /// Undo the track: reversed, negated, each held for its recorded time.
    GoHome {
        segments: Vec<([f32; MOTOR_COUNT], u64)>,
        hold_until: Option<u64>,
    },
    /// Re-issue the track at its recorded offsets, timed from the first step.
    Replay {
        entries: Vec<TrackEntry>,
        end_offset: u64,
        started: Option<u64>,
        next: usize,
    },
    /// Keep driving until `channel` has risen above `threshold` `target` times.
    Laps {
        channel: u8,
        threshold: f32,
        target: u32,
        count: u32,
        above: bool,
    },
    /// Follow a line with sensors 0 (left) and 1 (right) until `until`.
    Autopilot { speed: f32, until: u64 },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Turn { .. } => "turn",
            Action::Ramp { .. } => "ramp",
            Action::GoHome { .. } => "go-home",
            Action::Replay { .. } => "replay",
            Action::Laps { .. } => "laps",
            Action::Autopilot { .. } => "autopilot",
        }
    }

    /// Segments for go-home: each entry holds until the next one (the last
    /// until the end of recording), walked backwards with negated motors.
    pub fn go_home(entries: &[TrackEntry], end_offset: u64) -> Self {
        let mut segments: Vec<_> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let until = entries.get(i + 1).map_or(end_offset, |n| n.offset_ms);
                (e.motors.map(|m| -m), until.saturating_sub(e.offset_ms))
            })
            .collect();
        segments.reverse();
        Action::GoHome {
            segments,
            hold_until: None,
        }
    }

    pub fn step(&mut self, now: u64, hw: &mut dyn Hardware, bus: &mut MotorBus) -> Progress {
        match self {
            Action::Turn { until } => {
                if now >= *until {
                    bus.stop(now, hw);
                    return Progress::Done;
                }
                Progress::Running
            }

            Action::Ramp {
                from,
                to,
                started,
                duration,
            } => {
                let elapsed = now.saturating_sub(*started);
                if elapsed >= *duration {
                    bus.set_speed(*to);
                    bus.emit(now, hw);
                    return Progress::Done;
                }
                let t = elapsed as f32 / *duration as f32;
                bus.set_speed(*from + (*to - *from) * t);
                bus.emit(now, hw);
                Progress::Running
            }

            Action::GoHome {
                segments,
                hold_until,
            } => {
                if let Some(deadline) = *hold_until {
                    if now < deadline {
                        return Progress::Running;
                    }
                    segments.remove(0);
                    *hold_until = None;
                }
                match segments.first() {
                    Some(&(motors, hold)) => {
                        hw.drive(motors);
                        *hold_until = Some(now + hold);
                        Progress::Running
                    }
                    None => {
                        bus.stop(now, hw);
                        Progress::Done
                    }
                }
            }

            Action::Replay {
                entries,
                end_offset,
                started,
                next,
            } => {
                let elapsed = now.saturating_sub(*started.get_or_insert(now));
                let base = entries.first().map_or(0, |e| e.offset_ms);
                while let Some(entry) = entries.get(*next) {
                    if entry.offset_ms - base > elapsed {
                        break;
                    }
                    hw.drive(entry.motors);
                    *next += 1;
                }
                if *next >= entries.len() && elapsed >= end_offset.saturating_sub(base) {
                    bus.stop(now, hw);
                    return Progress::Done;
                }
                Progress::Running
            }

            Action::Laps {
                channel,
                threshold,
                target,
                count,
                above,
            } => {
                let now_above = hw.sensor_read(*channel) >= *threshold;
                if now_above && !*above {
                    *count += 1;
                }
                *above = now_above;
                if *count >= *target {
                    bus.stop(now, hw);
                    return Progress::Done;
                }
                Progress::Running
            }

            Action::Autopilot { speed, until } => {
                if now >= *until {
                    bus.stop(now, hw);
                    return Progress::Done;
                }
                let steer = (hw.sensor_read(0) - hw.sensor_read(1)) * AUTOPILOT_GAIN;
                bus.set_sides(*speed - steer, *speed + steer);
                bus.emit(now, hw);
                Progress::Running
            }
        }
    }
}
