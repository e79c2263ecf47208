//! Hosted implementation of the cooperative runtime. It is the reference
//! for the C runtime the emitter ships, and drives `botblocks simulate`.

mod action;
pub mod controllers;
pub mod hardware;
pub mod motors;

use botblocks_codegen::bytecode::*;
use botblocks_common::{RuntimeLimits, MOTOR_COUNT, SENSOR_COUNT};
use tracing::{debug, trace};

use action::{Action, Progress};
use controllers::Controllers;
pub use hardware::{DriveCall, Hardware, SimHardware};
use motors::MotorBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Idle,
    Running,
    Halted,
}

/// Fixed-capacity operand stack. Overflowing pushes are dropped and popping
/// an empty stack yields 0.
#[derive(Debug, Clone)]
struct OperandStack {
    values: Vec<f32>,
    capacity: usize,
}

impl OperandStack {
    fn new(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, v: f32) {
        if self.values.len() < self.capacity {
            self.values.push(v);
        }
    }

    fn pop(&mut self) -> f32 {
        self.values.pop().unwrap_or(0.0)
    }

    fn pop_bool(&mut self) -> bool {
        self.pop() != 0.0
    }

    fn push_bool(&mut self, b: bool) {
        self.push(if b { 1.0 } else { 0.0 });
    }
}

enum Flow {
    Continue,
    Yield,
}

/// Milliseconds from a popped duration; negative and NaN mean zero.
fn duration_ms(v: f32) -> u64 {
    if v > 0.0 {
        v.min(i32::MAX as f32) as u64
    } else {
        0
    }
}

fn channel(a: i16) -> u8 {
    a.clamp(0, SENSOR_COUNT as i16 - 1) as u8
}

pub struct Vm {
    program: Program,
    limits: RuntimeLimits,
    state: VmState,
    stop_requested: bool,

    pc: usize,
    stack: OperandStack,
    vars: Vec<f32>,
    controllers: Controllers,

    start_ms: u64,
    wait_until: Option<u64>,
    bus: MotorBus,
    action: Option<Action>,
}

impl Vm {
    pub fn new(program: Program, limits: RuntimeLimits) -> Self {
        let slots = program.slots();
        Self {
            vars: vec![0.0; botblocks_sema::SlotCounts::array_len(slots.variables)],
            controllers: Controllers::new(slots, &limits),
            stack: OperandStack::new(limits.stack_capacity),
            bus: MotorBus::new(limits.track_capacity),
            program,
            limits,
            state: VmState::Idle,
            stop_requested: false,
            pc: 0,
            start_ms: 0,
            wait_until: None,
            action: None,
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn is_halted(&self) -> bool {
        self.state == VmState::Halted
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Name of the auxiliary action owning the ticks, if any.
    pub fn active_action(&self) -> Option<&'static str> {
        self.action.as_ref().map(Action::name)
    }

    /// Current value of a user variable.
    pub fn variable(&self, name: &str) -> Option<f32> {
        let slot = self
            .program
            .variable_names()
            .iter()
            .position(|n| n == name)?;
        self.vars.get(slot).copied()
    }

    /// Ask the VM to stop. Honoured at the start of the next tick.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Advance by one scheduler tick. Never blocks.
    pub fn tick(&mut self, hw: &mut dyn Hardware) {
        if self.state == VmState::Halted {
            return;
        }
        let now = hw.now_ms();
        if self.state == VmState::Idle {
            self.state = VmState::Running;
            self.start_ms = now;
            debug!(program = self.program.name(), now, "vm started");
        }
        trace!(now, pc = self.pc, "tick");

        if self.stop_requested {
            debug!(action = ?self.active_action(), "stop requested");
            self.halt(hw);
            return;
        }

        if let Some(action) = self.action.as_mut() {
            if action.step(now, hw, &mut self.bus) == Progress::Done {
                debug!(action = action.name(), now, "action finished");
                self.action = None;
            }
            return;
        }

        if let Some(deadline) = self.wait_until {
            if now < deadline {
                return;
            }
            self.wait_until = None;
        }

        for _ in 0..self.limits.step_budget.max(1) {
            let Some(&ins) = self.program.get(self.pc) else {
                debug!(now, "end of program");
                self.halt(hw);
                return;
            };
            self.pc += 1;
            if let Flow::Yield = self.execute(ins, now, hw) {
                return;
            }
        }
    }

    /// Motors off, everything cancelled, terminal.
    fn halt(&mut self, hw: &mut dyn Hardware) {
        hw.drive([0.0; MOTOR_COUNT]);
        self.action = None;
        self.wait_until = None;
        self.state = VmState::Halted;
        debug!("vm halted");
    }

    fn start_action(&mut self, action: Action, now: u64) -> Flow {
        debug!(action = action.name(), now, "action started");
        self.action = Some(action);
        Flow::Yield
    }

    fn execute(&mut self, ins: Instruction, now: u64, hw: &mut dyn Hardware) -> Flow {
        let stack = &mut self.stack;
        match ins.op {
            Opcode::PushF => stack.push(ins.f),
            Opcode::Load => {
                let v = self.vars.get(ins.a as usize).copied().unwrap_or(0.0);
                stack.push(v);
            }
            Opcode::Store => {
                let v = stack.pop();
                if let Some(slot) = self.vars.get_mut(ins.a as usize) {
                    *slot = v;
                }
            }

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::And
            | Opcode::Or => {
                let r = stack.pop();
                let l = stack.pop();
                stack.push(binary(ins.op, l, r));
            }
            Opcode::Neg => {
                let v = stack.pop();
                stack.push(-v);
            }
            Opcode::Abs => {
                let v = stack.pop();
                stack.push(v.abs());
            }
            Opcode::Not => {
                let b = stack.pop_bool();
                stack.push_bool(!b);
            }

            Opcode::Jmp => self.pc = (ins.b.max(0) as usize).min(self.program.len()),
            Opcode::Jz => {
                if !stack.pop_bool() {
                    self.pc = (ins.b.max(0) as usize).min(self.program.len());
                }
            }

            Opcode::Sensor => stack.push(hw.sensor_read(channel(ins.a))),
            Opcode::Timer => stack.push(now.saturating_sub(self.start_ms) as f32),

            Opcode::Pid => {
                let kd = stack.pop();
                let ki = stack.pop();
                let kp = stack.pop();
                let error = stack.pop();
                let out = self
                    .controllers
                    .pid
                    .get_mut(ins.a as usize)
                    .map_or(0.0, |pid| pid.update(error, kp, ki, kd, now));
                stack.push(out);
            }
            Opcode::Smooth => {
                let value = stack.pop();
                let out = self
                    .controllers
                    .smooth
                    .get_mut(ins.a as usize)
                    .map_or(0.0, |s| s.update(ins.b, value));
                stack.push(out);
            }
            Opcode::Schmitt => {
                let high = stack.pop();
                let low = stack.pop();
                let value = stack.pop();
                let out = self
                    .controllers
                    .schmitt
                    .get_mut(ins.a as usize)
                    .map_or(0.0, |s| s.update(value, low, high));
                stack.push(out);
            }
            Opcode::Edge => {
                let value = stack.pop();
                let mode = EdgeMode::from_operand(ins.b);
                let out = self
                    .controllers
                    .edge
                    .get_mut(ins.a as usize)
                    .map_or(0.0, |e| e.update(mode, value));
                stack.push(out);
            }

            Opcode::Drive => {
                let speed = stack.pop();
                let speed = match DriveDirection::from_operand(ins.a) {
                    DriveDirection::Forward => speed,
                    DriveDirection::Backward => -speed,
                };
                self.bus.set_sides(speed, speed);
                self.bus.emit(now, hw);
            }
            Opcode::Motor => {
                let speed = stack.pop();
                self.bus
                    .set_motor(ins.a.clamp(0, MOTOR_COUNT as i16 - 1) as usize, speed);
                self.bus.emit(now, hw);
            }
            Opcode::Stop => self.bus.stop(now, hw),
            Opcode::Speed => {
                let percent = stack.pop();
                self.bus.set_speed(percent);
                self.bus.emit(now, hw);
            }

            Opcode::Turn => {
                let duration = duration_ms(stack.pop());
                let speed = stack.pop();
                match TurnDirection::from_operand(ins.a) {
                    TurnDirection::Left => self.bus.set_sides(-speed, speed),
                    TurnDirection::Right => self.bus.set_sides(speed, -speed),
                }
                self.bus.emit(now, hw);
                return self.start_action(
                    Action::Turn {
                        until: now + duration,
                    },
                    now,
                );
            }
            Opcode::Ramp => {
                let duration = duration_ms(stack.pop());
                let target = stack.pop();
                let to = if target.is_nan() {
                    0.0
                } else {
                    target.clamp(0.0, 100.0)
                };
                let ramp = Action::Ramp {
                    from: self.bus.speed(),
                    to,
                    started: now,
                    duration,
                };
                return self.start_action(ramp, now);
            }
            Opcode::Home => {
                let track = self.bus.track_mut();
                track.stop(now);
                if !track.is_empty() {
                    let home = Action::go_home(track.entries(), track.end_offset());
                    return self.start_action(home, now);
                }
            }
            Opcode::Record => match RecordMode::from_operand(ins.a) {
                RecordMode::Start => self.bus.track_mut().start(now),
                RecordMode::Stop => self.bus.track_mut().stop(now),
            },
            Opcode::Replay => {
                let track = self.bus.track_mut();
                track.stop(now);
                if !track.is_empty() {
                    let replay = Action::Replay {
                        entries: track.entries().to_vec(),
                        end_offset: track.end_offset(),
                        started: None,
                        next: 0,
                    };
                    return self.start_action(replay, now);
                }
            }
            Opcode::Laps => {
                let threshold = stack.pop();
                let laps = stack.pop();
                let target = if laps >= 1.0 {
                    laps.min(i16::MAX as f32) as u32
                } else {
                    0
                };
                if target == 0 {
                    self.bus.stop(now, hw);
                } else {
                    let channel = channel(ins.a);
                    let above = hw.sensor_read(channel) >= threshold;
                    let action = Action::Laps {
                        channel,
                        threshold,
                        target,
                        count: 0,
                        above,
                    };
                    return self.start_action(action, now);
                }
            }
            Opcode::Autopilot => {
                let duration = duration_ms(stack.pop());
                let speed = botblocks_common::clamp_motor(stack.pop());
                let pilot = Action::Autopilot {
                    speed,
                    until: now + duration,
                };
                return self.start_action(pilot, now);
            }

            Opcode::Wait => {
                let ms = duration_ms(stack.pop());
                self.wait_until = Some(now + ms);
                return Flow::Yield;
            }
            Opcode::WaitSensor => {
                let threshold = stack.pop();
                let reading = hw.sensor_read(channel(ins.a));
                if !SensorCompare::from_operand(ins.b).holds(reading, threshold) {
                    stack.push(threshold);
                    self.pc -= 1;
                    return Flow::Yield;
                }
            }
        }
        Flow::Continue
    }
}

fn binary(op: Opcode, l: f32, r: f32) -> f32 {
    let truth = |b: bool| if b { 1.0 } else { 0.0 };
    match op {
        Opcode::Add => l + r,
        Opcode::Sub => l - r,
        Opcode::Mul => l * r,
        Opcode::Div if r == 0.0 => 0.0,
        Opcode::Div => l / r,
        Opcode::Mod if r == 0.0 => 0.0,
        Opcode::Mod => l % r,
        Opcode::Eq => truth(l == r),
        Opcode::Ne => truth(l != r),
        Opcode::Lt => truth(l < r),
        Opcode::Le => truth(l <= r),
        Opcode::Gt => truth(l > r),
        Opcode::Ge => truth(l >= r),
        Opcode::And => truth(l != 0.0 && r != 0.0),
        Opcode::Or => truth(l != 0.0 || r != 0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botblocks_codegen::compile;
    use botblocks_graph::parse;
    use proptest::prelude::*;

    const TICK_MS: u64 = 10;

    fn load_source(source: &str) -> Vm {
        let graph = parse(source).expect("parse error");
        let output = compile(&graph, &RuntimeLimits::esp32()).expect("compile error");
        Vm::new(output.program, RuntimeLimits::esp32())
    }

    fn load(statements: &[String]) -> Vm {
        load_source(&format!(
            r#"{{"blocks": [{{"type": "robot_start", "next": {}}}]}}"#,
            seq(statements)
        ))
    }

    /// Chain statements through their `next` links.
    fn seq(statements: &[String]) -> String {
        match statements.split_first() {
            None => "null".to_string(),
            Some((first, [])) => first.clone(),
            Some((first, rest)) => {
                let open = &first[..first.len() - 1];
                format!(r#"{open}, "next": {}}}"#, seq(rest))
            }
        }
    }

    fn num(v: f32) -> String {
        format!(r#"{{"type": "math_number", "fields": {{"NUM": {v}}}}}"#)
    }

    fn boolean(b: bool) -> String {
        let b = if b { "TRUE" } else { "FALSE" };
        format!(r#"{{"type": "logic_boolean", "fields": {{"BOOL": "{b}"}}}}"#)
    }

    fn get(var: &str) -> String {
        format!(r#"{{"type": "variables_get", "fields": {{"VAR": "{var}"}}}}"#)
    }

    fn set(var: &str, value: &str) -> String {
        format!(r#"{{"type": "variables_set", "fields": {{"VAR": "{var}"}}, "inputs": {{"VALUE": {value}}}}}"#)
    }

    fn change(var: &str) -> String {
        format!(
            r#"{{"type": "math_change", "fields": {{"VAR": "{var}"}}, "inputs": {{"DELTA": {}}}}}"#,
            num(1.0)
        )
    }

    fn block(kind: &str, fields: &str, inputs: &[(&str, String)]) -> String {
        let inputs: Vec<String> = inputs
            .iter()
            .map(|(name, value)| format!(r#""{name}": {value}"#))
            .collect();
        format!(
            r#"{{"type": "{kind}", "fields": {{{fields}}}, "inputs": {{{}}}}}"#,
            inputs.join(", ")
        )
    }

    fn run(vm: &mut Vm, hw: &mut SimHardware, max_ticks: usize) {
        for _ in 0..max_ticks {
            if vm.is_halted() {
                break;
            }
            vm.tick(hw);
            hw.advance(TICK_MS);
        }
    }

    fn run_to_end(vm: &mut Vm) -> SimHardware {
        let mut hw = SimHardware::new();
        run(vm, &mut hw, 10_000);
        assert!(vm.is_halted(), "program did not finish");
        hw
    }

    #[test]
    fn test_empty_program_halts_safely() {
        let mut vm = load_source(r#"{"blocks": [{"type": "robot_start"}]}"#);
        let mut hw = SimHardware::new();
        assert_eq!(vm.state(), VmState::Idle);
        vm.tick(&mut hw);
        assert!(vm.is_halted());
        for _ in 0..5 {
            hw.advance(TICK_MS);
            vm.tick(&mut hw);
        }
        assert_eq!(
            hw.drives(),
            [DriveCall {
                at_ms: 0,
                motors: [0.0; 4]
            }]
        );
    }

    #[test]
    fn test_if_branches_are_exclusive() {
        for c0 in [false, true] {
            for c1 in [false, true] {
                for with_else in [false, true] {
                    let mut inputs = vec![
                        ("IF0", boolean(c0)),
                        ("DO0", change("a")),
                        ("IF1", boolean(c1)),
                        ("DO1", change("b")),
                    ];
                    if with_else {
                        inputs.push(("ELSE", change("e")));
                    }
                    let mut vm = load(&[
                        set("a", &num(0.0)),
                        set("b", &num(0.0)),
                        set("e", &num(0.0)),
                        block("controls_if", "", &inputs),
                    ]);
                    run_to_end(&mut vm);

                    let hits = ["a", "b", "e"].map(|v| vm.variable(v) == Some(1.0));
                    let expected = if c0 {
                        [true, false, false]
                    } else if c1 {
                        [false, true, false]
                    } else {
                        [false, false, with_else]
                    };
                    assert_eq!(hits, expected, "c0={c0} c1={c1} else={with_else}");
                }
            }
        }
    }

    #[test]
    fn test_repeat_counts() {
        for (times, expected) in [(-3.0, 0.0), (0.0, 0.0), (5.0, 5.0), (2.5, 3.0)] {
            let mut vm = load(&[
                set("n", &num(0.0)),
                block("controls_repeat_ext", "", &[("TIMES", num(times)), ("DO", change("n"))]),
            ]);
            run_to_end(&mut vm);
            assert_eq!(vm.variable("n"), Some(expected), "repeat {times}");
        }
    }

    #[test]
    fn test_power_with_odd_exponents() {
        for (base, exp, expected) in [
            (3.0, 3.0, 27.0),
            (2.0, 0.0, 1.0),
            (2.0, 0.5, 1.0),
            (2.0, -1.0, 1.0),
            (2.0, 2.5, 4.0),
        ] {
            let power = block(
                "math_arithmetic",
                r#""OP": "POWER""#,
                &[("A", num(base)), ("B", num(exp))],
            );
            let mut vm = load(&[set("p", &power)]);
            run_to_end(&mut vm);
            assert_eq!(vm.variable("p"), Some(expected), "{base} ^ {exp}");
        }
    }

    fn for_visits(from: f32, to: f32, by: f32) -> Vec<f32> {
        let body = block(
            "robot_motor",
            r#""MOTOR": 0"#,
            &[("SPEED", get("i"))],
        );
        let mut vm = load(&[block(
            "controls_for",
            r#""VAR": "i""#,
            &[("FROM", num(from)), ("TO", num(to)), ("BY", num(by)), ("DO", body)],
        )]);
        let hw = run_to_end(&mut vm);
        let drives = hw.drives();
        // The last call is the halt.
        drives[..drives.len() - 1].iter().map(|d| d.motors[0]).collect()
    }

    #[test]
    fn test_for_loop_ascending_and_descending() {
        assert_eq!(for_visits(0.0, 10.0, 2.0), [0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
        assert_eq!(for_visits(10.0, 0.0, -2.0), [10.0, 8.0, 6.0, 4.0, 2.0, 0.0]);
        assert!(for_visits(5.0, 0.0, 1.0).is_empty());
    }

    #[test]
    fn test_break_and_continue() {
        let mut vm = load(&[
            set("n", &num(0.0)),
            block(
                "controls_repeat_ext",
                "",
                &[
                    ("TIMES", num(10.0)),
                    (
                        "DO",
                        seq(&[
                            change("n"),
                            block(
                                "controls_if",
                                "",
                                &[
                                    ("IF0", block("logic_compare", r#""OP": "GTE""#, &[("A", get("n")), ("B", num(4.0))])),
                                    ("DO0", block("controls_flow_statements", r#""FLOW": "BREAK""#, &[])),
                                ],
                            ),
                            block("controls_flow_statements", r#""FLOW": "CONTINUE""#, &[]),
                            set("n", &num(100.0)),
                        ]),
                    ),
                ],
            ),
        ]);
        run_to_end(&mut vm);
        assert_eq!(vm.variable("n"), Some(4.0));
    }

    #[test]
    fn test_pid_proportional_over_ticks() {
        let pid = block(
            "robot_pid",
            "",
            &[("ERROR", num(1.0)), ("KP", num(1.0)), ("KI", num(0.0)), ("KD", num(0.0))],
        );
        let body = seq(&[
            block("robot_motor", r#""MOTOR": 0"#, &[("SPEED", pid)]),
            block("robot_wait", "", &[("MS", num(20.0))]),
        ]);
        let mut vm = load(&[block(
            "controls_repeat_ext",
            "",
            &[("TIMES", num(3.0)), ("DO", body)],
        )]);
        let hw = run_to_end(&mut vm);
        let outputs: Vec<f32> = hw.drives().iter().map(|d| d.motors[0]).collect();
        assert_eq!(outputs, [1.0, 1.0, 1.0, 0.0]);
        assert_eq!(hw.drives()[1].at_ms - hw.drives()[0].at_ms, 20);
    }

    #[test]
    fn test_replay_reproduces_drives() {
        let mut vm = load(&[
            block("robot_record_start", "", &[]),
            block("robot_drive", r#""DIRECTION": "FORWARD""#, &[("SPEED", num(50.0))]),
            block("robot_wait", "", &[("MS", num(100.0))]),
            block("robot_drive", r#""DIRECTION": "BACKWARD""#, &[("SPEED", num(30.0))]),
            block("robot_wait", "", &[("MS", num(50.0))]),
            block("robot_stop", "", &[]),
            block("robot_record_stop", "", &[]),
            block("robot_replay", "", &[]),
        ]);
        let hw = run_to_end(&mut vm);
        let drives = hw.drives();
        let (recorded, replayed) = (&drives[0..3], &drives[3..6]);

        for (r, p) in recorded.iter().zip(replayed) {
            assert_eq!(r.motors, p.motors);
        }
        let gaps = |calls: &[DriveCall]| -> Vec<u64> {
            calls.windows(2).map(|w| w[1].at_ms - w[0].at_ms).collect()
        };
        assert_eq!(gaps(recorded), [100, 50]);
        assert_eq!(gaps(replayed), gaps(recorded));
        assert_eq!(drives.last().map(|d| d.motors), Some([0.0; 4]));
    }

    #[test]
    fn test_go_home_reverses_track() {
        let mut vm = load(&[
            block("robot_record_start", "", &[]),
            block("robot_drive", "", &[("SPEED", num(50.0))]),
            block("robot_wait", "", &[("MS", num(100.0))]),
            block("robot_go_home", "", &[]),
        ]);
        let hw = run_to_end(&mut vm);
        let motors: Vec<f32> = hw.drives().iter().map(|d| d.motors[0]).collect();
        assert_eq!(motors, [50.0, -50.0, 0.0, 0.0]);
        assert_eq!(hw.drives()[2].at_ms - hw.drives()[1].at_ms, 100);
    }

    #[test]
    fn test_timed_turn() {
        let mut vm = load(&[block(
            "robot_turn_timed",
            r#""DIRECTION": "LEFT""#,
            &[("SPEED", num(40.0)), ("DURATION", num(300.0))],
        )]);
        let hw = run_to_end(&mut vm);
        let drives = hw.drives();
        assert_eq!(drives[0].motors, [-40.0, 40.0, -40.0, 40.0]);
        assert_eq!(drives[1].motors, [0.0; 4]);
        assert_eq!(drives[1].at_ms, 300);
    }

    #[test]
    fn test_wait_sensor_rewinds() {
        let mut vm = load(&[
            block(
                "robot_wait_sensor",
                r#""CHANNEL": 1, "OP": "GT""#,
                &[("THRESHOLD", num(50.0))],
            ),
            block("robot_stop", "", &[]),
        ]);
        let mut hw = SimHardware::new();
        run(&mut vm, &mut hw, 20);
        assert_eq!(vm.state(), VmState::Running);
        assert_eq!(vm.pc(), 1);
        assert!(hw.drives().is_empty());

        hw.set_sensor(1, 60.0);
        run(&mut vm, &mut hw, 5);
        assert!(vm.is_halted());
        assert_eq!(hw.drives().len(), 2);
    }

    #[test]
    fn test_tick_is_bounded() {
        let mut vm = load(&[block(
            "controls_whileUntil",
            r#""MODE": "WHILE""#,
            &[("BOOL", boolean(true))],
        )]);
        let mut hw = SimHardware::new();
        run(&mut vm, &mut hw, 50);
        assert_eq!(vm.state(), VmState::Running);
    }

    #[test]
    fn test_stop_during_any_action() {
        let record = |wait: f32| {
            vec![
                block("robot_record_start", "", &[]),
                block("robot_drive", "", &[("SPEED", num(50.0))]),
                block("robot_wait", "", &[("MS", num(wait))]),
            ]
        };
        let mut home = record(100.0);
        home.push(block("robot_go_home", "", &[]));
        let mut replay = record(100.0);
        replay.push(block("robot_replay", "", &[]));

        let cases: Vec<(&str, Vec<String>, bool)> = vec![
            (
                "turn",
                vec![block(
                    "robot_turn_timed",
                    "",
                    &[("SPEED", num(50.0)), ("DURATION", num(1000.0))],
                )],
                true,
            ),
            (
                "ramp",
                vec![block(
                    "robot_ramp_speed",
                    "",
                    &[("TARGET", num(20.0)), ("DURATION", num(1000.0))],
                )],
                true,
            ),
            ("home", home, true),
            ("replay", replay, true),
            (
                "laps",
                vec![block(
                    "robot_count_laps",
                    r#""CHANNEL": 0"#,
                    &[("LAPS", num(3.0)), ("THRESHOLD", num(50.0))],
                )],
                true,
            ),
            (
                "autopilot",
                vec![block(
                    "robot_autopilot",
                    "",
                    &[("SPEED", num(50.0)), ("DURATION", num(1000.0))],
                )],
                true,
            ),
            ("wait", vec![block("robot_wait", "", &[("MS", num(1000.0))])], false),
            (
                "wait_sensor",
                vec![block("robot_wait_sensor", "", &[("THRESHOLD", num(50.0))])],
                false,
            ),
        ];

        for (name, program, has_action) in cases {
            let mut vm = load(&program);
            let mut hw = SimHardware::new();
            for _ in 0..500 {
                vm.tick(&mut hw);
                hw.advance(TICK_MS);
                if !has_action || vm.active_action().is_some() {
                    break;
                }
            }
            if has_action {
                assert!(vm.active_action().is_some(), "{name}: action never started");
            }
            // Let the action run for a couple of ticks.
            for _ in 0..2 {
                vm.tick(&mut hw);
                hw.advance(TICK_MS);
            }
            assert_eq!(vm.state(), VmState::Running, "{name}: finished too early");

            let before = hw.drives().len();
            vm.request_stop();
            for _ in 0..10 {
                vm.tick(&mut hw);
                hw.advance(TICK_MS);
            }
            assert!(vm.is_halted(), "{name}");
            assert!(vm.active_action().is_none(), "{name}");
            let after: Vec<_> = hw.drives()[before..].iter().map(|d| d.motors).collect();
            assert_eq!(after, [[0.0; 4]], "{name}");
        }
    }

    // ── Expression trees against a reference evaluator ─────────

    #[derive(Debug, Clone)]
    enum Expr {
        Num(f32),
        Arith(&'static str, Box<Expr>, Box<Expr>),
        Pow(Box<Expr>, u8),
        Modulo(Box<Expr>, Box<Expr>),
        Compare(&'static str, Box<Expr>, Box<Expr>),
        Logic(&'static str, Box<Expr>, Box<Expr>),
        Single(&'static str, Box<Expr>),
        Not(Box<Expr>),
    }

    impl Expr {
        fn to_json(&self) -> String {
            let op = |op: &str| format!(r#""OP": "{op}""#);
            match self {
                Expr::Num(v) => num(*v),
                Expr::Arith(o, a, b) | Expr::Compare(o, a, b) | Expr::Logic(o, a, b) => {
                    let kind = match self {
                        Expr::Arith(..) => "math_arithmetic",
                        Expr::Compare(..) => "logic_compare",
                        _ => "logic_operation",
                    };
                    block(kind, &op(*o), &[("A", a.to_json()), ("B", b.to_json())])
                }
                Expr::Pow(a, e) => block(
                    "math_arithmetic",
                    &op("POWER"),
                    &[("A", a.to_json()), ("B", num(*e as f32))],
                ),
                Expr::Modulo(a, b) => block(
                    "math_modulo",
                    "",
                    &[("DIVIDEND", a.to_json()), ("DIVISOR", b.to_json())],
                ),
                Expr::Single(o, a) => block("math_single", &op(*o), &[("NUM", a.to_json())]),
                Expr::Not(a) => block("logic_negate", "", &[("BOOL", a.to_json())]),
            }
        }

        fn eval(&self) -> f32 {
            let truth = |b: bool| if b { 1.0 } else { 0.0 };
            match self {
                Expr::Num(v) => *v,
                Expr::Arith(o, a, b) => {
                    let (l, r) = (a.eval(), b.eval());
                    match *o {
                        "ADD" => l + r,
                        "MINUS" => l - r,
                        "MULTIPLY" => l * r,
                        _ if r == 0.0 => 0.0,
                        _ => l / r,
                    }
                }
                Expr::Pow(a, e) => {
                    let base = a.eval();
                    let mut exp = *e as f32;
                    let mut acc = 1.0f32;
                    while exp >= 1.0 {
                        acc *= base;
                        exp -= 1.0;
                    }
                    acc
                }
                Expr::Modulo(a, b) => {
                    let (l, r) = (a.eval(), b.eval());
                    if r == 0.0 {
                        0.0
                    } else {
                        l % r
                    }
                }
                Expr::Compare(o, a, b) => {
                    let (l, r) = (a.eval(), b.eval());
                    truth(match *o {
                        "EQ" => l == r,
                        "NEQ" => l != r,
                        "LT" => l < r,
                        "LTE" => l <= r,
                        "GT" => l > r,
                        _ => l >= r,
                    })
                }
                Expr::Logic(o, a, b) => {
                    let (l, r) = (a.eval() != 0.0, b.eval() != 0.0);
                    truth(if *o == "AND" { l && r } else { l || r })
                }
                Expr::Single(o, a) => {
                    let v = a.eval();
                    if *o == "NEG" {
                        -v
                    } else {
                        v.abs()
                    }
                }
                Expr::Not(a) => truth(a.eval() == 0.0),
            }
        }
    }

    fn expr() -> impl Strategy<Value = Expr> {
        let leaf = (-20i32..=20).prop_map(|n| Expr::Num(n as f32 / 2.0));
        leaf.prop_recursive(4, 32, 2, |inner| {
            let pair = || (inner.clone(), inner.clone());
            prop_oneof![
                (prop::sample::select(vec!["ADD", "MINUS", "MULTIPLY", "DIVIDE"]), pair())
                    .prop_map(|(o, (a, b))| Expr::Arith(o, Box::new(a), Box::new(b))),
                (inner.clone(), 0u8..4).prop_map(|(a, e)| Expr::Pow(Box::new(a), e)),
                pair().prop_map(|(a, b)| Expr::Modulo(Box::new(a), Box::new(b))),
                (prop::sample::select(vec!["EQ", "NEQ", "LT", "LTE", "GT", "GTE"]), pair())
                    .prop_map(|(o, (a, b))| Expr::Compare(o, Box::new(a), Box::new(b))),
                (prop::sample::select(vec!["AND", "OR"]), pair())
                    .prop_map(|(o, (a, b))| Expr::Logic(o, Box::new(a), Box::new(b))),
                (prop::sample::select(vec!["NEG", "ABS"]), inner.clone())
                    .prop_map(|(o, a)| Expr::Single(o, Box::new(a))),
                inner.clone().prop_map(|a| Expr::Not(Box::new(a))),
            ]
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_compiled_expression_matches_reference(e in expr()) {
            let mut vm = load(&[set("out", &e.to_json())]);
            run_to_end(&mut vm);
            let got = vm.variable("out").unwrap_or(f32::NAN);
            let want = e.eval();
            prop_assert!(
                got == want || (got.is_nan() && want.is_nan()),
                "{e:?}: vm {got} vs reference {want}"
            );
        }
    }
}
