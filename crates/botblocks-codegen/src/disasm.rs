use std::fmt::Write;

use crate::bytecode::{Instruction, Opcode, Program};

/// Human-readable listing, one instruction per line.
pub fn disassemble(program: &Program) -> String {
    let mut out = String::new();
    for (pc, ins) in program.instructions().iter().enumerate() {
        let line = format!("{pc:04}  {}", operands(program, ins));
        let _ = writeln!(out, "{}", line.trim_end());
    }
    out
}

fn operands(program: &Program, ins: &Instruction) -> String {
    let name = ins.op.mnemonic();
    match ins.op {
        Opcode::PushF => format!("{name} {}", ins.f),
        Opcode::Load | Opcode::Store => {
            match program.variable_names().get(ins.a as usize) {
                Some(var) => format!("{name} {} ; {var}", ins.a),
                None => format!("{name} {}", ins.a),
            }
        }
        Opcode::Jmp | Opcode::Jz => format!("{name} -> {:04}", ins.b),
        Opcode::Sensor
        | Opcode::Pid
        | Opcode::Schmitt
        | Opcode::Drive
        | Opcode::Motor
        | Opcode::Turn
        | Opcode::Record
        | Opcode::Laps => format!("{name} {}", ins.a),
        Opcode::Smooth | Opcode::Edge | Opcode::WaitSensor => {
            format!("{name} {} {}", ins.a, ins.b)
        }
        _ => name.to_string(),
    }
}
