use std::fmt::Write;

use botblocks_common::{RuntimeLimits, AUTOPILOT_GAIN, MOTOR_LIMIT, PID_INTEGRAL_LIMIT};
use botblocks_sema::SlotCounts;

use crate::bytecode::{Opcode, Program};

const RUNTIME_TEMPLATE: &str = include_str!("../runtime/runtime.c");

/// Longest identifier the emitter produces.
pub const MAX_IDENT_LEN: usize = 32;

/// Turn a user-chosen program name into a C identifier:
/// lowercase `[a-z0-9_]`, no repeated or edge underscores, bounded length.
pub fn sanitize_identifier(name: &str) -> String {
    let mut ident = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_alphanumeric() { c } else { '_' };
        if c == '_' && (ident.is_empty() || ident.ends_with('_')) {
            continue;
        }
        ident.push(c);
    }
    ident.truncate(MAX_IDENT_LEN);
    while ident.ends_with('_') {
        ident.pop();
    }

    if ident.is_empty() {
        return "program".to_string();
    }
    if ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert_str(0, "p_");
        ident.truncate(MAX_IDENT_LEN);
        while ident.ends_with('_') {
            ident.pop();
        }
    }
    ident
}

/// Render `program` as a self-contained C header: opcode enum, instruction
/// table, state layout sized from the slot counts, and the runtime.
///
/// Output depends only on the arguments, byte for byte.
pub fn emit_source(program: &Program, name: &str, limits: &RuntimeLimits) -> String {
    let ident = sanitize_identifier(name);
    let guard = format!("BB_{}_H", ident.to_ascii_uppercase());
    let mut out = String::new();

    let _ = writeln!(out, "/* {ident}: generated by botblocks. Do not edit. */");
    let _ = writeln!(out, "#ifndef {guard}");
    let _ = writeln!(out, "#define {guard}");
    out.push('\n');
    out.push_str("#include <stdint.h>\n#include <math.h>\n\n");

    emit_opcodes(&mut out);
    emit_layout(&mut out, program.slots(), program.len(), limits);
    emit_table(&mut out, program, &ident);

    out.push_str(&RUNTIME_TEMPLATE.replace("@IDENT@", &ident));
    out.push('\n');
    let _ = writeln!(out, "#endif /* {guard} */");
    out
}

fn emit_opcodes(out: &mut String) {
    out.push_str("typedef enum {\n");
    for op in Opcode::ALL {
        let _ = writeln!(out, "    BB_OP_{} = {},", op.mnemonic(), op as u8);
    }
    out.push_str("} bb_opcode_t;\n\n");

    out.push_str("typedef struct {\n");
    out.push_str("    uint8_t op;\n    int16_t a;\n    int16_t b;\n    float f;\n");
    out.push_str("} bb_insn_t;\n\n");
}

fn emit_layout(out: &mut String, slots: SlotCounts, len: usize, limits: &RuntimeLimits) {
    let defines = [
        ("BB_NUM_VARS", SlotCounts::array_len(slots.variables)),
        ("BB_NUM_PID", SlotCounts::array_len(slots.pid)),
        ("BB_NUM_SMOOTH", SlotCounts::array_len(slots.smooth)),
        ("BB_NUM_SCHMITT", SlotCounts::array_len(slots.schmitt)),
        ("BB_NUM_EDGE", SlotCounts::array_len(slots.edge)),
        ("BB_STACK_SIZE", limits.stack_capacity.max(1)),
        ("BB_STEP_BUDGET", limits.step_budget.max(1)),
        ("BB_TRACK_SIZE", limits.track_capacity.max(1)),
        ("BB_SMOOTH_MAX", limits.smooth_window_max.max(1)),
        ("BB_PROGRAM_LEN", len),
    ];
    for (name, value) in defines {
        let _ = writeln!(out, "#define {name} {value}");
    }
    let _ = writeln!(out, "#define BB_MOTOR_LIMIT {}", c_float(MOTOR_LIMIT));
    let _ = writeln!(out, "#define BB_PID_INTEGRAL_LIMIT {}", c_float(PID_INTEGRAL_LIMIT));
    let _ = writeln!(out, "#define BB_AUTOPILOT_GAIN {}", c_float(AUTOPILOT_GAIN));
    out.push('\n');
}

fn emit_table(out: &mut String, program: &Program, ident: &str) {
    let _ = writeln!(out, "static const bb_insn_t {ident}_program[] = {{");
    if program.is_empty() {
        // C has no empty arrays; BB_PROGRAM_LEN is 0 so this row never runs.
        out.push_str("    { BB_OP_PUSHF, 0, 0, 0.0f },\n");
    }
    for (pc, ins) in program.instructions().iter().enumerate() {
        let _ = writeln!(
            out,
            "    {{ BB_OP_{}, {}, {}, {} }}, /* {pc} */",
            ins.op.mnemonic(),
            ins.a,
            ins.b,
            c_float(ins.f)
        );
    }
    out.push_str("};\n\n");
}

fn c_float(value: f32) -> String {
    if value.is_finite() {
        format!("{value:?}f")
    } else {
        "0.0f".to_string()
    }
}
