pub mod bytecode;
pub mod compile;
pub mod disasm;
pub mod emit;
mod expr;
pub mod stack_check;

use botblocks_common::{FileId, RuntimeLimits};
use botblocks_graph::block::Graph;
use botblocks_sema::{analyze, SemaWarning};
use codespan_reporting::diagnostic::Diagnostic;
use thiserror::Error;
use tracing::{debug, warn};

pub use bytecode::{Instruction, Opcode, Program};
pub use compile::Compiler;
pub use disasm::disassemble;
pub use emit::{emit_source, sanitize_identifier};

/// The only inputs that produce no artifact at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("the program has no blocks")]
    EmptyGraph,
    #[error("no \"when program starts\" block; nothing would run")]
    NoStartBlock,
    #[error("the program needs {len} instructions but jump targets only reach {limit}")]
    ProgramTooLarge { len: usize, limit: usize },
    #[error("the program needs {count} storage slots of one kind but at most {limit} are addressable")]
    TooManySlots { count: usize, limit: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileWarning {
    #[error(transparent)]
    Sema(#[from] SemaWarning),
    #[error("expressions nest {depth} values deep but the target stack holds {capacity}; deeper values are dropped at run time")]
    StackDepth { depth: usize, capacity: usize },
}

#[derive(Debug)]
pub struct CompileOutput {
    pub program: Program,
    pub warnings: Vec<CompileWarning>,
    pub max_stack_depth: usize,
}

impl CompileOutput {
    pub fn to_diagnostics(&self, file_id: FileId) -> Vec<Diagnostic<FileId>> {
        self.warnings
            .iter()
            .map(|w| match w {
                CompileWarning::Sema(w) => w.to_diagnostic(file_id),
                CompileWarning::StackDepth { .. } => {
                    Diagnostic::warning().with_message(w.to_string())
                }
            })
            .collect()
    }
}

/// Compile a block graph into a bytecode program for a target with `limits`.
pub fn compile(graph: &Graph, limits: &RuntimeLimits) -> Result<CompileOutput, CompileError> {
    if graph.nodes.is_empty() {
        return Err(CompileError::EmptyGraph);
    }
    let sema = analyze(graph);
    let start = sema.start.ok_or(CompileError::NoStartBlock)?;

    let mut warnings: Vec<CompileWarning> =
        sema.warnings.into_iter().map(CompileWarning::from).collect();

    let mut compiler = Compiler::new(graph, sema.slots);
    compiler.compile_chain(graph.node(start).next);
    let program = compiler.finish(&graph.name)?;

    let max_stack_depth = stack_check::max_depth(program.instructions());
    if max_stack_depth > limits.stack_capacity {
        warnings.push(CompileWarning::StackDepth {
            depth: max_stack_depth,
            capacity: limits.stack_capacity,
        });
    }

    debug!(
        program = program.name(),
        instructions = program.len(),
        max_stack_depth,
        slots = ?program.slots(),
        "compiled"
    );
    for w in &warnings {
        warn!("{w}");
    }

    Ok(CompileOutput {
        program,
        warnings,
        max_stack_depth,
    })
}
