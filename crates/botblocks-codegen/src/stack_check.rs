use crate::bytecode::Instruction;

/// Deepest operand stack the program can reach.
///
/// Every statement leaves the stack as it found it, so a straight scan over
/// the code (ignoring jumps) visits each instruction at its true entry depth.
pub fn max_depth(code: &[Instruction]) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    for ins in code {
        let (pops, pushes) = ins.op.stack_effect();
        depth = depth.saturating_sub(pops) + pushes;
        max = max.max(depth);
    }
    max
}
