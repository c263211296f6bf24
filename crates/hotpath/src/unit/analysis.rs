//! Operand stack dataflow.
//!
//! Walks every reachable instruction, checking that each pc is always reached
//! with the same stack depth. The result is the stack high-water mark and one
//! [`Frame`] per reachable branch or handler target, which is exactly the
//! metadata a loader verifies against.

use super::{Frame, Instruction, Method, UnitError};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSummary {
    pub max_stack: u16,
    pub frames: Vec<Frame>,
}

pub fn compute_frames(method: &Method) -> Result<StackSummary, UnitError> {
    let code = &method.code;
    if code.is_empty() {
        return Err(UnitError::FallsOffEnd { pc: 0 });
    }

    let index = |pc: u32| {
        method
            .index_of(pc)
            .ok_or(UnitError::BadTarget { what: "branch", pc })
    };

    let mut frame_pcs: BTreeSet<u32> = code
        .iter()
        .filter_map(|insn| insn.op.target().copied())
        .collect();
    frame_pcs.extend(method.handlers.iter().map(|h| h.target));

    let mut depth_at: Vec<Option<u16>> = vec![None; code.len()];
    depth_at[0] = Some(0);
    let mut worklist: Vec<usize> = vec![0];
    let mut max_stack: u16 = 0;

    while let Some(idx) = worklist.pop() {
        let insn = &code[idx];
        let depth = depth_at[idx].unwrap_or(0);

        if let Some(slot) = insn.op.local_slot()
            && slot >= method.max_locals
        {
            return Err(UnitError::BadLocal {
                pc: insn.pc,
                slot,
                max_locals: method.max_locals,
            });
        }

        let (pops, pushes) = insn.op.stack_effect();
        if depth < pops {
            return Err(UnitError::StackUnderflow { pc: insn.pc });
        }
        let after = u32::from(depth - pops) + u32::from(pushes);
        let after = u16::try_from(after).map_err(|_| UnitError::StackTooDeep { pc: insn.pc })?;
        max_stack = max_stack.max(depth).max(after);

        if let Some(&target) = insn.op.target() {
            merge(&mut depth_at, &mut worklist, code, index(target)?, after)?;
        }

        if insn.op.falls_through() {
            if idx + 1 == code.len() {
                return Err(UnitError::FallsOffEnd { pc: insn.pc });
            }
            merge(&mut depth_at, &mut worklist, code, idx + 1, after)?;
        }

        for handler in &method.handlers {
            if handler.start <= insn.pc && insn.pc < handler.end {
                max_stack = max_stack.max(1);
                merge(&mut depth_at, &mut worklist, code, index(handler.target)?, 1)?;
            }
        }
    }

    let frames = frame_pcs
        .into_iter()
        .filter_map(|pc| {
            let idx = method.index_of(pc)?;
            depth_at[idx].map(|depth| Frame { pc, depth })
        })
        .collect();

    Ok(StackSummary { max_stack, frames })
}

fn merge(
    depth_at: &mut [Option<u16>],
    worklist: &mut Vec<usize>,
    code: &[Instruction],
    idx: usize,
    depth: u16,
) -> Result<(), UnitError> {
    match depth_at[idx] {
        None => {
            depth_at[idx] = Some(depth);
            worklist.push(idx);
            Ok(())
        }
        Some(existing) if existing == depth => Ok(()),
        Some(existing) => Err(UnitError::DepthMismatch {
            pc: code[idx].pc,
            expected: existing,
            found: depth,
        }),
    }
}
