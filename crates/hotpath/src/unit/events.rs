//! Label-based event stream.
//!
//! Lifting replaces every pc a method refers to (branch targets, handler
//! bounds, line starts) with a symbolic [`Label`] placed in the stream, so
//! instructions can be inserted anywhere without touching offsets. Lowering
//! resolves the labels back to pcs and recomputes the stack metadata.

use super::analysis::compute_frames;
use super::{Handler, Instruction, LineEntry, Method, Op, UnitError};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Binds a label to the pc of whatever follows.
    Label(Label),
    /// Line-boundary marker: `line` starts at `start`.
    Line { line: u32, start: Label },
    Insn(Op<Label>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodEvents {
    pub name: String,
    pub params: u8,
    pub max_locals: u16,
    pub events: Vec<Event>,
    pub handlers: Vec<Handler<Label>>,
    next_label: u32,
}

impl MethodEvents {
    pub fn new(name: impl Into<String>, params: u8, max_locals: u16) -> Self {
        MethodEvents {
            name: name.into(),
            params,
            max_locals: max_locals.max(u16::from(params)),
            events: Vec::new(),
            handlers: Vec::new(),
            next_label: 0,
        }
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Number of line markers in the stream.
    pub fn line_markers(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Line { .. }))
            .count()
    }
}

/// Turn a decoded method into an event stream.
pub fn lift(method: &Method) -> Result<MethodEvents, UnitError> {
    let mut events = MethodEvents::new(method.name.clone(), method.params, method.max_locals);

    let mut referenced: Vec<u32> = method
        .code
        .iter()
        .filter_map(|insn| insn.op.target().copied())
        .collect();
    for handler in &method.handlers {
        referenced.extend([handler.start, handler.end, handler.target]);
    }
    referenced.extend(method.lines.iter().map(|entry| entry.start));
    referenced.sort_unstable();
    referenced.dedup();

    let labels: BTreeMap<u32, Label> = referenced
        .into_iter()
        .map(|pc| (pc, events.new_label()))
        .collect();

    let mut lines_at: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for entry in &method.lines {
        lines_at.entry(entry.start).or_default().push(entry.line);
    }

    let label_for = |pc: u32| {
        labels
            .get(&pc)
            .copied()
            .ok_or(UnitError::BadTarget { what: "branch", pc })
    };

    let place = |pc: u32, out: &mut Vec<Event>| {
        if let Some(&label) = labels.get(&pc) {
            out.push(Event::Label(label));
            for &line in lines_at.get(&pc).into_iter().flatten() {
                out.push(Event::Line { line, start: label });
            }
        }
    };

    let mut stream = Vec::with_capacity(method.code.len() + labels.len() * 2);
    for insn in &method.code {
        place(insn.pc, &mut stream);
        stream.push(Event::Insn(insn.op.clone().try_map_target(label_for)?));
    }
    place(method.code_len(), &mut stream);
    events.events = stream;

    events.handlers = method
        .handlers
        .iter()
        .map(|h| {
            Ok(Handler {
                start: label_for(h.start)?,
                end: label_for(h.end)?,
                target: label_for(h.target)?,
            })
        })
        .collect::<Result<_, UnitError>>()?;

    Ok(events)
}

/// Resolve labels to pcs and rebuild the line, handler and frame tables.
pub fn lower(events: &MethodEvents) -> Result<Method, UnitError> {
    let mut pcs: HashMap<Label, u32> = HashMap::new();
    let mut pc: u32 = 0;
    for event in &events.events {
        match event {
            Event::Label(label) => {
                if pcs.insert(*label, pc).is_some() {
                    return Err(UnitError::DuplicateLabel(label.0));
                }
            }
            Event::Insn(op) => {
                pc = pc.checked_add(op.encoded_len()).ok_or(UnitError::TooMany {
                    what: "code bytes",
                    limit: u32::MAX as usize,
                })?;
            }
            Event::Line { .. } => {}
        }
    }

    let resolve = |label: Label| pcs.get(&label).copied().ok_or(UnitError::UnboundLabel(label.0));

    let mut code = Vec::new();
    let mut lines = Vec::new();
    let mut pc: u32 = 0;
    for event in &events.events {
        match event {
            Event::Label(_) => {}
            Event::Line { line, start } => lines.push(LineEntry {
                start: resolve(*start)?,
                line: *line,
            }),
            Event::Insn(op) => {
                let op = op.clone().try_map_target(resolve)?;
                let len = op.encoded_len();
                code.push(Instruction { pc, op });
                pc += len;
            }
        }
    }

    let handlers = events
        .handlers
        .iter()
        .map(|h| {
            Ok(Handler {
                start: resolve(h.start)?,
                end: resolve(h.end)?,
                target: resolve(h.target)?,
            })
        })
        .collect::<Result<Vec<_>, UnitError>>()?;

    let mut method = Method {
        name: events.name.clone(),
        params: events.params,
        max_stack: 0,
        max_locals: events.max_locals,
        code,
        handlers,
        lines,
        frames: Vec::new(),
    };

    let summary = compute_frames(&method)?;
    method.max_stack = summary.max_stack;
    method.frames = summary.frames;
    Ok(method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Const, MethodBuilder};

    fn counting_loop() -> Method {
        // i = 0; while i < 3 { i = i + 1 } return i
        let mut b = MethodBuilder::new("loop", 0);
        b.locals(1);
        let head = b.new_label();
        let exit = b.new_label();
        b.line_here(10).op(Op::Push(Const::Int(0))).op(Op::Store(0));
        b.label(head)
            .line(11, head)
            .op(Op::Load(0))
            .op(Op::Push(Const::Int(3)))
            .op(Op::Lt)
            .op(Op::IfZero(exit));
        b.line_here(12)
            .op(Op::Load(0))
            .op(Op::Push(Const::Int(1)))
            .op(Op::Add)
            .op(Op::Store(0))
            .op(Op::Goto(head));
        b.label(exit).line(13, exit).op(Op::Load(0)).op(Op::Return);
        b.build().unwrap()
    }

    #[test]
    fn test_lift_then_lower_is_identity() {
        let method = counting_loop();
        let lifted = lift(&method).unwrap();
        assert_eq!(lifted.line_markers(), 4);
        assert_eq!(lower(&lifted).unwrap(), method);
    }

    #[test]
    fn test_insertion_relocates_branches_and_lines() {
        let method = counting_loop();
        let mut lifted = lift(&method).unwrap();
        lifted.events.insert(0, Event::Insn(Op::Nop));

        let moved = lower(&lifted).unwrap();
        for (before, after) in method.code.iter().zip(moved.code.iter().skip(1)) {
            assert_eq!(after.pc, before.pc + 1);
            match (before.op.target(), after.op.target()) {
                (Some(a), Some(b)) => assert_eq!(*b, *a + 1),
                (None, None) => {}
                _ => panic!("branch shape changed"),
            }
        }
        for (before, after) in method.lines.iter().zip(&moved.lines) {
            assert_eq!(after.line, before.line);
            assert_eq!(after.start, before.start + 1);
        }
    }

    #[test]
    fn test_unbound_label_fails() {
        let mut events = MethodEvents::new("broken", 0, 0);
        let nowhere = events.new_label();
        events.events.push(Event::Insn(Op::Goto(nowhere)));
        assert_eq!(lower(&events), Err(UnitError::UnboundLabel(nowhere.0)));
    }

    #[test]
    fn test_duplicate_label_fails() {
        let mut events = MethodEvents::new("broken", 0, 0);
        let here = events.new_label();
        events.events.extend([
            Event::Label(here),
            Event::Label(here),
            Event::Insn(Op::ReturnVoid),
        ]);
        assert_eq!(lower(&events), Err(UnitError::DuplicateLabel(here.0)));
    }
}
