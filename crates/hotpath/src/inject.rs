//! Probe injection.
//!
//! A unit is decoded, each method is lifted into its event stream, the
//! pipeline stages rewrite the stream in order, and the result is lowered and
//! re-encoded. Lowering recomputes `max_stack` and the frame table, so stages
//! only ever deal in labels.

use crate::error::{Error, Result};
use crate::unit::{self, CodeUnit, Const, Event, MethodEvents, Op};
use hotpath_counter::{PROBE_ARITY, PROBE_METHOD, PROBE_OWNER};
use tracing::trace;

/// What a stage knows about the unit being rewritten.
#[derive(Debug, Clone)]
pub struct UnitContext {
    /// Internal `/` form, as the host reported it.
    pub internal: String,
    /// Dotted form recorded by probes.
    pub dotted: String,
}

impl UnitContext {
    pub fn new(unit_id: &str) -> Self {
        UnitContext {
            internal: unit_id.to_string(),
            dotted: unit::dotted(unit_id),
        }
    }
}

/// One rewrite over a method's event stream.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the number of probes inserted.
    fn apply(&self, ctx: &UnitContext, method: &mut MethodEvents) -> usize;
}

/// Inserts `record(<dotted id>, <line>)` ahead of every line marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineProbe;

impl LineProbe {
    pub fn probe(id: &str, line: u32) -> [Op<unit::Label>; 3] {
        [
            Op::Push(Const::Str(id.to_string())),
            Op::Push(Const::Int(i64::from(line))),
            Op::Invoke {
                owner: PROBE_OWNER.to_string(),
                name: PROBE_METHOD.to_string(),
                argc: PROBE_ARITY,
                returns: false,
            },
        ]
    }
}

impl Stage for LineProbe {
    fn name(&self) -> &'static str {
        "line-probe"
    }

    fn apply(&self, ctx: &UnitContext, method: &mut MethodEvents) -> usize {
        let markers = method.line_markers();
        if markers == 0 {
            return 0;
        }

        let mut out = Vec::with_capacity(method.events.len() + markers * 3);
        for event in method.events.drain(..) {
            if let Event::Line { line, .. } = event {
                out.extend(Self::probe(&ctx.dotted, line).into_iter().map(Event::Insn));
            }
            out.push(event);
        }
        method.events = out;
        markers
    }
}

/// Ordered list of stages applied to every method of a unit.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline::new().stage(LineProbe)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|s| s.name()))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InjectionStats {
    pub methods: usize,
    pub probes: usize,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline { stages: Vec::new() }
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn rewrite_unit(
        &self,
        unit: &CodeUnit,
        ctx: &UnitContext,
    ) -> Result<(CodeUnit, InjectionStats)> {
        let mut stats = InjectionStats::default();
        let mut methods = Vec::with_capacity(unit.methods.len());

        for method in &unit.methods {
            let mut events = unit::lift(method)?;
            for stage in &self.stages {
                let inserted = stage.apply(ctx, &mut events);
                trace!(
                    unit = %ctx.internal,
                    method = %method.name,
                    stage = stage.name(),
                    inserted,
                    "Applied stage"
                );
                stats.probes += inserted;
            }
            let lowered = unit::lower(&events).map_err(|e| Error::Instrumentation {
                unit: ctx.internal.clone(),
                reason: format!("{}: {e}", method.name),
            })?;
            methods.push(lowered);
            stats.methods += 1;
        }

        Ok((
            CodeUnit {
                name: unit.name.clone(),
                source: unit.source.clone(),
                methods,
            },
            stats,
        ))
    }

    pub fn rewrite(&self, bytes: &[u8], unit_id: &str) -> Result<(Vec<u8>, InjectionStats)> {
        let unit = unit::decode(bytes)?;
        let (rewritten, stats) = self.rewrite_unit(&unit, &UnitContext::new(unit_id))?;
        Ok((unit::encode(&rewritten)?, stats))
    }
}

/// Rewrite `bytes` with the default line-probe pipeline.
pub fn instrument(bytes: &[u8], unit_id: &str) -> Result<Vec<u8>> {
    Pipeline::default().rewrite(bytes, unit_id).map(|(out, _)| out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Frame, MethodBuilder, UnitBuilder, decode};

    fn branchy_unit() -> Vec<u8> {
        // static int pick(int x) { if (x == 0) return 1; return 2; }
        let mut pick = MethodBuilder::new("pick", 1);
        let other = pick.new_label();
        pick.line_here(3).op(Op::Load(0)).op(Op::IfNonZero(other));
        pick.line_here(4).op(Op::Push(Const::Int(1))).op(Op::Return);
        pick.label(other)
            .line(5, other)
            .op(Op::Push(Const::Int(2)))
            .op(Op::Return);
        UnitBuilder::new("com/app/Pick")
            .source("Pick.java")
            .method(pick)
            .build_bytes()
            .unwrap()
    }

    #[test]
    fn test_probe_precedes_each_line() {
        let out = instrument(&branchy_unit(), "com/app/Pick").unwrap();
        let unit = decode(&out).unwrap();
        let method = unit.method("pick").unwrap();

        for entry in &method.lines {
            let idx = method.index_of(entry.start).unwrap();
            let ops: Vec<_> = method.code[idx..idx + 3].iter().map(|i| &i.op).collect();
            assert_eq!(ops[0], &Op::Push(Const::Str("com.app.Pick".into())));
            assert_eq!(ops[1], &Op::Push(Const::Int(i64::from(entry.line))));
            assert!(matches!(ops[2], Op::Invoke { argc: 2, returns: false, .. }));
        }
    }

    #[test]
    fn test_metadata_is_recomputed() {
        let original = decode(&branchy_unit()).unwrap();
        let out = decode(&instrument(&branchy_unit(), "com/app/Pick").unwrap()).unwrap();
        let before = original.method("pick").unwrap();
        let after = out.method("pick").unwrap();

        assert_eq!(before.max_stack, 1);
        assert_eq!(after.max_stack, 2);
        assert_eq!(after.max_locals, before.max_locals);
        // Two 13-byte probes now sit ahead of the branch target.
        assert_eq!(before.frames, vec![Frame { pc: 12, depth: 0 }]);
        assert_eq!(after.frames, vec![Frame { pc: 38, depth: 0 }]);
    }

    #[test]
    fn test_stats_count_methods_and_probes() {
        let (_, stats) = Pipeline::default()
            .rewrite(&branchy_unit(), "com/app/Pick")
            .unwrap();
        assert_eq!(stats, InjectionStats { methods: 1, probes: 3 });
    }

    #[test]
    fn test_empty_pipeline_is_identity() {
        let bytes = branchy_unit();
        let (out, stats) = Pipeline::new().rewrite(&bytes, "com/app/Pick").unwrap();
        assert_eq!(out, bytes);
        assert_eq!(stats.probes, 0);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(matches!(
            instrument(&[1, 2, 3], "com/app/Logic"),
            Err(Error::Unit(_))
        ));
    }
}
