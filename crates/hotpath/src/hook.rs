//! Load-time hook: the seam between a host loading units and the injector.

use crate::filter::{Decision, InclusionFilter};
use crate::inject::Pipeline;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

/// Called by a host for every unit it loads.
///
/// `None` means "load the original bytes". Implementations must be callable
/// from many loader threads at once and must never fail the load.
pub trait UnitTransformer: Send + Sync {
    fn transform(&self, unit_id: Option<&str>, bytes: &[u8]) -> Option<Vec<u8>>;
}

/// Filters units and injects line probes into the ones that pass.
#[derive(Debug)]
pub struct LineProbeTransformer {
    filter: InclusionFilter,
    pipeline: Pipeline,
    verbose: bool,
}

impl LineProbeTransformer {
    pub fn new(filter: InclusionFilter, verbose: bool) -> Self {
        LineProbeTransformer {
            filter,
            pipeline: Pipeline::default(),
            verbose,
        }
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn filter(&self) -> &InclusionFilter {
        &self.filter
    }
}

impl UnitTransformer for LineProbeTransformer {
    fn transform(&self, unit_id: Option<&str>, bytes: &[u8]) -> Option<Vec<u8>> {
        let unit_id = unit_id?;

        let decision = self.filter.decide(unit_id);
        if decision != Decision::Instrument {
            debug!(unit = unit_id, reason = decision.reason(), "Skipped");
            return None;
        }

        if self.verbose {
            debug!(unit = unit_id, "Instrumenting");
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.pipeline.rewrite(bytes, unit_id)
        }));

        match outcome {
            Ok(Ok((rewritten, stats))) => {
                debug!(
                    unit = unit_id,
                    methods = stats.methods,
                    probes = stats.probes,
                    "Instrumented"
                );
                Some(rewritten)
            }
            Ok(Err(e)) => {
                if self.verbose {
                    warn!(unit = unit_id, error = %e, "Instrumentation failed, loading original");
                } else {
                    debug!(unit = unit_id, error = %e, "Instrumentation failed, loading original");
                }
                None
            }
            Err(_) => {
                warn!(unit = unit_id, "Instrumentation panicked, loading original");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inject::{Stage, UnitContext};
    use crate::unit::{Const, MethodBuilder, MethodEvents, Op, UnitBuilder};

    fn transformer() -> LineProbeTransformer {
        LineProbeTransformer::new(
            InclusionFilter::new(vec!["com/app".into()], vec!["com/app/ignored".into()]),
            false,
        )
    }

    fn unit_bytes(name: &str) -> Vec<u8> {
        let mut m = MethodBuilder::new("run", 0);
        m.line_here(1).op(Op::Push(Const::Int(1))).op(Op::Return);
        UnitBuilder::new(name).method(m).build_bytes().unwrap()
    }

    #[test]
    fn test_missing_id_passes_through() {
        assert!(transformer().transform(None, &[]).is_none());
    }

    #[test]
    fn test_filtered_units_pass_through() {
        let t = transformer();
        for name in [
            "java/lang/String",
            "jdk/internal/Foo",
            "com/app/ignored/Secret",
            "org/other/App",
            "io/micronaut/Context",
            "org/slf4j/Logger",
        ] {
            assert!(t.transform(Some(name), &unit_bytes(name)).is_none(), "{name}");
        }
    }

    #[test]
    fn test_garbage_passes_through() {
        assert!(transformer().transform(Some("com/app/Logic"), &[1, 2, 3]).is_none());
    }

    #[test]
    fn test_included_unit_is_rewritten() {
        let bytes = unit_bytes("com/app/Logic");
        let out = transformer().transform(Some("com/app/Logic"), &bytes).unwrap();
        assert_ne!(out, bytes);
    }

    struct Explodes;

    impl Stage for Explodes {
        fn name(&self) -> &'static str {
            "explodes"
        }

        fn apply(&self, _: &UnitContext, _: &mut MethodEvents) -> usize {
            panic!("stage failure")
        }
    }

    #[test]
    fn test_panicking_stage_passes_through() {
        let t = transformer().with_pipeline(Pipeline::new().stage(Explodes));
        assert!(t.transform(Some("com/app/Logic"), &unit_bytes("com/app/Logic")).is_none());
    }
}
