//! Units rewritten by the load-time hook must still load in a verifying host,
//! behave exactly as before, and count every executed line.

use hotpath::filter::InclusionFilter;
use hotpath::host::{Host, Value};
use hotpath::inject::{LineProbe, Stage, UnitContext};
use hotpath::unit::{self, Const, MethodBuilder, Op, UnitBuilder};
use hotpath::{CounterStore, Error, LineProbeTransformer, UnitTransformer};
use std::sync::Arc;
use std::thread;

const UNIT: &str = "com/app/Sample";
const ID: &str = "com.app.Sample";

fn sample_unit() -> Vec<u8> {
    // Sample() { total = 0; }
    let mut init = MethodBuilder::new("<init>", 0);
    init.locals(1);
    init.line_here(3)
        .op(Op::Push(Const::Int(0)))
        .op(Op::Store(0))
        .op(Op::ReturnVoid);

    // int count() { i = 0; while (i < 3) { i = i + 1; } return i; }
    let mut count = MethodBuilder::new("count", 0);
    count.locals(1);
    let head = count.new_label();
    let exit = count.new_label();
    count
        .line_here(10)
        .op(Op::Push(Const::Int(0)))
        .op(Op::Store(0));
    count
        .label(head)
        .line(11, head)
        .op(Op::Load(0))
        .op(Op::Push(Const::Int(3)))
        .op(Op::Lt)
        .op(Op::IfZero(exit));
    count
        .line_here(12)
        .op(Op::Load(0))
        .op(Op::Push(Const::Int(1)))
        .op(Op::Add)
        .op(Op::Store(0))
        .op(Op::Goto(head));
    count.label(exit).line(13, exit).op(Op::Load(0)).op(Op::Return);

    // int pick(int x) { if (x == 0) return 1; return 2; }
    let mut pick = MethodBuilder::new("pick", 1);
    let other = pick.new_label();
    pick.line_here(20).op(Op::Load(0)).op(Op::IfNonZero(other));
    pick.line_here(21).op(Op::Push(Const::Int(1))).op(Op::Return);
    pick.label(other)
        .line(22, other)
        .op(Op::Push(Const::Int(2)))
        .op(Op::Return);

    // int guarded() { try { throw "boom"; } catch { return 7; } }
    let mut guarded = MethodBuilder::new("guarded", 0);
    let start = guarded.new_label();
    let end = guarded.new_label();
    let catch = guarded.new_label();
    guarded
        .label(start)
        .line(30, start)
        .op(Op::Push(Const::Str("boom".into())))
        .op(Op::Throw);
    guarded.label(end);
    guarded
        .label(catch)
        .line(31, catch)
        .op(Op::Pop)
        .op(Op::Push(Const::Int(7)))
        .op(Op::Return);
    guarded.handler(start, end, catch);

    UnitBuilder::new(UNIT)
        .source("Sample.java")
        .method(init)
        .method(count)
        .method(pick)
        .method(guarded)
        .build_bytes()
        .unwrap()
}

fn instrumenting_host(include: &[&str]) -> Host {
    let filter = InclusionFilter::new(include.iter().map(|s| s.to_string()).collect(), vec![]);
    Host::new(Arc::new(CounterStore::new()))
        .with_transformer(Arc::new(LineProbeTransformer::new(filter, true)))
}

#[test]
fn test_every_executed_line_counts_once_per_execution() {
    let host = instrumenting_host(&["com/app"]);
    let outcome = host.load(&sample_unit()).unwrap();
    assert!(outcome.instrumented);

    assert_eq!(host.invoke(UNIT, "<init>", &[]).unwrap(), None);
    assert_eq!(host.invoke(UNIT, "count", &[]).unwrap(), Some(Value::Int(3)));
    assert_eq!(
        host.invoke(UNIT, "pick", &[Value::Int(0)]).unwrap(),
        Some(Value::Int(1))
    );
    assert_eq!(
        host.invoke(UNIT, "pick", &[Value::Int(5)]).unwrap(),
        Some(Value::Int(2))
    );
    assert_eq!(host.invoke(UNIT, "guarded", &[]).unwrap(), Some(Value::Int(7)));

    let store = host.store();
    assert_eq!(store.get(ID, 3), 1);
    assert_eq!(store.get(ID, 10), 1);
    assert_eq!(store.get(ID, 11), 4);
    assert_eq!(store.get(ID, 12), 3);
    assert_eq!(store.get(ID, 13), 1);
    assert_eq!(store.get(ID, 20), 2);
    assert_eq!(store.get(ID, 21), 1);
    assert_eq!(store.get(ID, 22), 1);
    assert_eq!(store.get(ID, 30), 1);
    assert_eq!(store.get(ID, 31), 1);
    assert_eq!(store.unit_count(), 1);
}

#[test]
fn test_behaviour_matches_uninstrumented_code() {
    let plain = Host::new(Arc::new(CounterStore::new()));
    let probed = instrumenting_host(&[]);
    plain.load(&sample_unit()).unwrap();
    probed.load(&sample_unit()).unwrap();

    for (method, args) in [
        ("count", vec![]),
        ("pick", vec![Value::Int(0)]),
        ("pick", vec![Value::Int(-4)]),
        ("guarded", vec![]),
    ] {
        assert_eq!(
            plain.invoke(UNIT, method, &args).unwrap(),
            probed.invoke(UNIT, method, &args).unwrap(),
            "{method}"
        );
    }
    assert!(plain.store().is_empty());
    assert!(!probed.store().is_empty());
}

#[test]
fn test_excluded_units_load_untouched() {
    let host = instrumenting_host(&["org/other"]);
    let outcome = host.load(&sample_unit()).unwrap();
    assert!(!outcome.instrumented);
    host.invoke(UNIT, "count", &[]).unwrap();
    assert!(host.store().is_empty());
}

/// Insert probes into every method, then let `tamper` put back some of the
/// metadata the original unit declared.
fn injected_with(tamper: impl Fn(&mut unit::Method, &unit::Method)) -> Vec<u8> {
    let original = unit::decode(&sample_unit()).unwrap();
    let ctx = UnitContext::new(UNIT);
    let mut rewritten = original.clone();
    for (method, before) in rewritten.methods.iter_mut().zip(&original.methods) {
        let mut events = unit::lift(before).unwrap();
        LineProbe.apply(&ctx, &mut events);
        *method = unit::lower(&events).unwrap();
        tamper(method, before);
    }
    unit::encode(&rewritten).unwrap()
}

#[test]
fn test_injection_keeping_stale_max_stack_is_rejected() {
    let bytes = injected_with(|method, before| method.max_stack = before.max_stack);
    // The bytes are well formed; only the verifier objects.
    unit::decode(&bytes).unwrap();

    let host = Host::new(Arc::new(CounterStore::new()));
    assert!(matches!(
        host.load(&bytes),
        Err(Error::Verification { reason, .. }) if reason.contains("max_stack")
    ));
}

#[test]
fn test_injection_without_a_frame_table_is_rejected() {
    let bytes = injected_with(|method, _| method.frames.clear());
    unit::decode(&bytes).unwrap();

    let host = Host::new(Arc::new(CounterStore::new()));
    assert!(matches!(
        host.load(&bytes),
        Err(Error::Verification { reason, .. }) if reason.contains("frame table")
    ));
}

#[test]
fn test_recomputed_injection_is_accepted() {
    let bytes = injected_with(|_, _| {});
    let host = Host::new(Arc::new(CounterStore::new()));
    host.load(&bytes).unwrap();
    assert_eq!(host.invoke(UNIT, "count", &[]).unwrap(), Some(Value::Int(3)));
    assert_eq!(host.store().get(ID, 12), 3);
}

#[test]
fn test_malformed_bytes_pass_through_the_hook() {
    let hook = LineProbeTransformer::new(InclusionFilter::default(), false);
    assert!(hook.transform(Some("com/app/Logic"), &[1, 2, 3]).is_none());

    let mut truncated = sample_unit();
    truncated.truncate(truncated.len() / 2);
    assert!(hook.transform(Some(UNIT), &truncated).is_none());

    let host = instrumenting_host(&[]);
    assert!(matches!(host.load(&[1, 2, 3]), Err(Error::Unit(_))));
}

#[test]
fn test_concurrent_loading_and_execution_count_exactly() {
    const THREADS: usize = 8;
    const CALLS: usize = 50;

    let units: Vec<Vec<u8>> = (0..16)
        .map(|i| {
            let mut m = MethodBuilder::new("run", 0);
            m.line_here(1).op(Op::Push(Const::Int(i))).op(Op::Return);
            UnitBuilder::new(format!("com/app/gen/U{i}"))
                .method(m)
                .build_bytes()
                .unwrap()
        })
        .chain(std::iter::once(sample_unit()))
        .collect();

    let host = instrumenting_host(&["com/app"]);
    let outcomes = host.load_all(&units).unwrap();
    assert!(outcomes.iter().all(|o| o.instrumented));

    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..CALLS {
                    host.invoke(UNIT, "count", &[]).unwrap();
                    host.invoke("com/app/gen/U3", "run", &[]).unwrap();
                }
            });
        }
    });

    let total = (THREADS * CALLS) as u64;
    assert_eq!(host.store().get(ID, 11), total * 4);
    assert_eq!(host.store().get(ID, 12), total * 3);
    assert_eq!(host.store().get("com.app.gen.U3", 1), total);
    assert_eq!(host.store().get("com.app.gen.U4", 1), 0);
}
