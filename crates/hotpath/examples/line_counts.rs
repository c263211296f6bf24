//! Builds a small unit, runs it through the agent's load-time hook and the
//! reference host, then writes a report.
//!
//!   cargo run -p hotpath --example line_counts [output.html]

use hotpath::host::{Host, Value};
use hotpath::unit::{Const, MethodBuilder, Op, UnitBuilder};
use hotpath::{Agent, AgentConfig, CounterStore};
use std::sync::Arc;

fn sums_unit() -> anyhow::Result<Vec<u8>> {
    // int sum(int n) { s = 0; while (0 < n) { s = s + n; n = n - 1; } return s; }
    let mut sum = MethodBuilder::new("sum", 1);
    sum.locals(2);
    let head = sum.new_label();
    let done = sum.new_label();
    sum.line_here(4).op(Op::Push(Const::Int(0))).op(Op::Store(1));
    sum.label(head)
        .line(5, head)
        .op(Op::Push(Const::Int(0)))
        .op(Op::Load(0))
        .op(Op::Lt)
        .op(Op::IfZero(done));
    sum.line_here(6)
        .op(Op::Load(1))
        .op(Op::Load(0))
        .op(Op::Add)
        .op(Op::Store(1));
    sum.line_here(7)
        .op(Op::Load(0))
        .op(Op::Push(Const::Int(1)))
        .op(Op::Sub)
        .op(Op::Store(0))
        .op(Op::Goto(head));
    sum.label(done).line(9, done).op(Op::Load(1)).op(Op::Return);

    Ok(UnitBuilder::new("demo/Sums")
        .source("Sums.java")
        .method(sum)
        .build_bytes()?)
}

fn main() -> anyhow::Result<()> {
    let output = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "target/line-counts.html".to_string());

    let config = AgentConfig::parse(&format!("packages=demo,output={output},keepAlive=false"));
    let store = Arc::new(CounterStore::new());
    let agent = Agent::start(config, Arc::clone(&store))?;
    let host = Host::new(Arc::clone(&store)).with_transformer(Arc::new(agent.transformer()));

    host.load(&sums_unit()?)?;
    for n in [3, 10, 100] {
        let result = host.invoke("demo/Sums", "sum", &[Value::Int(n)])?;
        println!("sum({n}) = {}", result.map(|v| v.to_string()).unwrap_or_default());
    }

    let snapshot = store.snapshot();
    for (unit, lines) in &snapshot {
        for (line, count) in lines {
            println!("{unit}:{line:<4} {count:>6}");
        }
    }

    if let Some(payload) = agent.shutdown() {
        println!("Report with {} files written to {output}", payload.files.len());
    }
    Ok(())
}
