use crate::error::Result;
use crate::host;
use crate::unit::{self, CodeUnit, Method, Op};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use hotpath_counter::{PROBE_METHOD, PROBE_OWNER};
use std::path::Path;

pub fn run(path: &Path) -> Result<()> {
    let bytes = std::fs::read(path)?;
    let unit = unit::decode(&bytes)?;
    print_unit(path, &unit);
    Ok(())
}

fn print_unit(path: &Path, unit: &CodeUnit) {
    println!("# {}", path.display());
    println!(
        "# Unit: {} | Source: {} | Methods: {}",
        unit.name,
        unit.source.as_deref().unwrap_or("-"),
        unit.methods.len()
    );
    match host::verify(unit) {
        Ok(()) => println!("# Metadata: verified"),
        Err(e) => println!("# Metadata: {e}"),
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "METHOD", "PARAMS", "LOCALS", "STACK", "BYTES", "PROBES", "LINES", "HANDLERS",
            "FRAMES",
        ]);

    for method in &unit.methods {
        table.add_row(vec![
            method.name.clone(),
            method.params.to_string(),
            method.max_locals.to_string(),
            method.max_stack.to_string(),
            method.code_len().to_string(),
            probe_count(method).to_string(),
            format_lines(method),
            format_handlers(method),
            format_frames(method),
        ]);
    }

    println!("{table}");
}

fn probe_count(method: &Method) -> usize {
    method
        .code
        .iter()
        .filter(|insn| {
            matches!(&insn.op, Op::Invoke { owner, name, .. }
                if owner == PROBE_OWNER && name == PROBE_METHOD)
        })
        .count()
}

// line@pc
fn format_lines(method: &Method) -> String {
    method
        .lines
        .iter()
        .map(|e| format!("{}@{}", e.line, e.start))
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_handlers(method: &Method) -> String {
    method
        .handlers
        .iter()
        .map(|h| format!("[{},{})->{}", h.start, h.end, h.target))
        .collect::<Vec<_>>()
        .join(" ")
}

// pc:depth
fn format_frames(method: &Method) -> String {
    method
        .frames
        .iter()
        .map(|f| format!("{}:{}", f.pc, f.depth))
        .collect::<Vec<_>>()
        .join(" ")
}
