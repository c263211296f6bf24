use crate::error::{Error, Result};
use crate::host;
use crate::inject::Pipeline;
use crate::unit;
use std::fs;
use std::path::Path;

/// Offline rewrite. Unlike the load-time hook, any failure is reported.
pub fn run(input: &Path, output: &Path, id: Option<&str>) -> Result<()> {
    let bytes = fs::read(input)?;
    let id = match id {
        Some(id) => unit::internal(id),
        None => unit::peek_name(&bytes)?,
    };

    let (rewritten, stats) = Pipeline::default().rewrite(&bytes, &id)?;

    // The result must load in a verifying host.
    let check = unit::decode(&rewritten)?;
    host::verify(&check).map_err(|e| Error::Instrumentation {
        unit: id.clone(),
        reason: e.to_string(),
    })?;

    fs::write(output, &rewritten)?;
    eprintln!(
        "Instrumented {}: {} methods, {} probes ({} -> {} bytes)",
        id,
        stats.methods,
        stats.probes,
        bytes.len(),
        rewritten.len()
    );
    Ok(())
}
