use crate::error::Result;
use crate::report::{self, ReportPaths};
use std::path::Path;

/// Rebuild the page and app script from a persisted data file.
pub fn run(data: &Path, output: &Path) -> Result<()> {
    let payload = report::regenerate(data, output)?;
    eprintln!(
        "Report written to: {} ({} files)",
        ReportPaths::new(output).html.display(),
        payload.files.len()
    );
    Ok(())
}
