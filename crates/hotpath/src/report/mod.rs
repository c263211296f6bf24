//! Report aggregation.
//!
//! Turns a counter snapshot into one record per source file: nested units
//! are folded into their enclosing unit, source text is looked up across the
//! configured roots, and files nobody executed are listed with empty counts.

pub mod payload;
pub mod sources;
pub mod writer;

pub use payload::{FileRecord, ReportPayload, UNKNOWN_PROJECT};
pub use sources::{SourceRoot, project_label, source_roots};
pub use writer::{ReportPaths, regenerate};

use crate::config::{AgentConfig, DEFAULT_EXTENSION};
use crate::error::Result;
use crate::unit::NESTING_SEPARATOR;
use hotpath_counter::{CounterStore, LineCounts, Snapshot};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Inputs to aggregation besides the counts themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOptions {
    pub source_roots: Vec<PathBuf>,
    pub extension: String,
}

impl Default for ReportOptions {
    fn default() -> Self {
        ReportOptions {
            source_roots: Vec::new(),
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }
}

impl From<&AgentConfig> for ReportOptions {
    fn from(config: &AgentConfig) -> Self {
        ReportOptions {
            source_roots: config.source_roots.clone(),
            extension: config.extension.clone(),
        }
    }
}

/// The enclosing unit of a possibly nested one: `a.B$C$1` -> `a.B`.
pub fn merge_group(unit: &str) -> &str {
    unit.split_once(NESTING_SEPARATOR)
        .map_or(unit, |(outer, _)| outer)
}

/// Fold nested units into their enclosing unit, summing shared lines.
pub fn merge_groups(snapshot: &Snapshot) -> BTreeMap<String, LineCounts> {
    let mut groups: BTreeMap<String, LineCounts> = BTreeMap::new();
    for (unit, lines) in snapshot {
        let merged = groups.entry(merge_group(unit).to_string()).or_default();
        for (&line, &count) in lines {
            *merged.entry(line).or_insert(0) += count;
        }
    }
    groups
}

/// `a.b.Main` -> `a/b/Main.<extension>`
pub fn relative_path(group: &str, extension: &str) -> String {
    format!("{}.{extension}", group.replace('.', "/"))
}

fn simple_name(group: &str) -> &str {
    group.rsplit_once('.').map_or(group, |(_, name)| name)
}

/// Build the sorted file records for a snapshot.
pub fn collect(snapshot: &Snapshot, options: &ReportOptions) -> Vec<FileRecord> {
    let roots = source_roots(&options.source_roots);
    let mut consumed: HashSet<PathBuf> = HashSet::new();
    let mut records: BTreeMap<String, FileRecord> = BTreeMap::new();

    for (group, counts) in merge_groups(snapshot) {
        let relative = relative_path(&group, &options.extension);
        let file_name = format!("{}.{}", simple_name(&group), options.extension);
        let resolved = sources::resolve(&roots, &relative, &file_name);
        if let Some(file) = resolved.file {
            consumed.insert(file);
        }
        records.insert(
            relative.clone(),
            FileRecord::new(relative, counts, resolved.content, resolved.project),
        );
    }

    for root in &roots {
        for walked in sources::walk_sources(root, &options.extension) {
            // A file below a nested root is listed relative to that root.
            let nested = sources::owning_root(&roots, &walked.file)
                .is_some_and(|owner| owner.path != root.path);
            if nested || records.contains_key(&walked.relative) {
                continue;
            }
            let canonical = fs::canonicalize(&walked.file).unwrap_or(walked.file);
            if consumed.contains(&canonical) {
                continue;
            }
            match fs::read_to_string(&canonical) {
                Ok(content) => {
                    consumed.insert(canonical);
                    records.insert(
                        walked.relative.clone(),
                        FileRecord::new(
                            walked.relative,
                            LineCounts::new(),
                            content,
                            root.project.clone(),
                        ),
                    );
                }
                Err(e) => debug!(path = %canonical.display(), error = %e, "Unreadable source"),
            }
        }
    }

    records.into_values().collect()
}

/// Snapshot `store` and wrap the records with the current time.
pub fn build_payload(store: &CounterStore, options: &ReportOptions) -> ReportPayload {
    let files = collect(&store.snapshot(), options);
    ReportPayload::new(chrono::Utc::now().timestamp_millis(), files)
}

/// Snapshot, aggregate and write every report artifact next to `output`.
pub fn generate(
    store: &CounterStore,
    output: &Path,
    options: &ReportOptions,
) -> Result<ReportPayload> {
    let payload = build_payload(store, options);
    writer::write_all(&payload, &ReportPaths::new(output))?;
    Ok(payload)
}
