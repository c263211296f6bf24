//! Source roots: discovery, project labels and source text lookup.

use super::payload::UNKNOWN_PROJECT;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRoot {
    /// Canonical directory.
    pub path: PathBuf,
    /// Derived from the path as configured, not the canonical one.
    pub project: String,
}

/// Keep existing directories only, de-duplicated by canonical path in first
/// occurrence order.
pub fn source_roots(paths: &[PathBuf]) -> Vec<SourceRoot> {
    let mut seen = HashSet::new();
    let mut roots = Vec::new();
    for path in paths {
        if !path.is_dir() {
            debug!(path = %path.display(), "Skipping missing source root");
            continue;
        }
        let Ok(canonical) = fs::canonicalize(path) else {
            continue;
        };
        if seen.insert(canonical.clone()) {
            let configured: PathBuf = path.components().collect();
            let project = project_label(&configured);
            roots.push(SourceRoot {
                path: canonical,
                project,
            });
        }
    }
    roots
}

/// Name the project a root belongs to: the segment before `src`, else the
/// segment before `target`, else the last non-blank segment.
pub fn project_label(path: &Path) -> String {
    let text = path.to_string_lossy();
    let segments: Vec<&str> = text.split(['/', '\\']).collect();

    for marker in ["src", "target"] {
        if let Some(i) = segments.iter().position(|s| *s == marker)
            && i > 0
        {
            return segments[i - 1].to_string();
        }
    }

    segments
        .iter()
        .rev()
        .find(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| UNKNOWN_PROJECT.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub content: String,
    pub project: String,
    /// Canonical file the content came from.
    pub file: Option<PathBuf>,
}

pub fn missing_placeholder(relative: &str) -> String {
    format!("// Source file not found: {relative}")
}

/// Find the text for `relative` (e.g. `com/app/Main.java`) whose simple file
/// name is `file_name`. Roots are tried in order: the direct path first, then
/// a sorted walk for the file name anywhere below the root.
pub fn resolve(roots: &[SourceRoot], relative: &str, file_name: &str) -> ResolvedSource {
    for root in roots {
        let direct = root.path.join(relative);
        if direct.is_file() {
            match fs::read_to_string(&direct) {
                Ok(content) => return found(root, content, &direct),
                Err(e) => {
                    debug!(path = %direct.display(), error = %e, "Unreadable source");
                    continue;
                }
            }
        }

        let hit = WalkDir::new(&root.path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .find(|entry| entry.file_type().is_file() && entry.file_name() == file_name);
        if let Some(entry) = hit {
            match fs::read_to_string(entry.path()) {
                Ok(content) => return found(root, content, entry.path()),
                Err(e) => debug!(path = %entry.path().display(), error = %e, "Unreadable source"),
            }
        }
    }

    ResolvedSource {
        content: missing_placeholder(relative),
        project: roots
            .first()
            .map(|r| r.project.clone())
            .unwrap_or_else(|| UNKNOWN_PROJECT.to_string()),
        file: None,
    }
}

fn found(root: &SourceRoot, content: String, file: &Path) -> ResolvedSource {
    ResolvedSource {
        content,
        project: root.project.clone(),
        file: fs::canonicalize(file).ok(),
    }
}

/// The most specific root containing `file`.
pub fn owning_root<'a>(roots: &'a [SourceRoot], file: &Path) -> Option<&'a SourceRoot> {
    roots
        .iter()
        .filter(|root| file.starts_with(&root.path))
        .max_by_key(|root| root.path.components().count())
}

/// A source file found by walking a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedSource {
    /// Relative to the root, `/`-separated.
    pub relative: String,
    pub file: PathBuf,
}

/// Every `*.<extension>` file under `root`, in sorted order.
pub fn walk_sources(root: &SourceRoot, extension: &str) -> Vec<WalkedSource> {
    WalkDir::new(&root.path)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == extension))
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(&root.path).ok()?;
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            Some(WalkedSource {
                relative,
                file: entry.into_path(),
            })
        })
        .collect()
}
