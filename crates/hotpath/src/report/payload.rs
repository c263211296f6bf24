//! Persisted report payload.
//!
//! The JSON shape is shared with the browser app:
//! `{ "generatedAt": <ms>, "files": [ { "path", "counts", "content", "project" } ] }`.
//! Older data files hold only the bare `files` array; both shapes are read.

use crate::error::{Error, Result};
use hotpath_counter::LineCounts;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

pub const UNKNOWN_PROJECT: &str = "unknown";

/// One source file as shown in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Relative, `/`-separated, with the source extension.
    pub path: String,
    #[serde(default)]
    pub counts: LineCounts,
    #[serde(default)]
    pub content: String,
    #[serde(default = "unknown_project", deserialize_with = "project_or_unknown")]
    pub project: String,
}

impl FileRecord {
    pub fn new(path: String, counts: LineCounts, content: String, project: String) -> Self {
        let project = if project.trim().is_empty() {
            UNKNOWN_PROJECT.to_string()
        } else {
            project
        };
        FileRecord {
            path,
            counts,
            content,
            project,
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPayload {
    /// Epoch milliseconds.
    pub generated_at: i64,
    pub files: Vec<FileRecord>,
}

impl ReportPayload {
    pub fn new(generated_at: i64, files: Vec<FileRecord>) -> Self {
        ReportPayload {
            generated_at,
            files,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse either stored shape. A missing or non-positive timestamp
    /// becomes `now`.
    pub fn from_json(raw: &str, now: i64) -> Result<Self> {
        // Shape is decided on the parsed tree: integer map keys in `counts`
        // do not survive serde's buffered untagged matching.
        let tree: serde_json::Value = serde_json::from_str(raw)?;
        if tree.is_array() {
            return Ok(ReportPayload {
                generated_at: now,
                files: serde_json::from_value(tree)?,
            });
        }
        let doc: PayloadDoc = serde_json::from_value(tree)?;
        Ok(ReportPayload {
            generated_at: doc.generated_at.filter(|&t| t > 0).unwrap_or(now),
            files: doc.files,
        })
    }

    pub fn read(path: &Path, now: i64) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::DataNotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw, now)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadDoc {
    #[serde(default)]
    generated_at: Option<i64>,
    #[serde(default)]
    files: Vec<FileRecord>,
}

fn unknown_project() -> String {
    UNKNOWN_PROJECT.to_string()
}

fn project_or_unknown<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    let project = Option::<String>::deserialize(deserializer)?;
    Ok(project
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(unknown_project))
}
