//! Report artifacts on disk.

use super::payload::ReportPayload;
use crate::config::DEFAULT_OUTPUT;
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const TEMPLATE: &str = include_str!("../../assets/report-template.html");
const APP_SCRIPT: &str = include_str!("../../assets/report-app.js");

pub const APP_SCRIPT_NAME: &str = "report-app.js";

const DATA_MARKER: &str = "/*DATA_MARKER*/ []";
const GENERATED_AT_MARKER: &str = "/*GENERATED_AT*/ 0";
const JSON_FILE_MARKER: &str = "/*JSON_FILE*/";
const JSONP_FILE_MARKER: &str = "/*JSONP_FILE*/";

/// Where each artifact of one report lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    pub html: PathBuf,
    pub dir: PathBuf,
    pub json: PathBuf,
    pub jsonp: PathBuf,
    pub json_name: String,
    pub jsonp_name: String,
}

impl ReportPaths {
    /// Derive sibling artifact paths from the HTML output path. The base name
    /// is the file name without a trailing `.html`.
    pub fn new(output: &Path) -> Self {
        let html = if output.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_OUTPUT)
        } else {
            output.to_path_buf()
        };
        let file_name = html
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_OUTPUT.to_string());
        let base = file_name.strip_suffix(".html").unwrap_or(&file_name);
        let dir = match html.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let json_name = format!("{base}.json");
        let jsonp_name = format!("{base}.js");
        ReportPaths {
            json: dir.join(&json_name),
            jsonp: dir.join(&jsonp_name),
            html,
            dir,
            json_name,
            jsonp_name,
        }
    }

    pub fn app_script(&self) -> PathBuf {
        self.dir.join(APP_SCRIPT_NAME)
    }
}

pub fn jsonp(json: &str) -> String {
    format!("window.loadExecutionData && window.loadExecutionData({json});")
}

/// Fill the page template. `</` inside the data is escaped so embedded
/// source text cannot close the surrounding script element. The data goes in
/// last so marker text inside source files is left alone.
pub fn render_html(payload: &ReportPayload, paths: &ReportPaths) -> Result<String> {
    let json = payload.to_json()?.replace("</", "<\\/");
    Ok(TEMPLATE
        .replace(GENERATED_AT_MARKER, &payload.generated_at.to_string())
        .replace(JSON_FILE_MARKER, &paths.json_name)
        .replace(JSONP_FILE_MARKER, &paths.jsonp_name)
        .replace(DATA_MARKER, &json))
}

/// Write the page and the app script.
pub fn render(payload: &ReportPayload, paths: &ReportPaths) -> Result<()> {
    fs::create_dir_all(&paths.dir)?;
    fs::write(&paths.html, render_html(payload, paths)?)?;
    fs::write(paths.app_script(), APP_SCRIPT)?;
    info!(path = %paths.html.display(), files = payload.files.len(), "Report written");
    Ok(())
}

/// Write all four artifacts.
pub fn write_all(payload: &ReportPayload, paths: &ReportPaths) -> Result<()> {
    let json = payload.to_json()?;
    fs::create_dir_all(&paths.dir)?;
    fs::write(&paths.json, &json)?;
    fs::write(&paths.jsonp, jsonp(&json))?;
    render(payload, paths)
}

/// Re-render the page from a persisted data file. Only the HTML page and the
/// app script are rewritten.
pub fn regenerate(data: &Path, output: &Path) -> Result<ReportPayload> {
    let payload = ReportPayload::read(data, chrono::Utc::now().timestamp_millis())?;
    render(&payload, &ReportPaths::new(output))?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::FileRecord;
    use hotpath_counter::LineCounts;
    use tempfile::TempDir;

    #[test]
    fn test_paths_from_html_name() {
        let paths = ReportPaths::new(Path::new("out/run/report.html"));
        assert_eq!(paths.dir, PathBuf::from("out/run"));
        assert_eq!(paths.json, PathBuf::from("out/run/report.json"));
        assert_eq!(paths.jsonp, PathBuf::from("out/run/report.js"));
        assert_eq!(paths.app_script(), PathBuf::from("out/run/report-app.js"));
    }

    #[test]
    fn test_paths_without_directory_or_suffix() {
        let paths = ReportPaths::new(Path::new("profile"));
        assert_eq!(paths.dir, PathBuf::from("."));
        assert_eq!(paths.json_name, "profile.json");
        assert_eq!(paths.jsonp_name, "profile.js");

        let paths = ReportPaths::new(Path::new(""));
        assert_eq!(paths.html, PathBuf::from(DEFAULT_OUTPUT));
        assert_eq!(paths.json_name, "execution-report.json");
    }

    #[test]
    fn test_render_fills_every_marker() {
        let payload = ReportPayload::new(
            1234,
            vec![FileRecord::new(
                "Test.java".into(),
                LineCounts::from([(1, 1)]),
                "String s = \"</script>\";".into(),
                "demo".into(),
            )],
        );
        let html = render_html(&payload, &ReportPaths::new(Path::new("r.html"))).unwrap();
        assert!(html.contains("Test.java"));
        assert!(html.contains("1234"));
        assert!(html.contains("\"r.json\""));
        assert!(html.contains("\"r.js\""));
        assert!(html.contains("<\\/script>"));
        for marker in [DATA_MARKER, GENERATED_AT_MARKER, JSON_FILE_MARKER, JSONP_FILE_MARKER] {
            assert!(!html.contains(marker), "{marker} left in page");
        }
    }

    #[test]
    fn test_marker_text_in_sources_is_preserved() {
        let content = "/*GENERATED_AT*/ 0 and /*JSON_FILE*/ and /*JSONP_FILE*/ and /*DATA_MARKER*/ []";
        let payload = ReportPayload::new(
            1234,
            vec![FileRecord::new(
                "Odd.java".into(),
                LineCounts::new(),
                content.into(),
                "demo".into(),
            )],
        );
        let html = render_html(&payload, &ReportPaths::new(Path::new("r.html"))).unwrap();
        assert!(html.contains(content), "source text was rewritten");
        assert!(!html.contains("1234 and r.json"));
    }

    #[test]
    fn test_write_all_emits_four_artifacts() {
        let dir = TempDir::new().unwrap();
        let paths = ReportPaths::new(&dir.path().join("nested/report.html"));
        write_all(&ReportPayload::new(1, Vec::new()), &paths).unwrap();

        assert!(paths.html.is_file());
        assert!(paths.app_script().is_file());
        assert_eq!(fs::read_to_string(&paths.json).unwrap(), r#"{"generatedAt":1,"files":[]}"#);
        assert_eq!(
            fs::read_to_string(&paths.jsonp).unwrap(),
            r#"window.loadExecutionData && window.loadExecutionData({"generatedAt":1,"files":[]});"#
        );
    }

    #[test]
    fn test_regenerate_missing_data_fails() {
        let dir = TempDir::new().unwrap();
        let err = regenerate(&dir.path().join("none.json"), &dir.path().join("r.html")).unwrap_err();
        assert!(matches!(err, crate::Error::DataNotFound(_)));
    }

    #[test]
    fn test_regenerate_touches_only_page_and_script() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data.json");
        fs::write(
            &data,
            r#"{"files":[{"path":"New.java","counts":{"5":1},"content":"more code","project":"p2"}]}"#,
        )
        .unwrap();
        let output = dir.path().join("report.html");
        let payload = regenerate(&data, &output).unwrap();

        assert!(payload.generated_at > 0);
        assert!(fs::read_to_string(&output).unwrap().contains("New.java"));
        assert!(dir.path().join(APP_SCRIPT_NAME).is_file());
        assert!(!dir.path().join("report.json").exists());
        assert!(!dir.path().join("report.js").exists());
    }
}
