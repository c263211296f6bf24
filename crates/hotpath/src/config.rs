//! Agent activation string.
//!
//! The activation string is a single comma-separated list of `key=value`
//! tokens. A token without `=` continues the previous value, so
//! `packages=com.a,com.b,verbose=true` yields two packages. Parsing never
//! fails: unknown keys are ignored and malformed values keep their default.

use crate::filter::InclusionFilter;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_OUTPUT: &str = "execution-report.html";
pub const DEFAULT_EXTENSION: &str = "java";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Include prefixes in internal (`/`) form.
    pub include: Vec<String>,
    /// Exclude prefixes in internal (`/`) form.
    pub exclude: Vec<String>,
    pub output: PathBuf,
    pub source_roots: Vec<PathBuf>,
    /// Zero disables the periodic flush.
    pub flush_interval: Duration,
    pub verbose: bool,
    pub keep_alive: bool,
    pub extension: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            include: Vec::new(),
            exclude: Vec::new(),
            output: PathBuf::from(DEFAULT_OUTPUT),
            source_roots: Vec::new(),
            flush_interval: Duration::ZERO,
            verbose: false,
            keep_alive: true,
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }
}

impl AgentConfig {
    pub fn parse(args: &str) -> Self {
        let mut config = AgentConfig::default();
        for (key, value) in split_pairs(args) {
            config.apply(&key, &value);
        }
        config
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "packages" => self.include.extend(package_prefixes(value)),
            "exclude" => self.exclude.extend(package_prefixes(value)),
            "output" if !value.is_empty() => self.output = PathBuf::from(value),
            "sourcepath" => {
                self.source_roots = std::env::split_paths(value)
                    .filter(|p| !p.as_os_str().is_empty())
                    .collect();
            }
            "flushInterval" => {
                // Malformed intervals disable flushing rather than guessing.
                self.flush_interval = value
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .unwrap_or(Duration::ZERO);
            }
            "verbose" => self.verbose = parse_bool(value).unwrap_or(self.verbose),
            "keepAlive" => self.keep_alive = parse_bool(value).unwrap_or(self.keep_alive),
            "extension" if !value.is_empty() => {
                self.extension = value.trim_start_matches('.').to_string();
            }
            _ => debug!(key, "Ignoring activation key"),
        }
    }

    pub fn filter(&self) -> InclusionFilter {
        InclusionFilter::new(self.include.clone(), self.exclude.clone())
    }

    pub fn flush_enabled(&self) -> bool {
        !self.flush_interval.is_zero()
    }
}

/// Group raw tokens into `(key, value)` pairs, gluing `=`-less tokens onto the
/// previous value with a comma.
fn split_pairs(args: &str) -> Vec<(String, String)> {
    let mut grouped: Vec<String> = Vec::new();
    for token in args.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match grouped.last_mut() {
            Some(current) if !token.contains('=') => {
                current.push(',');
                current.push_str(token);
            }
            _ => grouped.push(token.to_string()),
        }
    }

    grouped
        .iter()
        .filter_map(|arg| {
            let (key, value) = arg.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn package_prefixes(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.replace('.', "/"))
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}
