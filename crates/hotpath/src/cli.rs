use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "hotpath")]
#[command(about = "Line execution profiler with load-time probe injection")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log filter decisions and instrumentation details
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load units through the agent, run an entry method and write the report
    Run {
        /// Agent activation string (packages=..,exclude=..,output=..,sourcepath=..)
        #[arg(long, short = 'a', default_value = "")]
        agent: String,

        /// Entry method as <unit>.<method>, e.g. com.app.Main.run
        #[arg(long, short = 'e')]
        entry: String,

        /// Override the activation string's flush interval
        #[arg(long, value_parser = parse_duration)]
        flush_interval: Option<Duration>,

        /// Code unit files to load
        #[arg(required = true)]
        units: Vec<PathBuf>,
    },

    /// Rebuild the HTML page from a saved data file
    Regenerate {
        /// Report data file (<base>.json)
        #[arg(long, short = 'd')]
        data: PathBuf,

        /// HTML page to write
        #[arg(long, short = 'o', default_value = crate::config::DEFAULT_OUTPUT)]
        output: PathBuf,
    },

    /// Inject line probes into a unit file
    Instrument {
        /// Unit file to rewrite
        input: PathBuf,

        /// Where to write the rewritten unit
        #[arg(long, short = 'o')]
        output: PathBuf,

        /// Unit identifier to record (defaults to the unit's own name)
        #[arg(long)]
        id: Option<String>,
    },

    /// Show methods, line tables and frames of a unit file
    Inspect {
        /// Unit file
        unit: PathBuf,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }

    // Bare numbers are seconds, like the activation string
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    Err(format!(
        "Invalid duration '{}'. Examples: 30s, 5m, 1h30m, 90",
        s
    ))
}
