use crate::agent::Agent;
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::host::{EntryPoint, Host};
use hotpath_counter::CounterStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{info, warn};

pub struct RunOptions<'a> {
    pub activation: &'a str,
    pub entry: &'a str,
    pub flush_interval: Option<Duration>,
    pub units: &'a [PathBuf],
    pub verbose: bool,
}

/// Load units through the agent's hook, run the entry method and write the
/// exit report. The report is written even when loading or the entry method
/// fails.
pub fn run(opts: RunOptions<'_>) -> Result<()> {
    let mut config = AgentConfig::parse(opts.activation);
    if let Some(interval) = opts.flush_interval {
        config.flush_interval = interval;
    }
    config.verbose |= opts.verbose;

    let entry = EntryPoint::parse(opts.entry)?;
    let units = opts
        .units
        .iter()
        .map(|path| {
            std::fs::read(path).map_err(|e| {
                Error::InvalidArgument(format!("cannot read unit {}: {e}", path.display()))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let store = Arc::new(CounterStore::new());
    let agent = Agent::start(config, Arc::clone(&store))?;
    let host = Host::new(store).with_transformer(Arc::new(agent.transformer()));

    let result = host.load_all(&units).and_then(|loaded| {
        eprintln!(
            "Loaded {} units ({} instrumented)",
            loaded.len(),
            loaded.iter().filter(|o| o.instrumented).count()
        );
        host.run_entry(&entry)
    });
    match &result {
        Ok(Some(value)) => eprintln!("{}.{} returned {value}", entry.unit, entry.method),
        Ok(None) => eprintln!("{}.{} completed", entry.unit, entry.method),
        Err(Error::UnitNotFound(name)) => {
            eprintln!("{name} is not loaded; loaded units: {}", host.unit_names().join(", "))
        }
        Err(e) => eprintln!("Run of {}.{} failed: {e}", entry.unit, entry.method),
    }

    if result.is_ok()
        && agent.config().keep_alive
        && let Err(e) = wait_for_interrupt()
    {
        warn!(error = %e, "Cannot wait for Ctrl-C, writing the report now");
    }

    if let Some(payload) = agent.shutdown() {
        let hits: u64 = payload.files.iter().map(|f| f.total()).sum();
        eprintln!(
            "Report covers {} files ({hits} line executions)",
            payload.files.len()
        );
    }
    result.map(|_| ())
}

fn wait_for_interrupt() -> Result<()> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    eprintln!("Keeping alive (Ctrl-C to write the final report and exit)...");
    let _ = rx.recv();
    info!("Interrupted");
    Ok(())
}
