//! Agent lifecycle: the periodic flush task and the exit-time report.

use crate::config::AgentConfig;
use crate::error::Result;
use crate::hook::LineProbeTransformer;
use crate::report::{self, ReportOptions, ReportPayload};
use hotpath_counter::CounterStore;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct Agent {
    config: AgentConfig,
    store: Arc<CounterStore>,
    flusher: Option<Flusher>,
}

impl Agent {
    /// Start the agent. Spawns the flush thread when an interval is set.
    pub fn start(config: AgentConfig, store: Arc<CounterStore>) -> Result<Self> {
        info!(
            include = ?config.include,
            exclude = ?config.exclude,
            output = %config.output.display(),
            "Agent starting"
        );

        let flusher = if config.flush_enabled() {
            Some(Flusher::spawn(&config, Arc::clone(&store))?)
        } else {
            None
        };

        info!("Agent ready");
        Ok(Agent {
            config,
            store,
            flusher,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    /// The load-time hook configured from this agent's filter.
    pub fn transformer(&self) -> LineProbeTransformer {
        LineProbeTransformer::new(self.config.filter(), self.config.verbose)
    }

    /// Write a report now.
    pub fn flush(&self) -> Result<ReportPayload> {
        report::generate(
            &self.store,
            &self.config.output,
            &ReportOptions::from(&self.config),
        )
    }

    /// Stop the flush thread and write the exit report. Failures are logged,
    /// never returned, so shutdown always completes.
    pub fn shutdown(mut self) -> Option<ReportPayload> {
        if let Some(flusher) = self.flusher.take() {
            flusher.stop();
        }
        match self.flush() {
            Ok(payload) => Some(payload),
            Err(e) => {
                error!(error = %e, "Failed to write exit report");
                None
            }
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Some(flusher) = self.flusher.take() {
            flusher.stop();
        }
    }
}

struct Flusher {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Flusher {
    fn spawn(config: &AgentConfig, store: Arc<CounterStore>) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let interval: Duration = config.flush_interval;
        let output = config.output.clone();
        let options = ReportOptions::from(config);
        let verbose = config.verbose;

        let handle = thread::Builder::new()
            .name("hotpath-flush".into())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if verbose {
                        info!("Flushing report");
                    }
                    if let Err(e) = report::generate(&store, &output, &options) {
                        warn!(error = %e, "Periodic report failed");
                    }
                }
                debug!("Flush thread stopped");
            })?;

        debug!(interval = ?interval, "Flush thread started");
        Ok(Flusher { stop, handle })
    }

    fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("Flush thread panicked");
        }
    }
}
