use anyhow::Context;
use clap::Parser;
use hotpath::cli::{Cli, Command};
use hotpath::commands::run::RunOptions;
use hotpath::error::exit_code;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(hotpath_err) = e.downcast_ref::<hotpath::Error>() {
                ExitCode::from(hotpath_err.exit_code() as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "hotpath=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let verbose_activation = matches!(
        &cli.command,
        Command::Run { agent, .. } if hotpath::AgentConfig::parse(agent).verbose
    );
    init_logging(cli.verbose || verbose_activation);

    match cli.command {
        Command::Run {
            agent,
            entry,
            flush_interval,
            units,
        } => {
            hotpath::commands::run::run(RunOptions {
                activation: &agent,
                entry: &entry,
                flush_interval,
                units: &units,
                verbose: cli.verbose,
            })
            .context("Run failed")?;
        }
        Command::Regenerate { data, output } => {
            hotpath::commands::regenerate::run(&data, &output)
                .with_context(|| format!("Failed to regenerate report from {}", data.display()))?;
        }
        Command::Instrument { input, output, id } => {
            hotpath::commands::instrument::run(&input, &output, id.as_deref())
                .with_context(|| format!("Failed to instrument {}", input.display()))?;
        }
        Command::Inspect { unit } => {
            hotpath::commands::inspect::run(&unit)
                .with_context(|| format!("Failed to inspect {}", unit.display()))?;
        }
        Command::Completions { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "hotpath", &mut std::io::stdout());
        }
    }

    Ok(())
}
