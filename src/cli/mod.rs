pub mod check;
pub mod runner;

pub use runner::{CommandLine, EnvOutcome, RunOptions};

use crate::infra::config::{self, DEFAULT_CONFIG_NAME};
use crate::plugin::{DockerPlugin, TestRunnerHooks};
use anyhow::Result;
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    name = "testdock",
    version,
    about = "Runs test environments against freshly started containers"
)]
pub struct Cli {
    /// Configuration file declaring `[docker.*]` and `[env.*]` sections
    #[arg(short, long, env = "TESTDOCK_CONFIG", default_value = DEFAULT_CONFIG_NAME)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Starts each environment's containers, runs its commands, stops them
    Run(RunOptions),
    /// Validates the configuration and prints each environment's start order
    Check,
    /// Lists the declared containers
    List,
}

/// Entry point of the `testdock` binary.
pub fn run() -> Result<ExitCode> {
    run_from(std::env::args_os(), DockerPlugin::new())
}

/// Parses `args` with the plugin's options registered, configures the
/// plugin and dispatches the subcommand.
pub fn run_from<I, T>(args: I, mut plugin: impl TestRunnerHooks) -> Result<ExitCode>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = plugin
        .on_register_options(Cli::command())
        .try_get_matches_from(args)
        .unwrap_or_else(|e| e.exit());
    let cli = Cli::from_arg_matches(&matches)?;

    let document = config::load_document(&cli.config)?;
    plugin.on_configure(&document, &matches)?;

    match cli.command {
        Commands::Run(options) => {
            let outcomes = runner::run(&options, &document, &plugin)?;
            println!("summary:");
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(()) => println!("  {}: OK", outcome.name),
                    Err(e) => println!("  {}: FAILED ({e:#})", outcome.name),
                }
            }
            if outcomes.iter().all(EnvOutcome::succeeded) {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Check => {
            for line in check::check(&document)? {
                println!("{line}");
            }
            println!("configuration OK");
            Ok(ExitCode::SUCCESS)
        }
        Commands::List => {
            for line in check::list(&document)? {
                println!("{line}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
