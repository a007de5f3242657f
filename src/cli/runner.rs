use crate::cli::check;
use crate::domain::TestEnvironment;
use crate::infra::config::{self, ConfigDocument, RunnerSettings};
use crate::plugin::TestRunnerHooks;
use crate::services::ContainerRegistry;
use anyhow::{Context, Result, bail};
use clap::Args;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::process::Command;
use tracing::{debug, error, info, warn};

#[derive(Args, Debug, Default)]
pub struct RunOptions {
    /// Environments to run (default: `[runner] envlist`, else every `[env.*]`)
    #[arg(short = 'e', long = "env", value_name = "ENV", value_delimiter = ',')]
    pub envs: Vec<String>,
}

/// One `[env.NAME]` section, minus its `docker` list.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct EnvironmentSection {
    description: Option<String>,
    #[serde(default)]
    setenv: BTreeMap<String, String>,
    #[serde(default)]
    commands: Vec<CommandLine>,
}

/// A test command: an argv array, or a string run through `sh -c`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandLine {
    Argv(Vec<String>),
    Shell(String),
}

impl CommandLine {
    fn to_command(&self) -> Result<Command> {
        match self {
            Self::Argv(argv) => {
                let Some((program, args)) = argv.split_first() else {
                    bail!("empty command");
                };
                let mut cmd = Command::new(program);
                cmd.args(args);
                Ok(cmd)
            }
            Self::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                Ok(cmd)
            }
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Argv(argv) => write!(f, "{}", argv.join(" ")),
            Self::Shell(line) => write!(f, "{line}"),
        }
    }
}

#[derive(Debug)]
pub struct EnvOutcome {
    pub name: String,
    pub result: Result<()>,
}

impl EnvOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Picks the environments to run: `-e` values, else `[runner] envlist`,
/// else every declared environment by name.
pub fn select_environments(
    requested: &[String],
    settings: &RunnerSettings,
    declared: &[String],
) -> Result<Vec<String>> {
    let selected = if !requested.is_empty() {
        requested.to_vec()
    } else if !settings.envlist.is_empty() {
        settings.envlist.clone()
    } else {
        declared.to_vec()
    };

    for name in &selected {
        if !declared.contains(name) {
            bail!("unknown test environment '{name}': missing [env.{name}] section");
        }
    }
    Ok(selected)
}

/// An environment whose section parsed and whose containers resolved.
#[derive(Debug)]
struct PreparedEnvironment {
    env: TestEnvironment,
    description: Option<String>,
    commands: Vec<CommandLine>,
}

/// Runs every selected environment in turn, always tearing its containers
/// down afterwards.
///
/// Every selected environment is parsed and its container set resolved
/// before the first one starts, so configuration errors abort the run
/// without any engine call.
pub fn run(
    options: &RunOptions,
    document: &ConfigDocument,
    hooks: &impl TestRunnerHooks,
) -> Result<Vec<EnvOutcome>> {
    let sections = config::environment_sections(document)?;
    let declared: Vec<String> = sections.keys().cloned().collect();
    let settings = RunnerSettings::from_document(document)?;
    let selected = select_environments(&options.envs, &settings, &declared)?;

    let registry = ContainerRegistry::from_document(document)?;
    let mut prepared = Vec::with_capacity(selected.len());
    for name in &selected {
        let section = sections
            .get(name)
            .and_then(toml::Value::as_table)
            .with_context(|| format!("[env.{name}] must be a table"))?;
        let environment = prepare(name, section)?;
        let order = check::start_order_for(&environment.env.id, &environment.env.docker, &registry)?;
        debug!(env = %name, order = ?order, "environment containers resolved");
        prepared.push(environment);
    }

    let mut outcomes = Vec::with_capacity(prepared.len());
    for environment in prepared {
        let name = environment.env.id.to_string();
        let result = run_environment(environment, hooks);
        if let Err(e) = &result {
            error!(env = %name, "environment failed: {e:#}");
        }
        outcomes.push(EnvOutcome { name, result });
    }
    Ok(outcomes)
}

fn prepare(name: &str, section: &toml::Table) -> Result<PreparedEnvironment> {
    let docker = config::environment_containers(name, section)?;
    let mut rest = section.clone();
    rest.remove("docker");
    let parsed: EnvironmentSection = toml::Value::Table(rest)
        .try_into()
        .with_context(|| format!("invalid [env.{name}] section"))?;

    let mut env = TestEnvironment::new(name, docker);
    env.setenv = parsed.setenv;
    Ok(PreparedEnvironment {
        env,
        description: parsed.description,
        commands: parsed.commands,
    })
}

fn run_environment(prepared: PreparedEnvironment, hooks: &impl TestRunnerHooks) -> Result<()> {
    let PreparedEnvironment {
        mut env,
        description,
        commands,
    } = prepared;
    match &description {
        Some(description) => info!(env = %env.id, "starting environment: {description}"),
        None => info!(env = %env.id, "starting environment"),
    }

    let result = match hooks.on_before_run(&mut env) {
        Ok(_) => run_commands(&env, &commands),
        Err(e) => Err(anyhow::Error::new(e).context("containers failed to start, commands skipped")),
    };

    let teardown = hooks.on_after_run(&env);
    for (container, reason) in &teardown.failed {
        warn!(env = %env.id, container = %container, "container left behind: {reason}");
    }

    result
}

fn run_commands(env: &TestEnvironment, commands: &[CommandLine]) -> Result<()> {
    for line in commands {
        info!(env = %env.id, command = %line, "running command");
        let status = line
            .to_command()?
            .envs(&env.setenv)
            .status()
            .with_context(|| format!("failed to run `{line}`"))?;
        if !status.success() {
            bail!("`{line}` exited with {status}");
        }
    }
    Ok(())
}
