//! Converge CLI entrypoint.
//!
//! The CLI works offline: it validates configuration, plans against the
//! persisted state and manages that state. Remote execution is done by
//! programs that link the library with their own `RemoteOps`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use converge::cli::{Cli, Commands, MessageLevel, OutputFormatter, StateCommands};
use converge::config::{
    find_config_file, ConfigParser, ConfigValidator, LoadedConfig, StateSettings,
};
use converge::error::{ConvergeError, Result, StateError};
use converge::planner::{Plan, Planner};
use converge::state::{LocalBackend, LockPurpose, StateStore};

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the log filter.
const LOG_ENV: &str = "CONVERGE_LOG";

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Plan { detailed } => {
            let plan = load_plan(config).await?;
            println!("{}", formatter.format_plan(&plan, detailed));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Graph => {
            let plan = load_plan(config).await?;
            println!("{}", formatter.format_graph(&plan));
            Ok(ExitCode::SUCCESS)
        }
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Locates the configuration file and the directory it lives in.
fn locate_config(config: Option<&Path>) -> Result<(PathBuf, PathBuf)> {
    let path = match config {
        Some(path) => path.to_path_buf(),
        None => find_config_file(std::env::current_dir()?)?,
    };
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    Ok((path, base))
}

/// Validate the configuration.
fn cmd_validate(
    config: Option<&Path>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (path, base) = locate_config(config)?;
    let document = ConfigParser::new()
        .with_base_path(&base)
        .load_with_env(&path)?;

    let (loaded, report) = ConfigValidator::new().check(&document);
    println!(
        "{}",
        formatter.format_validation(&report, loaded.resources.len(), show_warnings)
    );

    Ok(if report.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Loads and validates configuration, then opens the state it points at.
async fn load_config(config: Option<&Path>) -> Result<(LoadedConfig, StateStore)> {
    let (path, base) = locate_config(config)?;
    let document = ConfigParser::new()
        .with_base_path(&base)
        .load_with_env(&path)?;
    let loaded = ConfigValidator::new().validate(&document)?;

    let state_path = loaded.settings.state.resolve(&base);
    debug!("Using state file: {}", state_path.display());
    let store = StateStore::open(LocalBackend::with_state_path(state_path)).await?;
    Ok((loaded, store))
}

/// Plans against persisted state without contacting the remote system.
async fn load_plan(config: Option<&Path>) -> Result<Plan> {
    let (loaded, mut store) = load_config(config).await?;
    loaded.declare_in(&mut store)?;
    let plan = Planner::new(&loaded.registry).plan(&store)?;
    info!("Planned {} changes", plan.changes().count());
    Ok(plan)
}

/// Opens the state store, falling back to the default location when no
/// configuration file is found.
async fn open_state(config: Option<&Path>) -> Result<StateStore> {
    let state_path = match locate_config(config) {
        Ok((path, base)) => {
            let document = ConfigParser::new()
                .with_base_path(&base)
                .load_with_env(&path)?;
            document.settings.state.resolve(&base)
        }
        Err(ConvergeError::Config(_)) if config.is_none() => {
            StateSettings::default().resolve(&std::env::current_dir()?)
        }
        Err(e) => return Err(e),
    };
    debug!("Using state file: {}", state_path.display());
    StateStore::open(LocalBackend::with_state_path(state_path)).await
}

/// Manage persisted state.
async fn cmd_state(
    config: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let mut store = open_state(config).await?;

    match command {
        StateCommands::List => {
            let lock = store.lock_info().await?;
            println!("{}", formatter.format_state(&store, lock.as_ref()));
        }
        StateCommands::Show { name } => {
            let state = store.get(&name).ok_or_else(|| unknown_resource(&name))?;
            println!("{}", formatter.format_resource(state));
        }
        StateCommands::Rm { name } => {
            if store.get(&name).is_none() {
                return Err(unknown_resource(&name));
            }
            store.lock(LockPurpose::StateEdit).await?;
            let result = remove_and_persist(&mut store, &name).await;
            store.unlock().await?;
            result?;
            println!(
                "{}",
                formatter.message(
                    MessageLevel::Success,
                    &format!("Stopped tracking '{name}'; the remote object was left untouched.")
                )
            );
        }
        StateCommands::Unlock { lock_id } => {
            store.force_unlock(&lock_id).await?;
            println!(
                "{}",
                formatter.message(MessageLevel::Success, &format!("Released state lock {lock_id}."))
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn remove_and_persist(store: &mut StateStore, name: &str) -> Result<()> {
    store.remove(name)?;
    store.persist().await
}

fn unknown_resource(name: &str) -> ConvergeError {
    ConvergeError::State(StateError::UnknownResource {
        name: name.to_string(),
    })
}
