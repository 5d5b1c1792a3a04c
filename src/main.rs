//! Stratum CLI entrypoint.
//!
//! This is the main entrypoint for the stratum command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use stratum::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use stratum::config::{
    ConfigParser, ConfigValidator, ENV_TEMPLATE, ProviderKind, STACK_TEMPLATE, StackConfig,
    StateBackend, find_config_file,
};
use stratum::engine::{ApplyStatus, Engine};
use stratum::error::{Result, StratumError};
use stratum::graph::ResourceGraph;
use stratum::provider::{HttpProvider, MemoryProvider, Provider};
use stratum::state::{LocalStateStore, S3StateStore, STATE_DIR, StateStore};

use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Stack file written by `init`.
const STACK_FILE: &str = "stratum.stack.yaml";

/// Exit code for `plan` when changes are pending.
const EXIT_CHANGES: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.output);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli, &formatter)) {
        Ok(code) => code,
        Err(e) => {
            formatter.error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// Logs go to stderr so stdout carries only command output.
fn init_logging(verbose: bool, output: OutputFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match output {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli, formatter: &OutputFormatter) -> Result<ExitCode> {
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force, formatter).map(|()| ExitCode::SUCCESS),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, formatter),
        Commands::Plan { detailed } => cmd_plan(config_path, detailed, formatter).await,
        Commands::Apply { yes, parallelism } => {
            cmd_apply(config_path, yes, parallelism, formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(config_path, yes, formatter).await,
        Commands::Graph => cmd_graph(config_path, formatter),
        Commands::Drift => cmd_drift(config_path, formatter).await,
        Commands::State { command } => cmd_state(config_path, command, formatter)
            .await
            .map(|()| ExitCode::SUCCESS),
    }
}

/// Writes a starter stack.
fn cmd_init(path: &Path, force: bool, formatter: &OutputFormatter) -> Result<()> {
    info!("Initializing new stack in: {}", path.display());

    let stack_path = path.join(STACK_FILE);
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && stack_path.exists() {
        formatter.warning(&format!(
            "Stack file already exists: {} (use --force to overwrite)",
            stack_path.display()
        ));
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&stack_path, STACK_TEMPLATE)?;
    eprintln!("Created: {}", stack_path.display());

    std::fs::write(&env_path, ENV_TEMPLATE)?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", state_entry.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Stratum")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    formatter.success("Stack initialized");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and set STRATUM_PROVIDER_TOKEN");
    eprintln!("  2. Edit {STACK_FILE} to describe your resources");
    eprintln!("  3. Run 'stratum validate' to check the stack");
    eprintln!("  4. Run 'stratum plan' to preview changes");
    eprintln!("  5. Run 'stratum apply' to provision them");

    Ok(())
}

/// Validates the stack file and its graph.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, _) = load_config(config_path, false)?;
    let result = ConfigValidator::new().check(&config);
    formatter.emit(&formatter.format_validation(&result, &config, show_warnings));

    if !result.is_valid() {
        return Ok(ExitCode::FAILURE);
    }
    // Graph errors (cycles, unknown references) are reported as errors.
    ResourceGraph::build(&config.resources)?;
    Ok(ExitCode::SUCCESS)
}

/// Shows the plan. Exits 2 when there are changes.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, config_file) = load_config(config_path, true)?;
    let state_store = create_state_store(&config, &config_file).await?;
    let provider = create_provider(&config).await?;

    let outcome = Engine::new(&config, state_store.as_ref(), provider).plan().await?;
    formatter.emit(&formatter.format_plan(&outcome, detailed));

    if outcome.plan.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_CHANGES))
    }
}

/// Applies the plan.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    parallelism: Option<u16>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, config_file) = load_config(config_path, true)?;
    let state_store = create_state_store(&config, &config_file).await?;
    let provider = create_provider(&config).await?;

    let mut engine =
        Engine::new(&config, state_store.as_ref(), provider).with_abort(abort_on_ctrl_c());
    if let Some(n) = parallelism {
        engine = engine.with_parallelism(usize::from(n));
    }

    let outcome = engine
        .apply(|planned| {
            if !formatter.is_json() {
                formatter.emit(&formatter.format_plan(planned, false));
            }
            async move {
                auto_approve || confirm("Do you want to apply this plan? [y/N]: ", "y").await
            }
        })
        .await?;

    formatter.emit(&formatter.format_apply(&outcome));
    Ok(exit_code(outcome.status))
}

/// Deletes every applied resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, config_file) = load_config(config_path, true)?;
    let state_store = create_state_store(&config, &config_file).await?;
    let provider = create_provider(&config).await?;

    let outcome = Engine::new(&config, state_store.as_ref(), provider)
        .with_abort(abort_on_ctrl_c())
        .destroy(|plan| {
            if !formatter.is_json() {
                eprintln!("The following resources will be deleted:");
                for action in &plan.actions {
                    eprintln!("  - {} ({})", action.resource_name, action.resource_type);
                }
            }
            async move {
                auto_approve
                    || confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")
                        .await
            }
        })
        .await?;

    formatter.emit(&formatter.format_apply(&outcome));
    Ok(exit_code(outcome.status))
}

/// Lists resources in dependency order.
fn cmd_graph(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (config, _) = load_config(config_path, false)?;
    let graph = ResourceGraph::build(&config.resources)?;
    formatter.emit(&formatter.format_graph(&graph));
    Ok(ExitCode::SUCCESS)
}

/// Checks for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (config, config_file) = load_config(config_path, true)?;
    let state_store = create_state_store(&config, &config_file).await?;
    let provider = create_provider(&config).await?;

    let report = Engine::new(&config, state_store.as_ref(), provider)
        .check_drift()
        .await?;
    formatter.emit(&formatter.format_drift(&report));

    if report.is_converged() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_CHANGES))
    }
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path, true)?;
    let state_store = create_state_store(&config, &config_file).await?;

    match command {
        StateCommands::Show => {
            if let Some(state) = state_store.load().await? {
                formatter.emit(&formatter.format_state(&state));
            } else {
                formatter.warning("No state found.");
            }
        }
        StateCommands::Lock { holder } => {
            let lock = state_store
                .acquire_lock(holder.as_deref().unwrap_or_default())
                .await?;
            formatter.emit(&formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                match state_store.force_release_lock().await? {
                    Some(lock) => formatter.success(&format!(
                        "Removed lock {} held by {}",
                        lock.lock_id, lock.holder
                    )),
                    None => formatter.warning("State is not locked."),
                }
            } else {
                let id = lock_id
                    .ok_or_else(|| StratumError::internal("state unlock needs --lock-id or --force"))?;
                state_store.release_lock(&id).await?;
                formatter.success("State unlocked.");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the stack file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads the stack, with `.env` and environment overrides applied.
///
/// With `strict`, validation errors abort.
fn load_config(config_path: Option<&PathBuf>, strict: bool) -> Result<(StackConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading stack from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    if strict {
        let result = ConfigValidator::new().validate(&config)?;
        for warning in &result.warnings {
            warn!("{warning}");
        }
    }
    Ok((config, config_file))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Creates the state store the stack asks for.
async fn create_state_store(config: &StackConfig, config_file: &Path) -> Result<Box<dyn StateStore>> {
    let store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let dir = config
                .state
                .path
                .as_ref()
                .map_or_else(|| config_dir(config_file).join(STATE_DIR), PathBuf::from);
            Box::new(LocalStateStore::with_base_dir(dir))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| StratumError::internal("S3 bucket not configured"))?;
            Box::new(
                S3StateStore::new(bucket, config.state.prefix.as_deref(), config.state.region.as_deref())
                    .await?,
            )
        }
    };
    debug!("Using {} state backend", store.backend_type());
    Ok(store)
}

/// Creates the provider the stack asks for.
async fn create_provider(config: &StackConfig) -> Result<Arc<dyn Provider>> {
    match config.provider.kind {
        ProviderKind::Http => {
            let endpoint = config
                .provider
                .endpoint
                .as_deref()
                .ok_or_else(|| StratumError::internal("provider.endpoint not configured"))?;
            let mut provider = HttpProvider::new(
                endpoint,
                ConfigParser::provider_token(),
                config.provider.timeout_secs,
            )?;
            let discovered = provider.discover_schemas().await?;
            debug!("Provider reported {discovered} type schemas");
            Ok(Arc::new(provider))
        }
        ProviderKind::Memory => {
            warn!("Using the in-memory provider; nothing is provisioned remotely");
            let provider = config
                .types
                .iter()
                .fold(MemoryProvider::new(), |p, (resource_type, schema)| {
                    p.with_schema(resource_type, schema.clone())
                });
            Ok(Arc::new(provider))
        }
    }
}

/// Returns a receiver that flips to `true` on Ctrl-C.
fn abort_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; letting in-flight actions finish");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Asks for confirmation on stderr.
///
/// The read runs on the blocking pool so the state lock's lease keeps being
/// renewed while the prompt waits.
async fn confirm(prompt: &'static str, expected: &'static str) -> bool {
    let answer = tokio::task::spawn_blocking(move || {
        eprint!("{prompt}");
        if std::io::stderr().flush().is_err() {
            return false;
        }
        let mut input = String::new();
        if std::io::stdin().read_line(&mut input).is_err() {
            return false;
        }
        input.trim().eq_ignore_ascii_case(expected)
    })
    .await;
    answer.unwrap_or(false)
}

const fn exit_code(status: ApplyStatus) -> ExitCode {
    match status {
        ApplyStatus::Partial => ExitCode::FAILURE,
        ApplyStatus::NoChanges | ApplyStatus::Declined | ApplyStatus::Completed => {
            ExitCode::SUCCESS
        }
    }
}
