//! Terrace CLI entrypoint.
//!
//! This is the main entrypoint for the terrace command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use terrace::cli::{Cli, Commands, OutputFormatter, StateCommands};
use terrace::config::{find_config_file, ConfigParser, ConfigValidator, DeclarationConfig};
use terrace::error::{Result, StateError};
use terrace::graph::ResourceId;
use terrace::planner::{CancelHandle, ExecutionOptions};
use terrace::provider::HttpProvider;
use terrace::reconciler::Reconciler;
use terrace::state::{generate_holder_id, LocalStateStore, StateStore};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

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
            let resources = e.resources();
            if !resources.is_empty() {
                let ids: Vec<String> = resources.iter().map(ToString::to_string).collect();
                eprintln!("  Resources: {}", ids.join(", "));
            }
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` wins over `--verbose` when set.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

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
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Plan { destroy, detailed } => {
            cmd_plan(config_path, destroy, detailed, &formatter).await
        }
        Commands::Apply {
            yes,
            dry_run,
            concurrency,
            max_retries,
        } => {
            let overrides = Overrides {
                dry_run,
                concurrency,
                max_retries,
            };
            cmd_apply(config_path, yes, overrides, &formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(config_path, yes, &formatter).await,
        Commands::Graph => cmd_graph(config_path, &formatter),
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Command-line overrides for execution settings.
#[derive(Debug, Clone, Copy)]
struct Overrides {
    dry_run: bool,
    concurrency: Option<usize>,
    max_retries: Option<u32>,
}

impl Overrides {
    fn apply(self, options: ExecutionOptions) -> ExecutionOptions {
        let mut options = options.with_dry_run(self.dry_run);
        if let Some(concurrency) = self.concurrency {
            options = options.with_concurrency(concurrency);
        }
        if let Some(max_retries) = self.max_retries {
            options = options.with_max_retries(max_retries);
        }
        options
    }
}

/// Validate the declaration file.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating declarations: {}", config_file.display());

    let parser = parser_for(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().collect(&config);
    emit(&formatter.format_validation(&config, &result, show_warnings))?;

    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Show the plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    destroy: bool,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = Context::load(config_path)?;
    let reconciler = context.reconciler(false)?;

    let plan = if destroy {
        reconciler.plan_destroy().await?
    } else {
        reconciler.plan().await?
    };

    emit(&formatter.format_plan(&plan, detailed))?;
    Ok(ExitCode::SUCCESS)
}

/// Plan and apply.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    overrides: Overrides,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = Context::load(config_path)?;
    let reconciler = context.reconciler(!overrides.dry_run)?;
    let options = overrides.apply(ExecutionOptions::from(&reconciler.config().execution));

    let plan = reconciler.plan().await?;
    if plan.is_empty() {
        emit(&formatter.format_plan(&plan, false))?;
        return Ok(ExitCode::SUCCESS);
    }

    if !formatter.is_json() {
        emit(&formatter.format_plan(&plan, false))?;
    }

    if !options.dry_run && !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = cancel_on_ctrl_c();
    let report = reconciler.execute(&plan, options, &cancel).await?;
    emit(&formatter.format_report(&report))?;

    Ok(if report.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Destroy everything in state.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = Context::load(config_path)?;
    let reconciler = context.reconciler(true)?;

    let plan = reconciler.plan_destroy().await?;
    if plan.is_empty() {
        eprintln!("Nothing to destroy.");
        return Ok(ExitCode::SUCCESS);
    }

    if !formatter.is_json() {
        emit(&formatter.format_plan(&plan, false))?;
    }

    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let options = ExecutionOptions::from(&reconciler.config().execution);
    let cancel = cancel_on_ctrl_c();
    let report = reconciler.execute(&plan, options, &cancel).await?;
    emit(&formatter.format_report(&report))?;

    Ok(if report.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Print the declared graph.
fn cmd_graph(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let context = Context::load(config_path)?;
    let graph = Reconciler::new(context.config, Arc::new(context.store)).validated_graph()?;
    emit(&formatter.format_graph(&graph))?;
    Ok(ExitCode::SUCCESS)
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = Context::load(config_path)?;
    let store = context.store;

    match command {
        StateCommands::Show => {
            let snapshot = store.load().await?;
            let lock = store.get_lock_info().await?;
            emit(&formatter.format_state(&snapshot, lock.as_ref()))?;
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            eprintln!("State locked: {}", lock.lock_id);
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = store.get_lock_info().await? {
                    store.release_lock(&lock_info.lock_id).await?;
                    warn!("Forcefully released lock held by {}", lock_info.holder);
                    eprintln!("State forcefully unlocked.");
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(ExitCode::FAILURE);
            }
        }
        StateCommands::Rm { resource } => {
            let id: ResourceId = resource.parse()?;
            let snapshot = store.load().await?;
            if !snapshot.contains_key(&id) {
                return Err(StateError::RecordNotFound { resource: id }.into());
            }
            let lock = store.acquire_lock(&generate_holder_id()).await?;
            let removed = store.remove(&id).await;
            store.release_lock(&lock.lock_id).await?;
            removed?;
            eprintln!("Removed {id} from state. The instance itself was not destroyed.");
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Loaded declarations plus the store they point at.
struct Context {
    config: DeclarationConfig,
    store: LocalStateStore,
}

impl Context {
    /// Loads and validates the declaration file and opens its state store.
    fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        debug!("Loading declarations from: {}", config_file.display());

        let parser = parser_for(&config_file);
        parser.load_dotenv()?;
        let config = parser.load_with_env(&config_file)?;

        let result = ConfigValidator::new().validate(&config)?;
        for warning in &result.warnings {
            warn!("{warning}");
        }

        let state_dir = ConfigParser::state_dir(&config, &config_file);
        debug!("Using state directory: {}", state_dir.display());
        let store = LocalStateStore::with_base_dir(state_dir);

        Ok(Self { config, store })
    }

    /// Builds a reconciler; with `provider` set, one is required.
    fn reconciler(self, provider: bool) -> Result<Reconciler> {
        let endpoint = self.config.provider.endpoint.clone();
        let timeout = self.config.provider.timeout_secs;
        let token = ConfigParser::provider_token(&self.config);
        let reconciler = Reconciler::new(self.config, Arc::new(self.store));

        match endpoint {
            Some(endpoint) if provider => {
                let mut http = HttpProvider::with_timeout(&endpoint, timeout)?;
                if let Some(token) = token {
                    http = http.with_token(token);
                }
                Ok(reconciler.with_provider(Arc::new(http)))
            }
            _ => Ok(reconciler),
        }
    }
}

/// Resolves the declaration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn parser_for(config_file: &Path) -> ConfigParser {
    ConfigParser::new().with_base_path(config_file.parent().unwrap_or_else(|| Path::new(".")))
}

/// Returns a handle cancelled by the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancelHandle {
    let cancel = CancelHandle::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight steps");
            handle.cancel();
        }
    });
    cancel
}

/// Prompts on stderr and compares the answer.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Writes command output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output.as_bytes())?;
    if !output.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    Ok(())
}
