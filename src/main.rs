//! Cirrus CLI entrypoint.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use cirrus::cli::{Cli, Commands, OutputFormatter, StateCommands};
use cirrus::config::{
    ConfigParser, ConfigValidator, Settings, StackConfig, build_registry, find_config_file,
    open_state_store,
};
use cirrus::error::Result;
use cirrus::graph::GraphBuilder;
use cirrus::model::Declaration;
use cirrus::provider::ProviderRegistry;
use cirrus::reconciler::Reconciler;
use cirrus::state::{StateStore, generate_holder_id};

use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` wins over the verbosity flag when set.
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

/// Runs a command. `Ok(false)` means it completed but did not succeed.
async fn run(cli: Cli) -> Result<bool> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Plan => cmd_plan(config, &formatter).await,
        Commands::Apply {
            yes,
            concurrency,
            simulate,
        } => cmd_apply(config, yes, concurrency, simulate, &formatter).await,
        Commands::Destroy { yes, simulate } => cmd_destroy(config, yes, simulate, &formatter).await,
        Commands::Drift { simulate } => cmd_drift(config, simulate, &formatter).await,
        Commands::Outputs => cmd_outputs(config, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new stack.
fn cmd_init(path: &Path, force: bool) -> Result<bool> {
    info!("Initializing new Cirrus stack in: {}", path.display());

    let config_path = path.join("cirrus.stack.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Stack file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(false);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/cirrus.stack.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", ".cirrus/"]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# Cirrus")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.cirrus/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized.");
    eprintln!("\nNext steps:");
    eprintln!("  1. Copy .env.example to .env and fill in the values");
    eprintln!("  2. Edit cirrus.stack.yaml");
    eprintln!("  3. Run 'cirrus plan' to preview changes");
    eprintln!("  4. Run 'cirrus apply' to converge");

    Ok(true)
}

/// Validate the stack file.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool, formatter: &OutputFormatter) -> Result<bool> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating stack file: {}", config_file.display());

    let parser = parser_for(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    println!("{}", formatter.format_validation(&result, show_warnings));
    if !result.is_valid() {
        return Ok(false);
    }

    // Settings, placeholders and the graph only fail at run time otherwise.
    let settings = Settings::resolve(&config.settings, |name| std::env::var(name).ok())?;
    let declaration = config.declaration(&settings)?;
    let graph = GraphBuilder::new().build(&declaration.resources)?;

    if !formatter.is_json() {
        println!("\nStack summary:");
        println!("  Project: {}", config.project.name);
        println!("  Environment: {}", config.project.environment);
        println!("  Resources: {}", graph.len());
        println!("  Exports: {}", declaration.exports.len());
        for (key, value) in settings.masked() {
            println!("  Setting {key} = {value}");
        }
    }

    Ok(true)
}

/// Show what an apply would change.
async fn cmd_plan(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<bool> {
    let stack = Stack::load(config_path, true).await?;
    let reconciler = stack.reconciler();

    let plan = reconciler.plan(&stack.declaration).await?;
    println!("{}", formatter.format_plan(&plan));

    Ok(true)
}

/// Converge infrastructure on the stack file.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    concurrency: Option<usize>,
    simulate: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let stack = Stack::load(config_path, simulate).await?;
    let concurrency = concurrency.unwrap_or(stack.config.execution.concurrency);
    let reconciler = stack.reconciler().with_concurrency(concurrency).with_abort(abort_on_ctrl_c());

    let plan = reconciler.plan(&stack.declaration).await?;
    if !plan.has_changes() {
        println!("{}", formatter.format_plan(&plan));
        return Ok(true);
    }

    if !auto_approve {
        eprintln!("{}", formatter.format_plan(&plan));
        if !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(true);
        }
    }

    let report = reconciler.apply(&stack.declaration).await?;
    println!("{}", formatter.format_report(&report));

    Ok(report.is_success())
}

/// Delete every recorded resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    simulate: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let stack = Stack::load(config_path, simulate).await?;
    let reconciler = stack
        .reconciler()
        .with_concurrency(stack.config.execution.concurrency)
        .with_abort(abort_on_ctrl_c());

    let Some(state) = stack.store.load().await? else {
        println!("{}", formatter.message("success", "No state found; nothing to destroy."));
        return Ok(true);
    };

    if !auto_approve {
        eprintln!(
            "This will delete {} resource(s) in {}:",
            state.records.len(),
            stack.config.qualified_name()
        );
        for name in state.records.keys() {
            eprintln!("  - {name}");
        }
        if !confirm("\nType 'destroy' to confirm: ", "destroy")? {
            eprintln!("Destroy cancelled.");
            return Ok(true);
        }
    }

    let report = reconciler.destroy().await?;
    println!("{}", formatter.format_report(&report));

    Ok(report.is_success())
}

/// Compare recorded state with providers and the stack file.
async fn cmd_drift(config_path: Option<&PathBuf>, simulate: bool, formatter: &OutputFormatter) -> Result<bool> {
    let stack = Stack::load(config_path, simulate).await?;

    let report = stack.reconciler().check_drift(&stack.declaration).await?;
    println!("{}", formatter.format_drift(&report));

    Ok(report.is_converged())
}

/// Show exported outputs.
async fn cmd_outputs(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<bool> {
    let stack = Stack::load(config_path, true).await?;

    let exports = stack.reconciler().outputs(&stack.declaration).await?;
    println!("{}", formatter.format_exports(&exports));

    Ok(true)
}

/// State management commands.
async fn cmd_state(config_path: Option<&PathBuf>, command: StateCommands, formatter: &OutputFormatter) -> Result<bool> {
    let stack = Stack::load(config_path, true).await?;
    let store = stack.store.as_ref();

    match command {
        StateCommands::Show => {
            let lock = store.get_lock_info().await?;
            match store.load().await? {
                Some(state) => println!("{}", formatter.format_state(&state, lock.as_ref())),
                None => println!("{}", formatter.message("warning", "No state found.")),
            }
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            println!(
                "{}",
                formatter.message("success", &format!("State locked by {} (lock id {})", lock.holder, lock.lock_id))
            );
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock) = store.get_lock_info().await? {
                    warn!("Force unlocking state held by {}", lock.holder);
                    store.release_lock(&lock.lock_id).await?;
                    println!("{}", formatter.message("success", "State forcefully unlocked."));
                } else {
                    println!("{}", formatter.message("warning", "State is not locked."));
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                println!("{}", formatter.message("success", "State unlocked."));
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(false);
            }
        }
        StateCommands::ClearPending { yes } => {
            if !yes {
                eprintln!("Only clear pending operations after checking the affected resources by hand.");
                if !confirm("Clear them now? [y/N]: ", "y")? {
                    eprintln!("Cancelled.");
                    return Ok(true);
                }
            }
            let cleared = stack.reconciler().clear_pending().await?;
            let message = if cleared.is_empty() {
                "No unfinished operations.".to_string()
            } else {
                format!("Cleared unfinished operations on: {}", cleared.join(", "))
            };
            println!("{}", formatter.message("success", &message));
        }
    }

    Ok(true)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Everything a command needs from the stack file.
struct Stack {
    config: StackConfig,
    declaration: Declaration,
    registry: ProviderRegistry,
    store: Box<dyn StateStore>,
}

impl Stack {
    /// Loads, validates and expands the stack file, then opens providers and state.
    async fn load(config_path: Option<&PathBuf>, simulate: bool) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        debug!("Loading stack file from: {}", config_file.display());

        let parser = parser_for(&config_file);
        parser.load_dotenv()?;
        let config = parser.load_with_env(&config_file)?;

        let result = ConfigValidator::new().validate(&config)?;
        for warning in &result.warnings {
            warn!("{warning}");
        }

        let settings = Settings::resolve(&config.settings, |name| std::env::var(name).ok())?;
        let declaration = config.declaration(&settings)?;
        let context = config.provider_context(&settings)?;
        let registry = build_registry(&config.providers, &context, simulate)?;
        let store = open_state_store(&config).await?;

        Ok(Self {
            config,
            declaration,
            registry,
            store,
        })
    }

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(
            self.store.as_ref(),
            &self.registry,
            &self.config.project.name,
            &self.config.project.environment,
        )
    }
}

/// Resolves the stack file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn parser_for(config_file: &Path) -> ConfigParser {
    ConfigParser::new().with_base_path(config_file.parent().unwrap_or_else(|| Path::new(".")))
}

/// Flips to `true` on the first Ctrl-C.
fn abort_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight changes");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Prompts on stderr; true when the answer matches `expected`.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case(expected))
}
