mod canned;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use plait_core::config::AppConfig;
use plait_core::event::EventKind;
use plait_core::template::Template;
use plait_core::traits::TemplateStore;
use plait_core::workflow::{workflow_json_schema, Workflow};
use plait_prompt::budget::BudgetManager;
use plait_prompt::compiler::compile_template;
use plait_prompt::executor::render;
use plait_prompt::registry::RegistrySet;
use plait_workflow::{DirTemplateStore, InMemoryCatalog, WorkflowRunner};

use canned::CannedAdapter;

#[derive(Parser)]
#[command(name = "plait", version, about = "Structured prompt templates and workflow runs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "plait.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow and the templates and profiles it references
    Validate {
        /// Workflow JSON document
        workflow: PathBuf,
    },
    /// Render a template against a context and print the messages
    Render {
        /// Template JSON document
        template: PathBuf,
        /// Context JSON object (defaults to `{}`)
        #[arg(long)]
        context: Option<PathBuf>,
        /// Context token budget (defaults to the engine setting)
        #[arg(long)]
        max_tokens: Option<u64>,
    },
    /// Run a workflow offline against canned replies, printing events as JSONL
    Run {
        /// Workflow JSON document
        workflow: PathBuf,
        /// Context JSON object (defaults to `{}`)
        #[arg(long)]
        context: Option<PathBuf>,
        /// JSON array of replies, consumed one per step
        #[arg(long)]
        responses: Option<PathBuf>,
        /// Delay between streamed words, in milliseconds
        #[arg(long, default_value = "0")]
        delay_ms: u64,
        /// Also print stream_delta events
        #[arg(long)]
        deltas: bool,
    },
    /// Print the workflow JSON schema
    Schema,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("plait=info,plait_workflow=info,plait_prompt=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "plait", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Schema => {
            println!("{}", serde_json::to_string_pretty(&workflow_json_schema())?);
            return Ok(());
        }
        _ => {}
    }

    let (config, base) = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { workflow } => {
            validate(&config, &base, &workflow).await?;
        }
        Commands::Render {
            template,
            context,
            max_tokens,
        } => {
            let template: Template = serde_json::from_value(read_json(&template)?)?;
            let context = read_context(context.as_deref())?;
            let registry = RegistrySet::with_builtins().extended(&template.task)?;
            let compiled = compile_template(&template, Some(&registry.allowed_sources()))?;

            let max_tokens = max_tokens.unwrap_or(config.engine.default_max_context_tokens);
            let mut budget = BudgetManager::new(max_tokens);
            let messages = render(&compiled, &context, &mut budget, registry.as_ref());
            info!(
                messages = messages.len(),
                consumed = budget.consumed(),
                remaining = budget.remaining(),
                max_tokens,
                "Rendered template"
            );
            println!("{}", serde_json::to_string_pretty(&messages)?);
        }
        Commands::Run {
            workflow,
            context,
            responses,
            delay_ms,
            deltas,
        } => {
            let delay = Duration::from_millis(delay_ms);
            let adapter = match responses {
                Some(path) => CannedAdapter::from_file(&path, delay)?,
                None => CannedAdapter::new(Vec::new(), delay),
            };
            let runner = WorkflowRunner::builder(
                Arc::new(adapter),
                Arc::new(DirTemplateStore::new(config.templates_path(&base))),
                Arc::new(InMemoryCatalog::from_profiles(config.profiles.clone())),
            )
            .config(&config, &base)
            .build();

            let handle = runner.start_run_json(read_json(&workflow)?, read_context(context.as_deref())?)?;
            let mut events = handle.events()?;

            let run_id = handle.id().clone();
            let store = runner.store().clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!(run_id = %run_id, "Cancelling run...");
                if let Err(e) = store.cancel(&run_id) {
                    warn!(error = %e, "Cancel failed");
                }
            });

            while let Some(event) = events.next().await {
                if !deltas && matches!(event.kind, EventKind::StreamDelta { .. }) {
                    continue;
                }
                println!("{}", serde_json::to_string(&event)?);
            }

            let output = handle.result().await?;
            eprintln!(
                "Run {} finished: {}",
                handle.id(),
                serde_json::to_string(&output.final_outputs)?
            );
        }
        Commands::Schema | Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// Load the config file if present, otherwise defaults. Returns the
/// directory relative paths resolve against.
fn load_config(path: &Path) -> anyhow::Result<(AppConfig, PathBuf)> {
    if path.exists() {
        let config = AppConfig::load(path)?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok((config, base))
    } else {
        info!(path = %path.display(), "No config file found, using defaults");
        Ok((AppConfig::default(), PathBuf::from(".")))
    }
}

/// Check a workflow statically: document shape, templates compile for the
/// workflow's task, profiles exist.
async fn validate(config: &AppConfig, base: &Path, path: &Path) -> anyhow::Result<()> {
    let workflow = Workflow::parse(read_json(path)?)?;

    let builtins = RegistrySet::with_builtins();
    let registry = builtins
        .extended(&workflow.task)
        .map_err(|e| anyhow::anyhow!("{e} (known tasks: {})", builtins.tasks().join(", ")))?;
    let allowed = registry.allowed_sources();
    let templates = DirTemplateStore::new(config.templates_path(base));

    let mut problems = Vec::new();
    for step in &workflow.steps {
        match templates.load_template(&step.prompt_template_id).await {
            Ok(template) if template.task != workflow.task => problems.push(format!(
                "step '{}': template '{}' is for task '{}'",
                step.id, template.id, template.task
            )),
            Ok(template) => match compile_template(&template, Some(&allowed)) {
                Ok(compiled) => {
                    let mut sources: Vec<&str> = compiled.referenced_sources().into_iter().collect();
                    sources.sort_unstable();
                    debug!(step_id = %step.id, template_id = %template.id, ?sources, "Template compiles");
                }
                Err(e) => problems.push(format!("step '{}': {e}", step.id)),
            },
            Err(e) => problems.push(format!("step '{}': {e}", step.id)),
        }
        if config.profile(&step.model_profile_id).is_none() {
            problems.push(format!(
                "step '{}': model profile '{}' is not configured",
                step.id, step.model_profile_id
            ));
        }
    }

    if problems.is_empty() {
        println!(
            "Workflow '{}' is valid ({} steps, task '{}')",
            workflow.id,
            workflow.steps.len(),
            workflow.task
        );
        Ok(())
    } else {
        for problem in &problems {
            eprintln!("  {problem}");
        }
        anyhow::bail!("workflow '{}' has {} problem(s)", workflow.id, problems.len())
    }
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
    serde_json::from_str(&content).map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))
}

fn read_context(path: Option<&Path>) -> anyhow::Result<Value> {
    match path {
        Some(path) => read_json(path),
        None => Ok(Value::Object(Default::default())),
    }
}
