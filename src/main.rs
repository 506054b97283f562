use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use planwise_core::config::AppConfig;
use planwise_core::event::EventBus;
use planwise_core::traits::LlmClient;
use planwise_core::types::{AgentEvent, EventKind};

use planwise_agent::workflow::{
    DisplayFlush, GraphExecutor, StdinReview, Workflow, WorkflowRequest,
};
use planwise_agent::{AgentRuntime, PromptTemplates};
use planwise_tools::builtin::{BashTool, PythonReplTool};
use planwise_tools::ToolRegistry;

const DEFAULT_USER_QUERY: &str = "\
I am the marketing manager at Yummy Food. We advertise the food products our company makes \
across several media channels. The data we have is consumer purchase history and advertising \
data per media channel. Write a consumer analysis and advertising analysis report, including \
consumer purchase patterns, as a docx file.

Include the following in the report:
1/ We advertise our products across several media channels. Analyse our products and analyse our consumers.
2/ Open the report with an overview of advertising revenue such as \"These are the results of spending \
an advertising budget of X across 4 channels (e.g. Amazon, Kurly, Naver, Coupang) for N days on the \
categories fresh food, convenience food and health food. In summary...\".
3/ Analyse which products were popular with which consumers.
4/ Write the combined analysis as a docx report. The data to analyse is in './data/*'.";

const BASIC_USER_INPUT: &str = "Hi, nice to meet you. I'm learning how to build agents right now.";

#[derive(Parser)]
#[command(name = "planwise", version, about = "Plan-review-execute multi-agent workflow")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "planwise.toml", env = "PLANWISE_CONFIG")]
    config: PathBuf,

    /// User query for the workflow (defaults to the built-in example)
    #[arg(long = "user_query", global = true)]
    user_query: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator/planner/supervisor workflow
    Run,
    /// Run a single toy agent
    Basic {
        /// Print only the final response instead of streaming
        #[arg(long)]
        no_stream: bool,
        /// Give the agent a code tool (repeatable)
        #[arg(long = "tool", value_enum)]
        tools: Vec<BasicTool>,
        /// The message to send to the agent
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
    },
    /// Show current configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum BasicTool {
    Python,
    Bash,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("planwise=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Basic {
            no_stream,
            tools,
            prompt,
        } => {
            let llm = build_llm(&config);
            let input = if prompt.is_empty() {
                BASIC_USER_INPUT.to_string()
            } else {
                prompt.join(" ")
            };
            run_basic(&config, llm, &tools, !no_stream, &input).await
        }
        Commands::Run => {
            let llm = build_llm(&config);
            let query = cli
                .user_query
                .or_else(|| config.workflow.default_query.clone())
                .unwrap_or_else(|| DEFAULT_USER_QUERY.to_string());
            run_workflow(config, llm, &query).await
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let mut config = if path.exists() {
        info!(path = %path.display(), "Loading config");
        AppConfig::load(path)?
    } else {
        warn!(
            path = %path.display(),
            "No config file found, building config from ANTHROPIC_API_KEY / OPENAI_API_KEY"
        );
        AppConfig::from_env()
    };
    config.apply_env_overrides();
    Ok(config)
}

fn build_llm(config: &AppConfig) -> Arc<dyn LlmClient> {
    Arc::new(planwise_llm::create_retrying_client(
        &config.model,
        &config.fallback_models,
    ))
}

fn artifacts_dir(config: &AppConfig) -> PathBuf {
    let dir = PathBuf::from(&config.workflow.artifacts_dir);
    if dir.is_absolute() {
        dir
    } else {
        config.working_dir().join(dir)
    }
}

fn remove_artifacts(dir: &Path) {
    if !dir.exists() {
        info!(path = %dir.display(), "Artifacts directory does not exist");
        return;
    }
    match std::fs::remove_dir_all(dir) {
        Ok(()) => info!(path = %dir.display(), "Removed artifacts directory"),
        Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove artifacts directory"),
    }
}

async fn run_workflow(config: AppConfig, llm: Arc<dyn LlmClient>, query: &str) -> anyhow::Result<()> {
    if config.workflow.clean_artifacts {
        remove_artifacts(&artifacts_dir(&config));
    }

    let event_bus = Arc::new(EventBus::default());
    let (flush_tx, flush_rx) = mpsc::unbounded_channel();
    let print_handle = spawn_display(event_bus.subscribe(), flush_rx, print_event);

    let executor = GraphExecutor::for_config(&config.workflow);
    let review = StdinReview::new().with_display_flush(flush_tx);
    let mut workflow =
        Workflow::new(config, llm, Box::new(review)).with_event_bus(event_bus.clone());

    println!("\n=== Starting workflow ===");
    let result = executor
        .execute(&mut workflow, WorkflowRequest::new(query))
        .await;

    // Closing the bus lets the display print what is queued, then exit
    drop(workflow);
    drop(event_bus);
    if let Err(e) = print_handle.await {
        warn!(error = %e, "Event display task failed");
    }

    let result = match result {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Workflow failed");
            return Err(e.into());
        }
    };

    println!("\n\n=== Conversation History ===");
    match result.state {
        Some(ref state) if !state.history().is_empty() => {
            for entry in state.history() {
                println!("[{}] {}", entry.agent, entry.message);
            }
            eprintln!("\n[usage: {}]", state.token_usage);
        }
        _ => println!("No conversation history found"),
    }

    if !result.completed {
        warn!("Workflow stopped at the node visit cap");
    }
    eprintln!(
        "[done: run {}, {} nodes in {} ms]",
        result.run_id,
        result.node_results.len(),
        result.total_elapsed_ms
    );
    Ok(())
}

async fn run_basic(
    config: &AppConfig,
    llm: Arc<dyn LlmClient>,
    tools: &[BasicTool],
    stream: bool,
    input: &str,
) -> anyhow::Result<()> {
    const AGENT_NAME: &str = "toy_agent";

    let prompts = PromptTemplates::new(config.prompts_dir());
    let system_prompt = prompts.render(AGENT_NAME, &[("AGENT_NAME", AGENT_NAME)])?;

    let mut registry = ToolRegistry::new();
    for tool in tools {
        match tool {
            BasicTool::Python => registry.register(PythonReplTool::new(
                config.tools.python_bin.clone(),
                config.tools.python_timeout_secs,
            )),
            BasicTool::Bash => registry.register(BashTool::new(config.tools.bash_timeout_secs)),
        }
    }

    let mut agent = AgentRuntime::new(
        AGENT_NAME,
        system_prompt,
        config.model_for(AGENT_NAME),
        llm,
    )
    .with_tools(Arc::new(registry))
    .with_working_dir(config.working_dir())
    .with_limits(&config.agent);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let run = async move {
        let result = agent.run(input, AGENT_NAME, &tx).await;
        drop(tx);
        result
    };
    let display = async {
        while let Some(event) = rx.recv().await {
            if stream {
                print_event(&event);
            }
        }
    };
    let (result, ()) = tokio::join!(run, display);

    let text = result?;
    if stream {
        println!();
    }
    println!("\nResponse: {text}");
    Ok(())
}

/// Run `on_event` for every bus event until the bus closes.
///
/// Flush requests are acknowledged only when no published event is still
/// waiting, so whoever asked knows the display is caught up.
fn spawn_display<F>(
    mut rx: broadcast::Receiver<AgentEvent>,
    mut flush_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    mut on_event: F,
) -> JoinHandle<()>
where
    F: FnMut(&AgentEvent) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Ok(event) => on_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Display fell behind, some events were not shown");
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(ack) = flush_rx.recv() => {
                    io::stdout().flush().ok();
                    ack.send(()).ok();
                }
            }
        }
    })
}

fn print_event(event: &AgentEvent) {
    match &event.kind {
        EventKind::TextChunk(text) => {
            print!("{text}");
            io::stdout().flush().ok();
        }
        EventKind::Reasoning(text) => {
            eprint!("{text}");
        }
        EventKind::ToolUse { name, input } => {
            eprintln!(
                "\n[{} -> {}] {}",
                event.agent,
                name,
                truncate(&input.to_string(), 200)
            );
        }
        EventKind::ToolResult { name, result } => {
            let status = if result.is_error { "ERROR" } else { "ok" };
            eprintln!("[{}: {}] {}", name, status, truncate(&result.content, 200));
        }
        EventKind::TokenUsage(_) => {}
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
