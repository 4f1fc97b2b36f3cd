mod interactive;
mod render;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use medex_config::AppConfig;
use medex_llm::OpenAiCompatClient;
use medex_runtime::{MedexRuntime, classifier};

#[derive(Debug, Parser)]
#[command(
    name = "medex",
    version,
    about = "Medical assistant over an OpenAI-compatible completion service"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactive chat session (default).
    Chat,
    /// Ask a single question and stream the answer.
    Ask {
        #[arg(required = true, trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// Analyze a medical image, optionally with clinical context.
    Image {
        path: PathBuf,
        #[arg(trailing_var_arg = true)]
        context: Vec<String>,
    },
    /// Request a structured JSON diagnostic summary.
    Diagnose {
        #[arg(required = true, trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// Print how a query is classified (offline).
    Classify {
        #[arg(required = true, trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// Check configuration and connectivity.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    // Tokens go to stdout; logs stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!(config = %cli.config.display(), "configuration loaded");

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => {
            let runtime = build_runtime(config, &cli.config)?;
            interactive::run_interactive_session(&runtime).await?;
        }
        Commands::Ask { query } => {
            let runtime = build_runtime(config, &cli.config)?;
            interactive::stream_turn(&runtime, &query.join(" ")).await?;
        }
        Commands::Image { path, context } => {
            let runtime = build_runtime(config, &cli.config)?;
            interactive::analyze_image(&runtime, &path, &context.join(" ")).await?;
        }
        Commands::Diagnose { query } => {
            let runtime = build_runtime(config, &cli.config)?;
            interactive::diagnose(&runtime, &query.join(" ")).await?;
        }
        Commands::Classify { query } => {
            let query = query.join(" ");
            let classification = classifier::classify(&query);
            println!("{}", serde_json::to_string_pretty(&classification)?);
            if let Some(category) = classifier::emergency_category(&query) {
                println!("emergency category: {}", category.as_str());
            }
        }
        Commands::Doctor => run_doctor(&config, &cli.config).await?,
    }

    Ok(())
}

fn build_runtime(config: AppConfig, config_path: &Path) -> Result<MedexRuntime> {
    if !config.has_api_key() {
        bail!(
            "no API key configured: set MOONSHOT_API_KEY or llm.api_key in {}",
            config_path.display()
        );
    }
    MedexRuntime::from_config(config).context("failed to build completion client")
}

async fn run_doctor(config: &AppConfig, config_path: &Path) -> Result<()> {
    println!("medex doctor");
    println!(
        "- config file: {} ({})",
        config_path.display(),
        if config_path.exists() { "found" } else { "missing, using defaults" }
    );
    println!("- base url: {}", config.llm.base_url);
    println!("- model: {}", config.llm.model);
    println!("- api key: {}", if config.has_api_key() { "set" } else { "missing" });
    println!(
        "- web search: {} ({} as {})",
        if config.tools.web_search_enabled { "enabled" } else { "disabled" },
        config.tools.web_search_name,
        config.tools.web_search_kind
    );
    println!("- max tool rounds: {}", config.llm.max_tool_rounds);
    println!(
        "- history: window={} budget={} persist={}",
        config.history.window, config.history.assistant_budget_chars, config.history.persist
    );

    if !config.has_api_key() {
        return Ok(());
    }

    let client = OpenAiCompatClient::new(config.llm.base_url.clone(), config.llm.api_key.clone())?;
    match client.list_models().await {
        Ok(models) => {
            let listed = models.iter().any(|m| m == &config.llm.model);
            println!(
                "- connectivity: ok ({} models, configured model {})",
                models.len(),
                if listed { "listed" } else { "NOT listed" }
            );
        }
        Err(err) => println!("- connectivity: failed ({err})"),
    }
    Ok(())
}
