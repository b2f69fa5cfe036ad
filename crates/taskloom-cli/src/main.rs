mod app;
mod interactive;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use taskloom_agents::LlmProvider;
use taskloom_config::{AppConfig, ConfigFormat, ConfigLoader, LoggingConfig};
use taskloom_security::RedactingWriter;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskloom", version, about = "Run tool-using language-model tasks")]
struct Cli {
    /// Config file (YAML or TOML)
    #[arg(short, long, global = true, env = "TASKLOOM_CONFIG")]
    config: Option<PathBuf>,

    /// Model id, overriding the config
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Approve every confirmation without asking
    #[arg(long, global = true)]
    auto_run: bool,

    /// Working directory for file and command tools
    #[arg(short = 'C', long, global = true)]
    dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single task and print the result
    Run {
        /// The task, as free text
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,
    },
    /// Interactive session; each line is a task sharing one conversation
    Chat,
    /// Print the effective configuration
    Config {
        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Yaml)]
        format: OutputFormat,
    },
    /// Check that the configured provider is reachable
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Yaml,
    Toml,
}

impl From<OutputFormat> for ConfigFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Yaml => ConfigFormat::Yaml,
            OutputFormat::Toml => ConfigFormat::Toml,
        }
    }
}

fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(RedactingWriter::stderr());
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn apply_cli_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(model) = &cli.model {
        config.provider.model = model.clone();
    }
    if cli.auto_run {
        config.engine.auto_run = true;
    }
    if let Some(dir) = &cli.dir {
        config.engine.working_dir = Some(dir.clone());
    }
    if cli.log_json {
        config.logging.json = true;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let loader = match &cli.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader
        .load()
        .with_context(|| format!("failed to load config from {}", loader.path().display()))?;
    apply_cli_overrides(&mut config, &cli);
    init_tracing(&config.logging);

    match cli.command {
        Command::Run { task } => {
            let task = task.join(" ");
            let code = interactive::run_once(&config, &task).await?;
            std::process::exit(code);
        }
        Command::Chat => interactive::chat(&config).await,
        Command::Config { init, format } => {
            if init {
                if loader.write_default()? {
                    info!("created {}", loader.path().display());
                } else {
                    println!("{} already exists", loader.path().display());
                }
            }
            let mut shown = config.clone();
            if shown.provider.api_key.is_some() {
                shown.provider.api_key = Some("[REDACTED]".to_string());
            }
            print!("{}", ConfigLoader::render(&shown, format.into())?);
            Ok(())
        }
        Command::Check => {
            let provider = app::build_provider(&config)?;
            if provider.health_check().await? {
                println!("{} is reachable", provider.base_url());
                Ok(())
            } else {
                anyhow::bail!("{} did not answer the health check", provider.base_url())
            }
        }
    }
}
