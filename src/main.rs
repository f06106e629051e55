use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use caseforge_core::config::AppConfig;
use caseforge_core::traits::{ModelClient, SessionStore};
use caseforge_core::types::{ComplianceStandard, InputDocument, ProcessingResult, SessionId};
use caseforge_pipeline::TestCaseGenerator;
use caseforge_store::SqliteSessionStore;

#[derive(Parser)]
#[command(
    name = "caseforge",
    version,
    about = "Turn healthcare requirement documents into compliance-tagged test cases"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "caseforge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process requirement documents and print the result as JSON
    Run {
        /// Requirement documents (txt, md, xml, pdf, docx, xlsx)
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Compliance standard to tag against (repeatable; default: from config)
        #[arg(short, long = "standard", value_parser = parse_standard)]
        standards: Vec<ComplianceStandard>,
        /// Write the result to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Continue a stored session from the stage it stopped at
    Resume {
        session_id: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the status of a stored session
    Status { session_id: String },
    /// List stored sessions, most recent first
    Sessions,
    /// Delete a stored session
    Delete { session_id: String },
    /// Remove sessions idle longer than session.timeout_minutes
    Cleanup,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn parse_standard(tag: &str) -> Result<ComplianceStandard, String> {
    ComplianceStandard::parse(tag).ok_or_else(|| {
        let known: Vec<&str> = ComplianceStandard::ALL.iter().map(|s| s.as_str()).collect();
        format!("unknown standard '{}' (expected one of: {})", tag, known.join(", "))
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("caseforge=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "caseforge", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    if let Commands::Config = &cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let store: Option<Arc<dyn SessionStore>> = if config.session.enabled {
        let path = config.session_db_path();
        let store = SqliteSessionStore::open(&path)
            .with_context(|| format!("opening session store at {}", path.display()))?;
        Some(Arc::new(store))
    } else {
        None
    };

    let model: Arc<dyn ModelClient> = Arc::new(caseforge_llm::create_retrying_client(&config));
    info!(model = model.name(), "Model client ready");

    let mut generator = TestCaseGenerator::new(config, model);
    if let Some(store) = store {
        generator = generator.with_store(store);
    }

    // Ctrl-C stops the run at the next stage boundary
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("Interrupted, finishing the current stage");
        cancel_clone.cancel();
    });

    match cli.command {
        Commands::Run {
            files,
            standards,
            output,
        } => {
            let documents = files
                .iter()
                .map(|path| read_document(path))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let result = generator
                .process_documents_with_cancel(documents, standards, &cancel)
                .await?;
            emit_result(&result, output.as_deref())?;
        }
        Commands::Resume { session_id, output } => {
            let result = generator
                .resume(&SessionId::from_str(&session_id), &cancel)
                .await?;
            emit_result(&result, output.as_deref())?;
        }
        Commands::Status { session_id } => {
            let summary = generator
                .session_status(&SessionId::from_str(&session_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Sessions => {
            let sessions = generator.list_sessions().await?;
            if sessions.is_empty() {
                println!("No sessions.");
            }
            for s in sessions {
                println!(
                    "{}  {:<12} {:<22} reqs={:<4} cases={:<4} updated={}",
                    s.session_id,
                    s.status.as_str(),
                    s.current_stage.map(|st| st.as_str()).unwrap_or("-"),
                    s.requirements,
                    s.test_cases,
                    s.updated_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        Commands::Delete { session_id } => {
            let session_id = SessionId::from_str(&session_id);
            if generator.delete_session(&session_id).await? {
                println!("Deleted session {}.", session_id);
            } else {
                anyhow::bail!("no stored session {}", session_id);
            }
        }
        Commands::Cleanup => {
            let removed = generator.cleanup_expired_sessions().await?;
            println!("Removed {} expired session(s).", removed);
        }
        Commands::Config | Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Load the config file, or fall back to a model picked from provider API key variables.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    let home_config = dirs_home().map(|h| h.join(".caseforge").join("config.toml"));
    if let Some(home_config) = home_config.filter(|p| p.exists()) {
        info!(path = %home_config.display(), "Loading config from home directory");
        return Ok(AppConfig::load(&home_config)?);
    }

    warn!(path = %path.display(), "No config file found, configuring from environment");
    create_env_config()
}

fn create_env_config() -> anyhow::Result<AppConfig> {
    let candidates = [
        ("ANTHROPIC_API_KEY", "anthropic", "claude-sonnet-4-20250514"),
        ("OPENAI_API_KEY", "openai", "gpt-4o"),
        ("GEMINI_API_KEY", "gemini", "gemini-2.0-flash"),
    ];
    let (key, provider, model_id) = candidates
        .iter()
        .find_map(|(var, provider, model_id)| {
            std::env::var(var).ok().map(|key| (key, *provider, *model_id))
        })
        .context(
            "no config file and no ANTHROPIC_API_KEY, OPENAI_API_KEY or GEMINI_API_KEY set",
        )?;

    let mut config = AppConfig::for_model(provider, model_id);
    config.model.api_key = Some(key);
    config.apply_env_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

fn read_document(path: &Path) -> anyhow::Result<InputDocument> {
    let content =
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(InputDocument::new(filename, content))
}

/// Write the result as JSON and print a one-line summary to stderr.
fn emit_result(result: &ProcessingResult, output: Option<&Path>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?
        }
        None => println!("{}", json),
    }

    let quality = result
        .quality_scores
        .as_ref()
        .map(|q| if q.quality_passed { "passed" } else { "below thresholds" })
        .unwrap_or("not scored");
    eprintln!(
        "Session {}: {} ({} requirements, {} test cases, quality {}, {} log entries)",
        result.session_id,
        result.status,
        result.requirements.len(),
        result.test_cases.len(),
        quality,
        result.errors.len(),
    );
    if !result.success {
        anyhow::bail!("run did not complete successfully");
    }
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
