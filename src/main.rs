use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use scriptorium::config::{self, ScriptoriumConfig};
use scriptorium::router::Router;
use scriptorium::{cli, server, CoreError};

#[derive(Parser)]
#[command(
    name = "scriptorium",
    version,
    about = "Offline retrieval and explicit, reversible memory for local AI assistants"
)]
struct Cli {
    /// Config file (default: ~/.scriptorium/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a file or directory (.jsonl, .json, STIX bundle, .txt, .md)
    Ingest {
        path: String,
        /// Source for every loaded document (wikipedia, mitre_attack, arxiv, other)
        #[arg(long)]
        source: Option<String>,
    },
    /// Retrieve ranked passages from the corpus
    Query {
        text: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        source: Option<String>,
    },
    /// Inspect and manage session memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
    /// Assemble a token-budgeted context bundle for an inference call
    Context {
        text: String,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        budget: Option<usize>,
        /// Print the rendered inference prompt instead of the bundle summary
        #[arg(long)]
        prompt: bool,
    },
    /// Remove a document with its chunks and index entries
    Purge { document_id: String },
    /// Show corpus statistics
    Stats,
    /// Check database health and index consistency
    Doctor {
        /// Rebuild the lexical and vector indexes from chunks
        #[arg(long)]
        repair: bool,
    },
    /// Start the MCP server
    Serve {
        /// stdio or http (default from config)
        #[arg(long)]
        transport: Option<String>,
    },
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Show a session's records, most recent first
    Show {
        session: String,
        #[arg(long)]
        limit: Option<usize>,
        /// Include tombstoned records
        #[arg(long)]
        all: bool,
        #[arg(long)]
        contains: Option<String>,
    },
    /// Append a record (role: user, assistant, pinned-fact)
    Add {
        session: String,
        content: String,
        #[arg(long, default_value = "user")]
        role: String,
    },
    /// Tombstone every live record in a session
    Clear { session: String },
    /// Restore tombstoned records that were not compacted
    Restore { session: String },
    /// Tombstone one record by id or every record containing a keyword
    Forget {
        session: String,
        #[arg(long, conflicts_with = "keyword", required_unless_present = "keyword")]
        id: Option<String>,
        #[arg(long)]
        keyword: Option<String>,
    },
    /// Permanently delete tombstoned records
    Compact { session: Option<String> },
    /// List sessions with record counts
    Sessions,
    /// Show the mutation log of a session
    History { session: String },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.scriptorium/models/
    Download,
}

/// Exit code for a command line clap rejected: 0 for `--help`/`--version`,
/// 1 for usage errors. 2 stays reserved for storage failures.
fn usage_exit_code(err: &clap::Error) -> u8 {
    if err.use_stderr() {
        1
    } else {
        0
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(usage_exit_code(&e));
        }
    };

    let config = match &cli.config {
        Some(path) => ScriptoriumConfig::load_from(path),
        None => ScriptoriumConfig::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(1);
        }
    };

    // Log to stderr so stdout stays clean for MCP JSON-RPC and --json output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<CoreError>()
                .map(CoreError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli, config: ScriptoriumConfig) -> Result<()> {
    if let Command::Model { action: ModelAction::Download } = &cli.command {
        return cli::model_download(&config.embedding).await;
    }

    let json = cli.json;
    let default_session = config.memory.default_session.clone();
    let transport = config.server.transport.clone();
    let router = Router::open(config)?;

    match cli.command {
        Command::Ingest { path, source } => {
            let path = config::expand_tilde(&path);
            cli::corpus::ingest(&router, &path.to_string_lossy(), source.as_deref(), json).await?
        }
        Command::Query { text, top_k, source } => {
            cli::corpus::query(&router, &text, top_k, source.as_deref(), json).await?
        }
        Command::Memory { action } => match action {
            MemoryAction::Show {
                session,
                limit,
                all,
                contains,
            } => {
                cli::memory::show(&router, &session, limit, all, contains.as_deref(), json).await?
            }
            MemoryAction::Add {
                session,
                content,
                role,
            } => cli::memory::add(&router, &session, &role, &content).await?,
            MemoryAction::Clear { session } => cli::memory::clear(&router, &session).await?,
            MemoryAction::Restore { session } => cli::memory::restore(&router, &session).await?,
            MemoryAction::Forget {
                session,
                id,
                keyword,
            } => cli::memory::forget(&router, &session, id.as_deref(), keyword.as_deref()).await?,
            MemoryAction::Compact { session } => {
                cli::memory::compact(&router, session.as_deref()).await?
            }
            MemoryAction::Sessions => cli::memory::sessions(&router, json).await?,
            MemoryAction::History { session } => {
                cli::memory::history(&router, &session, json).await?
            }
        },
        Command::Context {
            text,
            session,
            budget,
            prompt,
        } => {
            let session = session.unwrap_or(default_session);
            cli::context::context(&router, &text, &session, budget, prompt, json).await?
        }
        Command::Purge { document_id } => cli::corpus::purge(&router, &document_id).await?,
        Command::Stats => cli::corpus::stats(&router, json).await?,
        Command::Doctor { repair } => cli::doctor::doctor(&router, repair).await?,
        Command::Serve { transport: choice } => {
            match choice.as_deref().unwrap_or(transport.as_str()) {
                "stdio" => server::serve_stdio(router).await?,
                "http" | "sse" => server::serve_http(router).await?,
                other => anyhow::bail!("unknown transport {other:?} (expected stdio or http)"),
            }
        }
        Command::Model { .. } => unreachable!("handled before the router is opened"),
    }

    Ok(())
}
