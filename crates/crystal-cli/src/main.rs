//! `crystal` CLI: a thin front-end over the capability interface, runnable
//! end-to-end against either a local embedded store or a remote HTTPS
//! facade (spec §3 "Supplemented features").

#![deny(unsafe_code)]

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crystal_core::config::{Overrides, NoSecretLookup};
use crystal_core::{ChunkInput, MemoryCategory, QueryFilter, Role};
use crystal_cli::{Capability, LocalCapability, RemoteCapability};
use crystal_embed::{GoogleConfig, OllamaConfig, OpenAiConfig, Provider};

#[derive(Parser, Debug)]
#[command(name = "crystal", about = "Memory Crystal capability CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hybrid search over captured chunks.
    Search {
        query: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        source_type: Option<String>,
    },
    /// Record an explicit Memory fact.
    Remember {
        text: String,
        #[arg(long, default_value = "fact")]
        category: String,
    },
    /// Deprecate a Memory fact by id.
    Forget { id: i64 },
    /// Print a store-wide status snapshot.
    Status,
    /// Ingest a single piece of text as a chunk.
    Ingest {
        text: String,
        #[arg(long, default_value = "manual")]
        source_type: String,
        #[arg(long, default_value = "cli")]
        source_id: String,
        #[arg(long, default_value = "user")]
        role: String,
    },
    /// Print the chunker's output for a piece of text.
    ChunkText { text: String },
    /// Walk a directory collection and ingest changed files.
    SyncCollection {
        name: String,
        root: std::path::PathBuf,
        #[arg(long)]
        include: Vec<String>,
        #[arg(long)]
        ignore: Vec<String>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

fn init_logging() {
    let fmt_layer = fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn build_embedder(config: &crystal_core::Config) -> (Provider, String) {
    match config.embedding_provider {
        crystal_core::EmbeddingProvider::OpenAi => {
            let mut cfg = OpenAiConfig::default();
            if let Some(key) = &config.embedding_api_key {
                cfg.api_key = key.clone();
            }
            if let Some(model) = &config.embedding_model {
                cfg.model = model.clone();
            }
            (Provider::OpenAi(cfg), "openai".to_string())
        }
        crystal_core::EmbeddingProvider::Ollama => {
            let mut cfg = OllamaConfig::default();
            if let Some(host) = &config.embedding_local_host {
                cfg.host = host.clone();
            }
            if let Some(model) = &config.embedding_model {
                cfg.model = model.clone();
            }
            (Provider::Ollama(cfg), "ollama".to_string())
        }
        crystal_core::EmbeddingProvider::Google => {
            let mut cfg = GoogleConfig::default();
            if let Some(key) = &config.embedding_api_key {
                cfg.api_key = key.clone();
            }
            if let Some(model) = &config.embedding_model {
                cfg.model = model.clone();
            }
            (Provider::Google(cfg), "google".to_string())
        }
    }
}

/// Selects the local or remote capability variant: remote when
/// `CRYSTAL_REMOTE=1` and a relay URL/token are configured, local
/// otherwise (spec §9 "Construction selects a variant by configuration").
fn build_capability(config: &crystal_core::Config) -> anyhow::Result<Capability> {
    let want_remote = std::env::var("CRYSTAL_REMOTE").as_deref() == Ok("1");
    if want_remote {
        let url = config.relay_url.clone().ok_or_else(|| anyhow::anyhow!("CRYSTAL_RELAY_URL not set"))?;
        let token = config.relay_token.clone().ok_or_else(|| anyhow::anyhow!("CRYSTAL_RELAY_TOKEN not set"))?;
        return Ok(Capability::Remote(RemoteCapability::new(url, token)?));
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let store_path = crystal_core::config::store_path(&config.data_dir);
    let store = crystal_store::Store::open(&store_path)?;
    let (embedder, provider_name) = build_embedder(config);
    Ok(Capability::Local(LocalCapability::new(config, store, embedder, provider_name)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let config = crystal_core::config::resolve(Overrides::default(), &NoSecretLookup)?;
    let capability = build_capability(&config)?;

    match cli.cmd {
        Command::Search { query, limit, agent, source_type } => {
            let filter = QueryFilter { agent_id: agent, source_type };
            let results = capability.search(&query, limit, filter).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Command::Remember { text, category } => {
            let category: MemoryCategory = category.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let id = capability.remember(&text, category).await?;
            match id {
                Some(id) => println!("remembered as memory {id}"),
                None => println!("private mode active; no-op"),
            }
        }
        Command::Forget { id } => {
            let ok = capability.forget(id).await?;
            println!("{}", if ok { "deprecated" } else { "not found or private mode active" });
        }
        Command::Status => {
            let status = capability.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Ingest { text, source_type, source_id, role } => {
            let role: Role = role.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let candidate = ChunkInput { text, role, source_type, source_id, agent_id: config.agent_id.clone() };
            let inserted = capability.ingest(&[candidate]).await?;
            println!("inserted {inserted} chunk(s)");
        }
        Command::ChunkText { text } => {
            let chunks = capability.chunk_text(&text).await?;
            println!("{}", serde_json::to_string_pretty(&chunks)?);
        }
        Command::SyncCollection { name, root, include, ignore, dry_run } => {
            let store_path = crystal_core::config::store_path(&config.data_dir);
            let store = crystal_store::Store::open(&store_path)?;
            let (embedder, _) = build_embedder(&config);
            let outcome =
                crystal_collections::sync_collection(&store, &embedder, &name, &root, &include, &ignore, dry_run)
                    .await?;
            println!("{outcome:?}");
        }
    }

    Ok(())
}
