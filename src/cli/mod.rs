use crate::backend::StdioBackendFactory;
use crate::capability::Fqdn;
use crate::config::{Config, load_config};
use crate::embedding::Embedder;
use crate::errors::GatewayResult;
use crate::runtime::CoreRuntime;
use crate::sandbox::DisabledSandbox;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "toolweave")]
#[command(about = "Intelligent MCP gateway: capability matching and controlled DAG execution")]
#[command(version = crate::VERSION)]
pub struct Cli {
    /// Path to config.json (defaults to the toolweave home directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (HTTP by default)
    Serve {
        /// Speak newline-delimited JSON-RPC on stdin/stdout instead of HTTP
        #[arg(long)]
        stdio: bool,
        /// Override the database path (`:memory:` for ephemeral runs)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Show runtime status (store counts, graph size, cache stats)
    Status,
    /// Inspect learned capabilities
    Capability {
        #[command(subcommand)]
        cmd: CapabilityCommands,
    },
}

#[derive(Subcommand)]
enum CapabilityCommands {
    /// List capabilities by recency
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one capability by FQDN (4- or 5-part)
    Show { fqdn: String },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { stdio, db } => {
            if let Some(db) = db {
                config.storage.db_path = Some(db);
            }
            let runtime = build_runtime(config)?;
            if stdio {
                crate::gateway::stdio::run(runtime).await
            } else {
                crate::gateway::serve(runtime).await
            }
        }
        Commands::Status => {
            let runtime = build_runtime(config)?;
            let health = runtime.health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
        Commands::Capability { cmd } => {
            let runtime = build_runtime(config)?;
            match cmd {
                CapabilityCommands::List { limit } => {
                    let capabilities = runtime.store.list(limit, 0)?;
                    if capabilities.is_empty() {
                        println!("No capabilities learned yet.");
                        return Ok(());
                    }
                    for cap in capabilities {
                        println!(
                            "{}  success={:.2}  used={}  avg={:.0}ms",
                            cap.fqdn, cap.success_rate, cap.usage_count, cap.avg_duration_ms
                        );
                    }
                    Ok(())
                }
                CapabilityCommands::Show { fqdn } => {
                    let fqdn = Fqdn::parse(&fqdn)?;
                    match runtime.store.find_by_fqdn(&fqdn)? {
                        Some(cap) => {
                            println!("fqdn:         {}", cap.fqdn);
                            println!("id:           {}", cap.id);
                            println!("code_hash:    {}", cap.code_hash);
                            println!("success_rate: {:.3}", cap.success_rate);
                            println!(
                                "usage:        {} ({} ok)",
                                cap.usage_count, cap.success_count
                            );
                            println!("tools:        {:?}", cap.tools_used);
                            println!("---\n{}", cap.code_snippet);
                        }
                        None => println!("No capability named {fqdn}"),
                    }
                    Ok(())
                }
            }
        }
    }
}

fn build_runtime(mut config: Config) -> GatewayResult<Arc<CoreRuntime>> {
    let embedder = make_embedder(&mut config)?;
    let factory = Arc::new(StdioBackendFactory::new(config.servers.clone()));
    CoreRuntime::new(config, embedder, factory, Arc::new(DisabledSandbox))
}

#[cfg(feature = "embeddings")]
fn make_embedder(config: &mut Config) -> GatewayResult<Arc<dyn Embedder>> {
    let embedder = crate::embedding::LocalEmbedder::new(&config.embedding.model)
        .map_err(crate::errors::GatewayError::Internal)?;
    // The scorer's input layout is sized from this; keep them in lockstep.
    config.embedding.dimension = embedder.dimension();
    Ok(Arc::new(embedder))
}

#[cfg(not(feature = "embeddings"))]
fn make_embedder(config: &mut Config) -> GatewayResult<Arc<dyn Embedder>> {
    tracing::warn!(
        "built without the 'embeddings' feature; using hashed embeddings (no semantic matching)"
    );
    Ok(Arc::new(crate::embedding::HashEmbedder::new(
        config.embedding.dimension,
    )))
}
