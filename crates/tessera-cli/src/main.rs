//! CLI entry point applying JSON mutation bundles to the knowledge graph.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing_subscriber::{fmt, EnvFilter};

use tessera_core::config::EngineConfig;
use tessera_core::{Attributes, EditInput, SchemaRegistry};
use tessera_engine::{MergeOptions, MutationEngine};
use tessera_store::{GraphClient, GraphConfig, IndexStore, MemoryIndex, Neo4jIndex};
use tessera_stream::{EventPublisher, JournalStream, MemoryStream};

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Apply mutations to the Tessera knowledge graph")]
struct Cli {
    /// Config file prefix (default: tessera).
    #[arg(short, long, default_value = "tessera", global = true)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply a JSON array of commands in order.
    Apply {
        /// Bundle file.
        #[arg(short, long)]
        file: PathBuf,

        #[arg(long, value_enum, default_value_t = Backend::Memory)]
        backend: Backend,

        /// Journal directory; events stay in memory when absent.
        #[arg(long)]
        journal: Option<PathBuf>,
    },
    /// Print the effective schema definition.
    Schema,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Memory,
    Neo4j,
}

/// One entry of a mutation bundle.
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum BundleCommand {
    CreateEntity {
        entity_type: String,
        #[serde(default)]
        input: Attributes,
    },
    CreateRelation {
        relationship_type: String,
        input: Attributes,
    },
    Update {
        id: String,
        inputs: Vec<EditInput>,
    },
    Merge {
        target_id: String,
        source_ids: Vec<String>,
        #[serde(default)]
        chosen_fields: BTreeMap<String, String>,
    },
    Delete {
        id: String,
    },
}

impl BundleCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::CreateEntity { .. } => "create_entity",
            Self::CreateRelation { .. } => "create_relation",
            Self::Update { .. } => "update",
            Self::Merge { .. } => "merge",
            Self::Delete { .. } => "delete",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = EngineConfig::load(&cli.config)?;
    let schema = Arc::new(load_schema(&config)?);

    match cli.command {
        Command::Schema => {
            println!("{}", serde_json::to_string_pretty(schema.definition())?);
        }
        Command::Apply {
            file,
            backend,
            journal,
        } => {
            let commands = read_bundle(&file)?;
            let store = open_store(backend, &config).await?;
            let publisher = open_publisher(journal.as_deref())?;
            let engine = MutationEngine::builder(store, publisher)
                .schema(schema)
                .config(config)
                .build();
            apply(&engine, commands).await?;
        }
    }

    Ok(())
}

fn load_schema(config: &EngineConfig) -> anyhow::Result<SchemaRegistry> {
    match &config.schema_path {
        Some(path) => {
            tracing::info!(path = %path, "Loading schema definition");
            Ok(SchemaRegistry::load(path)?)
        }
        None => Ok(SchemaRegistry::builtin()),
    }
}

fn read_bundle(path: &Path) -> anyhow::Result<Vec<BundleCommand>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read bundle {}: {e}", path.display()))?;
    Ok(serde_json::from_str(&raw)?)
}

async fn open_store(backend: Backend, config: &EngineConfig) -> anyhow::Result<Arc<dyn IndexStore>> {
    match backend {
        Backend::Memory => Ok(Arc::new(MemoryIndex::new())),
        Backend::Neo4j => {
            let client = GraphClient::connect(&GraphConfig::from(&config.neo4j)).await?;
            client.ensure_schema().await?;
            Ok(Arc::new(Neo4jIndex::new(client)))
        }
    }
}

fn open_publisher(journal: Option<&Path>) -> anyhow::Result<Arc<dyn EventPublisher>> {
    match journal {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "Journaling events");
            Ok(Arc::new(JournalStream::open(dir)?))
        }
        None => Ok(Arc::new(MemoryStream::new())),
    }
}

/// Run every command in order, stopping on the first failure.
async fn apply(engine: &MutationEngine, commands: Vec<BundleCommand>) -> anyhow::Result<()> {
    let total = commands.len();
    for (position, command) in commands.into_iter().enumerate() {
        let name = command.name();
        match run(engine, command).await {
            Ok(result) => println!("{}", json!({"command": name, "ok": true, "result": result})),
            Err(e) => {
                println!(
                    "{}",
                    json!({
                        "command": name,
                        "ok": false,
                        "kind": format!("{:?}", e.kind()),
                        "retryable": e.is_retryable(),
                        "error": e.to_string(),
                    })
                );
                anyhow::bail!("Command {} of {total} ({name}) failed: {e}", position + 1);
            }
        }
    }
    tracing::info!(commands = total, "Bundle applied");
    Ok(())
}

async fn run(engine: &MutationEngine, command: BundleCommand) -> tessera_engine::Result<Value> {
    let value = match command {
        BundleCommand::CreateEntity { entity_type, input } => {
            let outcome = engine.create_entity(&entity_type, input).await?;
            json!({
                "id": outcome.element.internal_id,
                "standard_id": outcome.element.standard_id,
                "upserted": outcome.upserted,
            })
        }
        BundleCommand::CreateRelation {
            relationship_type,
            input,
        } => {
            let outcome = engine.create_relation(&relationship_type, input).await?;
            json!({
                "id": outcome.element.internal_id,
                "standard_id": outcome.element.standard_id,
                "upserted": outcome.upserted,
            })
        }
        BundleCommand::Update { id, inputs } => {
            let result = engine.update_attribute(&id, inputs).await?;
            json!({
                "id": result.element.internal_id,
                "changes": result.changes,
                "merged_into": result.merged_into,
            })
        }
        BundleCommand::Merge {
            target_id,
            source_ids,
            chosen_fields,
        } => {
            let options = MergeOptions { chosen_fields };
            let merged = engine.merge_entities(&target_id, &source_ids, &options).await?;
            json!({
                "id": merged.internal_id,
                "standard_id": merged.standard_id,
                "merged": source_ids.len(),
            })
        }
        BundleCommand::Delete { id } => {
            let outcome = engine.delete_element(&id).await?;
            json!({
                "id": outcome.element.internal_id,
                "dependencies": outcome.dependencies.len(),
            })
        }
    };
    Ok(value)
}
