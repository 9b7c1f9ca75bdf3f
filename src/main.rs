mod config;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tripwire_action::{ActionExecutor, TaskRegistry};
use tripwire_condition::ConditionEvaluator;
use tripwire_engine::{Controller, TriggerService, WorkerStatus, documents};
use tripwire_source::{InMemoryEventLog, TopicAdmin};
use tripwire_store::{SqliteTriggerStore, TriggerStore};
use tripwire_trigger::TriggerDef;

use crate::config::Config;

/// Tripwire - event-driven triggers for multi-tenant workspaces
#[derive(Parser)]
#[command(name = "tripwire")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.tripwire)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Path to a JSON config file (default: <data-dir>/config.json, if present)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Manage workspaces
  Workspace {
    #[command(subcommand)]
    action: WorkspaceAction,
  },

  /// Manage a workspace's triggers
  Triggers {
    #[command(subcommand)]
    action: TriggersAction,
  },

  /// Feed JSON-lines events from stdin through a workspace worker
  Run {
    workspace: String,
  },
}

#[derive(Subcommand)]
enum WorkspaceAction {
  /// Provision a workspace
  Create { workspace: String },
}

#[derive(Subcommand)]
enum TriggersAction {
  /// Register triggers from a JSON file (one object or an array)
  Add { workspace: String, file: PathBuf },

  /// List registered triggers
  List { workspace: String },

  /// Show one trigger
  Get { workspace: String, trigger_id: String },

  /// Remove one trigger
  Delete { workspace: String, trigger_id: String },
}

/// One line of `run` input.
#[derive(Deserialize)]
struct EventInput {
  source: String,
  #[serde(default)]
  key: Option<String>,
  #[serde(default)]
  payload: serde_json::Value,
}

fn main() -> Result<()> {
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr),
    )
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let cli = Cli::parse();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".tripwire"),
  };
  let config = Config::load(cli.config.as_deref(), &data_dir)?;

  let Some(command) = cli.command else {
    println!("tripwire - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async {
    let store = open_store(&config, &data_dir).await?;
    match command {
      Commands::Workspace {
        action: WorkspaceAction::Create { workspace },
      } => {
        store
          .create_workspace(&workspace)
          .await
          .with_context(|| format!("failed to create workspace '{}'", workspace))?;
        eprintln!("Workspace '{}' ready", workspace);
        Ok(())
      }
      Commands::Triggers { action } => triggers(Arc::new(store), action).await,
      Commands::Run { workspace } => run(Arc::new(store), &config, &workspace).await,
    }
  })
}

async fn open_store(config: &Config, data_dir: &Path) -> Result<SqliteTriggerStore> {
  let path = config.database_path(data_dir);
  if let Some(parent) = path.parent() {
    tokio::fs::create_dir_all(parent)
      .await
      .with_context(|| format!("failed to create directory: {}", parent.display()))?;
  }

  let options = SqliteConnectOptions::new()
    .filename(&path)
    .create_if_missing(true);
  let pool = SqlitePoolOptions::new()
    .connect_with(options)
    .await
    .with_context(|| format!("failed to open database: {}", path.display()))?;

  let store = SqliteTriggerStore::new(pool);
  store.migrate().await.context("failed to migrate database")?;
  Ok(store)
}

async fn triggers(store: Arc<dyn TriggerStore>, action: TriggersAction) -> Result<()> {
  let service = TriggerService::new(store);

  match action {
    TriggersAction::Add { workspace, file } => {
      let content = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("failed to read trigger file: {}", file.display()))?;
      let defs = parse_trigger_defs(&content)
        .with_context(|| format!("failed to parse trigger file: {}", file.display()))?;

      let report = service
        .add_triggers(&workspace, defs)
        .await
        .context("failed to commit triggers")?;

      let output: serde_json::Map<String, serde_json::Value> = report
        .into_iter()
        .map(|(index, outcome)| {
          let value = match outcome {
            Ok(id) => serde_json::json!({"trigger_id": id}),
            Err(e) => serde_json::json!({"error": e.to_string()}),
          };
          (index.to_string(), value)
        })
        .collect();
      println!("{}", serde_json::to_string_pretty(&output)?);
    }
    TriggersAction::List { workspace } => {
      let triggers = service.list_triggers(&workspace).await?;
      println!("{}", serde_json::to_string_pretty(&triggers)?);
    }
    TriggersAction::Get {
      workspace,
      trigger_id,
    } => {
      let trigger = service.get_trigger(&workspace, &trigger_id).await?;
      println!("{}", serde_json::to_string_pretty(&trigger)?);
    }
    TriggersAction::Delete {
      workspace,
      trigger_id,
    } => {
      service.delete_trigger(&workspace, &trigger_id).await?;
      eprintln!("Deleted trigger '{}'", trigger_id);
    }
  }

  Ok(())
}

fn parse_trigger_defs(content: &str) -> Result<Vec<TriggerDef>> {
  let value: serde_json::Value = serde_json::from_str(content)?;
  let defs = match value {
    serde_json::Value::Array(_) => serde_json::from_value(value)?,
    other => vec![serde_json::from_value(other)?],
  };
  Ok(defs)
}

async fn run(store: Arc<dyn TriggerStore>, config: &Config, workspace: &str) -> Result<()> {
  let log = InMemoryEventLog::new();
  let topic = config.worker.topic(workspace);
  log
    .create_topic(&topic, config.partitions)
    .await
    .with_context(|| format!("failed to create topic '{}'", topic))?;

  let controller = Controller::new(
    store.clone(),
    Arc::new(log.clone()),
    ConditionEvaluator::default(),
    ActionExecutor::new(TaskRegistry::with_builtins(), config.executor.clone()),
    config.worker.clone(),
  );
  controller
    .start(workspace, config.credentials.clone())
    .await
    .with_context(|| format!("failed to start worker for '{}'", workspace))?;

  // Last published offset per partition.
  let mut published: HashMap<u32, u64> = HashMap::new();
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    let line = tokio::select! {
      line = lines.next_line() => line.context("failed to read stdin")?,
      _ = tokio::signal::ctrl_c() => {
        controller.shutdown().await;
        return Ok(());
      }
    };
    let Some(line) = line else { break };
    if line.trim().is_empty() {
      continue;
    }

    let input: EventInput = serde_json::from_str(&line)
      .with_context(|| format!("failed to parse event: {}", line))?;
    let position = log
      .publish(&topic, &input.source, input.key.as_deref(), input.payload)
      .await?;
    published.insert(position.partition, position.offset);
  }
  info!(events = published.values().map(|o| o + 1).sum::<u64>(), "input drained");

  loop {
    let mut caught_up = true;
    for (&partition, &offset) in &published {
      if log.committed_offset(workspace, &topic, partition).await < Some(offset + 1) {
        caught_up = false;
      }
    }
    if caught_up {
      break;
    }
    if let Some(WorkerStatus::Failed(reason)) = controller.status(workspace).await {
      controller.shutdown().await;
      anyhow::bail!("worker for '{}' failed: {}", workspace, reason);
    }

    tokio::select! {
      _ = tokio::time::sleep(Duration::from_millis(50)) => {}
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  controller.shutdown().await;

  let instances = store.get(workspace, documents::INSTANCES).await?;
  println!("{}", serde_json::to_string_pretty(&instances)?);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_single_and_array() {
    let single = parse_trigger_defs(r#"{"trigger_id": "a", "condition": {"kind": "always"}}"#).unwrap();
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].trigger_id.as_deref(), Some("a"));

    let many = parse_trigger_defs(
      r#"[
        {"trigger_id": "a", "condition": {"kind": "always"}},
        {"transient": true, "condition": {"kind": "event-match", "source": "orders"}}
      ]"#,
    )
    .unwrap();
    assert_eq!(many.len(), 2);
    assert!(many[1].transient);
  }

  #[test]
  fn test_event_input_defaults() {
    let input: EventInput = serde_json::from_str(r#"{"source": "orders"}"#).unwrap();
    assert_eq!(input.source, "orders");
    assert!(input.key.is_none());
    assert!(input.payload.is_null());
  }
}
