//! Subcommand handlers.

use crate::{Commands, ConfigAction, RecordAction};
use anyhow::Context;
use labfeed_core::config::{LabfeedConfig, WORKSPACE_CONFIG_FILE, load_config};
use labfeed_core::{
    ChangeFeed, ChangeRelay, Collection, Dashboard, DocumentStore, QueryService, Recorder,
    RelayState, SqliteStore,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Handle a subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace, config_path),
        Commands::Serve {
            host,
            port,
            static_dir,
        } => {
            let mut config = load(workspace, config_path)?;
            apply_serve_overrides(&mut config, host, port, static_dir);
            handle_serve(config, workspace).await
        }
        Commands::Init => handle_init(&load(workspace, config_path)?, workspace).await,
        Commands::Record { action } => {
            handle_record(action, &load(workspace, config_path)?, workspace).await
        }
        Commands::Watch => handle_watch(&load(workspace, config_path)?, workspace).await,
    }
}

fn load(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<LabfeedConfig> {
    load_config(Some(workspace), config_path)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn apply_serve_overrides(
    config: &mut LabfeedConfig,
    host: Option<String>,
    port: Option<u16>,
    static_dir: Option<PathBuf>,
) {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if static_dir.is_some() {
        config.server.static_dir = static_dir;
    }
}

/// The SQLite store, with a relative path resolved against the workspace.
fn open_store(config: &LabfeedConfig, workspace: &Path) -> Arc<dyn DocumentStore> {
    let mut store_config = config.store.clone();
    if store_config.path.is_relative() {
        store_config.path = workspace.join(&store_config.path);
    }
    Arc::new(SqliteStore::from_config(&store_config))
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let path = workspace.join(WORKSPACE_CONFIG_FILE);
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            let toml_str = toml::to_string_pretty(&LabfeedConfig::default())?;
            std::fs::write(&path, &toml_str)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, config_path)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

async fn handle_serve(config: LabfeedConfig, workspace: &Path) -> anyhow::Result<()> {
    let store = open_store(&config, workspace);
    labfeed_core::serve(&config, store, shutdown_signal())
        .await
        .context("Server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn handle_init(config: &LabfeedConfig, workspace: &Path) -> anyhow::Result<()> {
    let store = open_store(config, workspace);
    store
        .open_session()
        .await?
        .ensure_collections()
        .await
        .context("Failed to create collections")?;
    println!("Store ready with collections:");
    for collection in Collection::ALL {
        println!(
            "  {:<16} -> {}",
            collection,
            config.store.collections.name(collection)
        );
    }
    Ok(())
}

fn parse_json(label: &str, raw: Option<String>) -> anyhow::Result<Value> {
    match raw {
        Some(text) => serde_json::from_str(&text).with_context(|| format!("--{label} is not valid JSON")),
        None => Ok(Value::Object(Default::default())),
    }
}

async fn handle_record(
    action: RecordAction,
    config: &LabfeedConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    let store = open_store(config, workspace);
    store.open_session().await?.ensure_collections().await?;
    let recorder = Recorder::new(store);

    let id = match action {
        RecordAction::Experiment { meta } => {
            recorder.add_experiment(parse_json("meta", meta)?).await?
        }
        RecordAction::Transformation {
            experiment,
            version_name,
            data,
        } => {
            recorder
                .add_transformation(&experiment, &version_name, parse_json("data", data)?)
                .await?
        }
        RecordAction::Test {
            experiment,
            run_version,
            data,
        } => {
            recorder
                .add_test(&experiment, &run_version, parse_json("data", data)?)
                .await?
        }
        RecordAction::Analytics { experiment, data } => {
            recorder
                .add_analytics(&experiment, parse_json("data", data)?)
                .await?
        }
    };
    println!("{id}");
    Ok(())
}

async fn handle_watch(config: &LabfeedConfig, workspace: &Path) -> anyhow::Result<()> {
    let store = open_store(config, workspace);
    store.open_session().await?.ensure_collections().await?;
    let query = QueryService::new(Arc::clone(&store));
    let relay = ChangeRelay::new(store);

    // Subscribe before listing so nothing written in between is missed.
    let (tx, mut rx) = mpsc::channel(config.server.feed_buffer);
    let mut connection = relay.attach(tx).await;
    if connection.state() == RelayState::Closed {
        anyhow::bail!("Could not subscribe to the store");
    }

    let mut dashboard = Dashboard::new();
    if let Some(id) = dashboard.load(query.list_experiments().await?) {
        if let Some(detail) = query.get_experiment(&id).await? {
            dashboard.apply_detail(detail);
        }
    }
    println!("{}", summarize(&dashboard));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            feed = rx.recv() => match feed {
                Some(feed) => {
                    if dashboard.apply_change(&feed) {
                        println!("{}", describe_change(&feed));
                    }
                }
                None => break,
            },
            _ = &mut ctrl_c => break,
        }
    }

    connection.close().await;
    Ok(())
}

fn summarize(dashboard: &Dashboard) -> String {
    let mut out = format!("{} experiment(s)", dashboard.experiments().len());
    if let Some(view) = dashboard.selected() {
        out.push_str(&format!(", selected {}", view.id().unwrap_or("?")));
        if let Some(t) = view.selected_transformation() {
            out.push_str(&format!(", transformation {}", id_of(t)));
        }
        if let Some(test) = view.selected_test() {
            out.push_str(&format!(", test {} ({})", id_of(test), verdict(test)));
        }
    }
    out
}

fn describe_change(feed: &ChangeFeed) -> String {
    let Value::Object(row) = &feed.value else {
        return format!("[{}] (no value)", feed.table);
    };
    let id = id_of(row);
    match (feed.table, labfeed_core::types::experiment_ref(row)) {
        (Collection::Tests, Some(exp)) => {
            format!("[{}] {} for {} {}", feed.table, id, exp, verdict(row))
        }
        (_, Some(exp)) => format!("[{}] {} for {}", feed.table, id, exp),
        (_, None) => format!("[{}] {}", feed.table, id),
    }
}

fn id_of(doc: &labfeed_core::Document) -> &str {
    labfeed_core::types::document_id(doc).unwrap_or("?")
}

fn verdict(test: &labfeed_core::Document) -> &'static str {
    if Dashboard::test_successful(test) {
        "passed"
    } else {
        "failed"
    }
}
