use std::sync::Arc;

use tracing::{error, info, warn};

use query_orchestrator::config::Config;
use query_orchestrator::services::introspection::refresh_all;
use query_orchestrator::services::sources::{create_adapter, AdapterSet};
use query_orchestrator::services::{
    ConnectionPoolManager, KeywordClassifier, LlmQueryGenerator, QueryOrchestrator, SchemaRegistry,
};
use query_orchestrator::storage::SqliteStorage;

/// Refresh field contracts for every configured source, then answer the
/// question given on the command line, if any.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.logging.level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(config.logging.style != "never")
        .init();

    let storage = Arc::new(SqliteStorage::new(&config.registry.url).await.map_err(|e| {
        error!("Failed to open registry database: {}", e);
        e
    })?);
    let registry = Arc::new(SchemaRegistry::open(storage).await?);

    let pools = ConnectionPoolManager::from_config(&config.executor);
    let mut adapters = AdapterSet::new();
    for source_config in &config.sources {
        let source = match source_config.to_descriptor() {
            Ok(source) => source,
            Err(e) => {
                warn!("Skipping source '{}': {}", source_config.id, e);
                continue;
            }
        };
        registry.upsert_source(source.clone()).await?;
        match create_adapter(&source, &pools, config.executor.row_limit).await {
            Ok(adapter) => adapters.insert(source.id.clone(), adapter),
            Err(e) => warn!("No adapter for source '{}': {}", source.id, e),
        }
    }

    for report in refresh_all(&registry, &adapters).await {
        match &report.result {
            Ok(contracts) => info!(
                "{}: {} tables, changed: {:?}",
                report.source_id,
                contracts.len(),
                report.changed_tables()
            ),
            Err(e) => error!("{}: {}", report.source_id, e),
        }
    }

    let question = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if question.trim().is_empty() {
        return Ok(());
    }

    let orchestrator = QueryOrchestrator::from_config(
        &config,
        registry.clone(),
        Arc::new(KeywordClassifier::default()),
        Arc::new(LlmQueryGenerator::new(&config)),
        adapters,
    );
    let answer = orchestrator.answer(&question).await.map_err(|e| {
        error!("Query failed: {}", e);
        e
    })?;
    println!("{}", serde_json::to_string_pretty(&answer.summary())?);

    Ok(())
}
