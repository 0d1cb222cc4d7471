// Contract refresh: pull field contracts from live sources into the registry.

use std::sync::Arc;

use futures::future::join_all;

use crate::error::AppError;
use crate::models::FieldContract;
use crate::services::sources::{AdapterSet, SourceAdapter};
use crate::services::SchemaRegistry;

/// Outcome of refreshing one source.
#[derive(Debug)]
pub struct RefreshReport {
    pub source_id: String,
    pub result: Result<Vec<Arc<FieldContract>>, AppError>,
}

impl RefreshReport {
    /// Tables whose contract version moved past 1, i.e. changed since first registration.
    pub fn changed_tables(&self) -> Vec<&str> {
        match &self.result {
            Ok(contracts) => contracts
                .iter()
                .filter(|c| c.version > 1)
                .map(|c| c.table.as_str())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Introspect one source and upsert every contract it reports.
///
/// Unchanged tables keep their version; the registry only bumps on a hash change.
pub async fn refresh_source(
    registry: &SchemaRegistry,
    source_id: &str,
    adapter: &dyn SourceAdapter,
) -> Result<Vec<Arc<FieldContract>>, AppError> {
    adapter
        .connect()
        .await
        .map_err(|e| AppError::Connection(format!("{}: {}", source_id, e)))?;
    let contracts = adapter
        .introspect(source_id)
        .await
        .map_err(|e| AppError::Connection(format!("{}: {}", source_id, e)))?;

    let mut stored = Vec::with_capacity(contracts.len());
    for contract in contracts {
        let table = contract.table.clone();
        stored.push(registry.upsert_fields(source_id, &table, contract).await?);
    }
    tracing::info!(source_id, tables = stored.len(), "refreshed field contracts");
    Ok(stored)
}

/// Refresh every source with an adapter, concurrently. One failure does not stop the others.
pub async fn refresh_all(registry: &SchemaRegistry, adapters: &AdapterSet) -> Vec<RefreshReport> {
    let mut ids: Vec<String> = adapters.source_ids().map(str::to_string).collect();
    ids.sort();

    let tasks = ids.into_iter().filter_map(|source_id| {
        let adapter = adapters.get(&source_id)?;
        Some(async move {
            let result = refresh_source(registry, &source_id, adapter.as_ref()).await;
            if let Err(e) = &result {
                tracing::warn!(source_id = %source_id, error = %e, "contract refresh failed");
            }
            RefreshReport { source_id, result }
        })
    });
    join_all(tasks).await
}
