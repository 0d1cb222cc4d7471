pub mod adapter;
pub mod postgresql;

pub use adapter::*;
pub use postgresql::*;

use std::sync::Arc;

use crate::error::AppError;
use crate::models::{SourceDescriptor, SourceKind};
use crate::services::connection_pool::{mask_credentials, ConnectionPoolManager};

/// Build the adapter for a registered source from its connection reference.
pub async fn create_adapter(
    source: &SourceDescriptor,
    pools: &ConnectionPoolManager,
    row_limit: u64,
) -> Result<Arc<dyn SourceAdapter>, AppError> {
    match source.kind {
        SourceKind::Relational
            if source.connection_ref.starts_with("postgres://")
                || source.connection_ref.starts_with("postgresql://") =>
        {
            let pool = pools.get_or_create_pool(&source.connection_ref).await?;
            let adapter = PostgresAdapter::new(pool, &source.connection_ref, row_limit)?;
            Ok(Arc::new(adapter))
        }
        kind => Err(AppError::Config(format!(
            "no adapter available for {} source '{}' at {}",
            kind,
            source.id,
            mask_credentials(&source.connection_ref)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsupported_source_kind_is_a_config_error() {
        let pools = ConnectionPoolManager::new();
        let source = SourceDescriptor::new("events", SourceKind::MessageLog, "kafka://user:pw@broker:9092");
        let err = match create_adapter(&source, &pools, 100).await {
            Err(err) => err,
            Ok(_) => panic!("message log sources have no adapter"),
        };
        assert!(matches!(err, AppError::Config(_)));
        assert!(!err.to_string().contains("pw"));
    }

    #[tokio::test]
    async fn test_postgres_source_gets_pooled_adapter() {
        let pools = ConnectionPoolManager::new();
        let source = SourceDescriptor::new("crm", SourceKind::Relational, "postgres://u:p@localhost:5432/crm");
        let adapter = create_adapter(&source, &pools, 100).await.unwrap();
        assert_eq!(adapter.kind(), SourceKind::Relational);
        assert_eq!(pools.pool_count().await, 1);
    }
}
