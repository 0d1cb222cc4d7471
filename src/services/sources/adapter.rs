// Source adapter trait: the uniform capability every backing store exposes to the core.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ExecutionError;
use crate::models::{FieldContract, OperationOutput, QueryPayload, SourceKind};

/// Connect / introspect / execute, implemented once per source type.
///
/// Adapters classify their own failures: anything worth retrying (dropped
/// connections, timeouts, throttling) is `ExecutionError::Retryable`.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Check that the source is reachable.
    async fn connect(&self) -> Result<(), ExecutionError>;

    /// Current contract of every table or collection the source exposes.
    async fn introspect(&self, source_id: &str) -> Result<Vec<FieldContract>, ExecutionError>;

    /// Run one fetch payload. Dropping the future cancels the call.
    async fn execute(
        &self,
        payload: &QueryPayload,
        timeout: Duration,
    ) -> Result<OperationOutput, ExecutionError>;
}

/// Adapters keyed by source id.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source_id: impl Into<String>, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(source_id.into(), adapter);
    }

    pub fn with(mut self, source_id: impl Into<String>, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.insert(source_id, adapter);
        self
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(source_id).cloned()
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&str> = self.source_ids().collect();
        ids.sort_unstable();
        f.debug_struct("AdapterSet").field("sources", &ids).finish()
    }
}
