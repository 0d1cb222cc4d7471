// Scripted adapters, generators and registry fixtures shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value as Json;

use crate::error::ExecutionError;
use crate::models::{
    FieldContract, FieldSpec, OperationOutput, QueryPayload, SemanticType, SourceDescriptor, SourceKind,
};
use crate::services::generation::{GenerationError, OperationDraft, QueryGenerator, SchemaContext};
use crate::services::sources::SourceAdapter;
use crate::services::SchemaRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start(String),
    End(String),
}

/// Ordered start/end events across every adapter sharing the log.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl EventLog {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn start(&self, name: &str) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.events.lock().unwrap().push(Event::Start(name.to_string()));
    }

    fn end(&self, name: &str) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(Event::End(name.to_string()));
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Highest number of adapter calls observed in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Adapter answering from a script; once the script is drained, every call gets `fallback`.
pub struct MockAdapter {
    name: String,
    kind: SourceKind,
    contracts: Vec<FieldContract>,
    script: Mutex<VecDeque<Result<Vec<Json>, ExecutionError>>>,
    fallback: Result<Vec<Json>, ExecutionError>,
    delay: Duration,
    calls: AtomicUsize,
    log: Arc<EventLog>,
}

impl MockAdapter {
    fn with_fallback(name: &str, fallback: Result<Vec<Json>, ExecutionError>) -> Self {
        Self {
            name: name.to_string(),
            kind: SourceKind::Relational,
            contracts: Vec::new(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            log: EventLog::shared(),
        }
    }

    pub fn rows(name: &str, rows: Vec<Json>) -> Self {
        Self::with_fallback(name, Ok(rows))
    }

    pub fn failing(name: &str, error: ExecutionError) -> Self {
        Self::with_fallback(name, Err(error))
    }

    pub fn then(self, result: Result<Vec<Json>, ExecutionError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_kind(mut self, kind: SourceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_contracts(mut self, contracts: Vec<FieldContract>) -> Self {
        self.contracts = contracts;
        self
    }

    pub fn with_log(mut self, log: Arc<EventLog>) -> Self {
        self.log = log;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait::async_trait]
impl SourceAdapter for MockAdapter {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn connect(&self) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn introspect(&self, source_id: &str) -> Result<Vec<FieldContract>, ExecutionError> {
        Ok(self
            .contracts
            .iter()
            .cloned()
            .map(|mut c| {
                c.source_id = source_id.to_string();
                c
            })
            .collect())
    }

    async fn execute(&self, _payload: &QueryPayload, _timeout: Duration) -> Result<OperationOutput, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.start(&self.name);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        let result = next.unwrap_or_else(|| self.fallback.clone());
        self.log.end(&self.name);
        result.map(|rows| OperationOutput::new(rows, self.delay.as_millis() as u64))
    }
}

/// Generator answering per source id; unknown sources fail generation.
#[derive(Default)]
pub struct MockGenerator {
    drafts: Mutex<HashMap<String, VecDeque<OperationDraft>>>,
    feedback: Mutex<Vec<(String, Vec<String>)>>,
}

impl MockGenerator {
    /// Queue a draft for `source_id`; the last queued draft repeats.
    pub fn draft(self, source_id: &str, draft: OperationDraft) -> Self {
        self.drafts
            .lock()
            .unwrap()
            .entry(source_id.to_string())
            .or_default()
            .push_back(draft);
        self
    }

    /// Feedback seen by regeneration requests, per source.
    pub fn feedback(&self) -> Vec<(String, Vec<String>)> {
        self.feedback.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl QueryGenerator for MockGenerator {
    async fn generate(
        &self,
        _question: &str,
        context: &SchemaContext,
        _kind: SourceKind,
    ) -> Result<OperationDraft, GenerationError> {
        let source_id = context.source.id.clone();
        if !context.feedback.is_empty() {
            self.feedback
                .lock()
                .unwrap()
                .push((source_id.clone(), context.feedback.clone()));
        }
        let mut drafts = self.drafts.lock().unwrap();
        let queue = drafts
            .get_mut(&source_id)
            .ok_or_else(|| GenerationError(format!("no draft for {}", source_id)))?;
        match queue.len() {
            0 => Err(GenerationError(format!("no draft for {}", source_id))),
            1 => Ok(queue[0].clone()),
            _ => Ok(queue.pop_front().unwrap()),
        }
    }
}

pub fn sql_draft(table: &str, fields: &[&str], sql: &str) -> OperationDraft {
    OperationDraft {
        table: table.to_string(),
        fields: fields.iter().map(|f| f.to_string()).collect(),
        payload: QueryPayload::Sql(sql.to_string()),
        combine: None,
    }
}

pub fn users_contract() -> FieldContract {
    FieldContract::new(
        "crm",
        "users",
        vec![
            FieldSpec::key("id", SemanticType::Integer),
            FieldSpec::new("name", SemanticType::Text),
            FieldSpec::new("region", SemanticType::Text),
        ],
    )
}

pub fn orders_contract() -> FieldContract {
    FieldContract::new(
        "billing",
        "orders",
        vec![
            FieldSpec::key("id", SemanticType::Integer),
            FieldSpec::new("amt", SemanticType::Integer),
        ],
    )
}

/// Registry with `crm.users` and `billing.orders` at version 1.
pub async fn crm_and_billing() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::in_memory();
    registry
        .upsert_source(SourceDescriptor::new("crm", SourceKind::Relational, "mock://crm").with_description("customer accounts"))
        .await
        .unwrap();
    registry
        .upsert_source(SourceDescriptor::new("billing", SourceKind::Relational, "mock://billing").with_description("orders and payments"))
        .await
        .unwrap();
    registry.upsert_fields("crm", "users", users_contract()).await.unwrap();
    registry.upsert_fields("billing", "orders", orders_contract()).await.unwrap();
    Arc::new(registry)
}
