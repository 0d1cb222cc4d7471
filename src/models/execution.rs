use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::models::{ContractVersion, Plan};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded | OperationStatus::Failed | OperationStatus::Skipped
        )
    }
}

/// Rows returned by an adapter for one fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationOutput {
    pub rows: Vec<serde_json::Value>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub from_cache: bool,
}

impl OperationOutput {
    pub fn new(rows: Vec<serde_json::Value>, execution_time_ms: u64) -> Self {
        Self {
            row_count: rows.len(),
            rows,
            execution_time_ms,
            from_cache: false,
        }
    }
}

/// Contract version recorded by the plan versus the registry's at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriftNotice {
    pub planned: Option<ContractVersion>,
    pub current: Option<ContractVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationRecord {
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OperationOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftNotice>,
}

impl Default for OperationRecord {
    fn default() -> Self {
        Self {
            status: OperationStatus::Pending,
            output: None,
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
            skip_reason: None,
            drift: None,
        }
    }
}

impl OperationRecord {
    pub fn mark_running(&mut self) {
        self.status = OperationStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_succeeded(&mut self, output: Option<OperationOutput>, attempts: u32) {
        self.status = OperationStatus::Succeeded;
        self.output = output;
        self.attempts = attempts;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: ExecutionError, attempts: u32) {
        self.status = OperationStatus::Failed;
        self.error = Some(error);
        self.attempts = attempts;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = OperationStatus::Skipped;
        self.skip_reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    SchemaDrift,
    OperationFailed,
    OperationSkipped,
    EmptyFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Warning {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn for_operation(operation_id: impl Into<String>, kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            operation_id: Some(operation_id.into()),
            kind,
            message: message.into(),
        }
    }
}

/// State of one plan run. Written only by the executor's scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub run_id: String,
    pub plan_id: String,
    pub operations: BTreeMap<String, OperationRecord>,
    pub warnings: Vec<Warning>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn for_plan(plan: &Plan) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            plan_id: plan.id().to_string(),
            operations: plan
                .operations()
                .iter()
                .map(|op| (op.id.clone(), OperationRecord::default()))
                .collect(),
            warnings: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn get(&self, operation_id: &str) -> Option<&OperationRecord> {
        self.operations.get(operation_id)
    }

    pub fn status(&self, operation_id: &str) -> Option<OperationStatus> {
        self.get(operation_id).map(|r| r.status)
    }

    pub(crate) fn entry(&mut self, operation_id: &str) -> &mut OperationRecord {
        self.operations.entry(operation_id.to_string()).or_default()
    }

    pub fn warn(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    pub fn all_terminal(&self) -> bool {
        self.operations.values().all(|r| r.status.is_terminal())
    }

    pub fn count(&self, status: OperationStatus) -> usize {
        self.operations.values().filter(|r| r.status == status).count()
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
