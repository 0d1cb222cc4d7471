use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ExecutionRecord, SemanticType};

/// Per-operation mismatch between a plan and the registry's current contracts.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("unknown source '{source_id}'")]
    UnknownSource { source_id: String },

    #[error("source '{source_id}' is disabled")]
    SourceDisabled { source_id: String },

    #[error("no field contract registered for {source_id}.{table}")]
    MissingContract { source_id: String, table: String },

    #[error("field '{field}' does not exist in {source_id}.{table}")]
    UnknownField {
        source_id: String,
        table: String,
        field: String,
    },

    #[error("field '{field}' declared as {declared} but {source_id}.{table} has {actual}")]
    FieldTypeMismatch {
        source_id: String,
        table: String,
        field: String,
        declared: SemanticType,
        actual: SemanticType,
    },

    #[error("join key '{key}' is missing from input '{input}'")]
    MissingJoinKey { input: String, key: String },

    #[error("join keys '{left_key}' ({left_type}) and '{right_key}' ({right_type}) are not comparable")]
    IncompatibleKeyTypes {
        left_key: String,
        left_type: SemanticType,
        right_key: String,
        right_type: SemanticType,
    },

    #[error("union inputs share no fields: {inputs:?}")]
    DisjointUnion { inputs: Vec<String> },

    #[error("aggregate references unknown field '{field}'")]
    UnknownAggregateField { field: String },

    #[error("payload rejected: {message}")]
    InvalidPayload { message: String },
}

/// A validation failure attributed to a single operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub operation_id: String,
    pub error: ValidationError,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation_id, self.error)
    }
}

#[derive(Debug, Clone, Error)]
pub enum PlanningError {
    #[error("no candidate sources supplied for question")]
    NoCandidateSources,

    #[error("none of the candidate sources can be planned against: {0}")]
    NoUsableSources(String),

    #[error("query generation failed for source '{source_id}': {message}")]
    Generation { source_id: String, message: String },

    #[error("malformed operation '{operation_id}': {reason}")]
    MalformedOperation { operation_id: String, reason: String },

    #[error("malformed plan: {0}")]
    MalformedPlan(String),

    #[error("plan still has {} violation(s) after repair", .violations.len())]
    Unrepairable { violations: Vec<Violation> },
}

/// Adapter-level failure, classified by the adapter that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("retryable failure: {0}")]
    Retryable(String),

    #[error("fatal failure: {0}")]
    Fatal(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The contract changed after planning and the operation no longer validates.
    #[error("contract drift: {0}")]
    ContractDrift(String),
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::Retryable(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::Retryable(_) => "EXECUTION_RETRYABLE",
            ExecutionError::Fatal(_) => "EXECUTION_FATAL",
            ExecutionError::Cancelled(_) => "EXECUTION_CANCELLED",
            ExecutionError::ContractDrift(_) => "EXECUTION_CONTRACT_DRIFT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    #[error("cannot coerce {from} value to {to}")]
    UnsupportedCoercion {
        from: SemanticType,
        to: SemanticType,
    },

    #[error("invalid {to} value '{value}': {reason}")]
    InvalidValue {
        value: String,
        to: SemanticType,
        reason: String,
    },

    #[error("operation '{operation_id}' input '{input}' has a row without key field '{field}'")]
    MissingKeyField {
        operation_id: String,
        input: String,
        field: String,
    },

    #[error("join key types {left} and {right} are not comparable")]
    IncomparableKeys {
        left: SemanticType,
        right: SemanticType,
    },

    #[error("operation '{operation_id}' has no usable result")]
    MissingResult { operation_id: String },

    #[error("operation '{operation_id}' produced a non-object row")]
    MalformedRow { operation_id: String },
}

/// Terminal failure of a run: the operation bound to `final_output` failed or was skipped.
#[derive(Debug, Error)]
#[error("final output '{operation_id}' did not complete: {message}")]
pub struct RunFailure {
    pub operation_id: String,
    pub code: String,
    pub message: String,
    /// Everything that completed before the run was abandoned.
    pub record: Box<ExecutionRecord>,
}

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Execution error: {0}")]
    Run(#[from] RunFailure),

    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Query generation error: {0}")]
    Generation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Structured, user-visible description of a failed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub details: Vec<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            operation_id: None,
            details: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }
}

impl AppError {
    pub fn detail(&self) -> ErrorDetail {
        let message = self.to_string();
        match self {
            AppError::Planning(PlanningError::Unrepairable { violations }) => {
                let mut detail = ErrorDetail::new("PLAN_UNREPAIRABLE", message)
                    .with_details(violations.iter().map(|v| v.to_string()).collect());
                if let Some(first) = violations.first() {
                    detail = detail.with_operation(first.operation_id.clone());
                }
                detail
            }
            AppError::Planning(PlanningError::MalformedOperation { operation_id, .. }) => {
                ErrorDetail::new("MALFORMED_OPERATION", message).with_operation(operation_id.clone())
            }
            AppError::Planning(PlanningError::Generation { .. }) => {
                ErrorDetail::new("GENERATION_FAILED", message)
            }
            AppError::Planning(_) => ErrorDetail::new("PLANNING_ERROR", message),
            AppError::Run(failure) => ErrorDetail::new(failure.code.clone(), message)
                .with_operation(failure.operation_id.clone())
                .with_details(
                    failure
                        .record
                        .warnings
                        .iter()
                        .map(|w| w.message.clone())
                        .collect(),
                ),
            AppError::Aggregation(err) => {
                let detail = ErrorDetail::new("AGGREGATION_ERROR", message);
                match err {
                    AggregationError::MissingKeyField { operation_id, .. }
                    | AggregationError::MissingResult { operation_id }
                    | AggregationError::MalformedRow { operation_id } => {
                        detail.with_operation(operation_id.clone())
                    }
                    _ => detail,
                }
            }
            AppError::Storage(_) => ErrorDetail::new("STORAGE_ERROR", message),
            AppError::Connection(_) => ErrorDetail::new("CONNECTION_ERROR", message),
            AppError::Validation(_) => ErrorDetail::new("VALIDATION_ERROR", message),
            AppError::Generation(_) => ErrorDetail::new("GENERATION_FAILED", message),
            AppError::Config(_) => ErrorDetail::new("CONFIG_ERROR", message),
            AppError::NotFound(_) => ErrorDetail::new("NOT_FOUND", message),
            AppError::Internal(_) => ErrorDetail::new("INTERNAL_ERROR", message),
        }
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Convert rusqlite::Error to AppError
impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Storage(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrepairable_detail_lists_mismatches() {
        let error = AppError::Planning(PlanningError::Unrepairable {
            violations: vec![Violation {
                operation_id: "fetch_orders".to_string(),
                error: ValidationError::UnknownField {
                    source_id: "orders".to_string(),
                    table: "orders".to_string(),
                    field: "amount".to_string(),
                },
            }],
        });

        let detail = error.detail();
        assert_eq!(detail.code, "PLAN_UNREPAIRABLE");
        assert_eq!(detail.operation_id.as_deref(), Some("fetch_orders"));
        assert_eq!(detail.details.len(), 1);
        assert!(detail.details[0].contains("amount"));
    }

    #[test]
    fn test_execution_error_classification() {
        assert!(ExecutionError::Retryable("reset".into()).is_retryable());
        assert!(!ExecutionError::Fatal("denied".into()).is_retryable());
        assert!(!ExecutionError::Cancelled("run".into()).is_retryable());
        assert!(!ExecutionError::ContractDrift("gone".into()).is_retryable());
        assert_eq!(ExecutionError::ContractDrift("gone".into()).code(), "EXECUTION_CONTRACT_DRIFT");
        assert_eq!(ExecutionError::Fatal("x".into()).code(), "EXECUTION_FATAL");
    }

    #[test]
    fn test_error_detail_serialization_skips_empty() {
        let detail = ErrorDetail::new("TEST_CODE", "Test message");
        let json = serde_json::to_value(&detail).unwrap();
        assert!(json.get("operation_id").is_none());
        assert!(json.get("details").is_none());
    }
}
