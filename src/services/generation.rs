// Query generation and candidate-source classification seams used by the planner.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::models::{FieldContract, FieldRole, JoinMode, QueryPayload, SourceDescriptor, SourceKind};
use crate::services::SchemaRegistry;

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct GenerationError(pub String);

/// How a draft's output combines with the drafts folded before it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CombineHint {
    Join {
        left_key: String,
        right_key: String,
        #[serde(default)]
        mode: JoinMode,
    },
    Union,
}

/// Untrusted output of query generation for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDraft {
    pub table: String,
    pub fields: Vec<String>,
    pub payload: QueryPayload,
    pub combine: Option<CombineHint>,
}

/// Bounded schema summary for one candidate source.
#[derive(Debug, Clone)]
pub struct SchemaContext {
    pub source: SourceDescriptor,
    pub contracts: Vec<Arc<FieldContract>>,
    pub summary: String,
    /// Violations from a previous attempt, present only when regenerating.
    pub feedback: Vec<String>,
}

const TRUNCATION_MARKER: &str = "  ... (truncated)\n";

impl SchemaContext {
    pub fn build(source: SourceDescriptor, contracts: Vec<Arc<FieldContract>>, budget: usize) -> Self {
        let summary = summarize(&source, &contracts, budget);
        Self {
            source,
            contracts,
            summary,
            feedback: Vec::new(),
        }
    }

    pub fn with_feedback(mut self, feedback: Vec<String>) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn contract(&self, table: &str) -> Option<&Arc<FieldContract>> {
        self.contracts.iter().find(|c| c.table == table)
    }
}

/// Render contracts line by line, stopping before `budget` bytes.
fn summarize(source: &SourceDescriptor, contracts: &[Arc<FieldContract>], budget: usize) -> String {
    let mut lines = Vec::new();
    let mut header = format!("Source: {} ({})", source.id, source.kind);
    if let Some(description) = &source.description {
        header.push_str(&format!(" - {}", description));
    }
    lines.push(format!("{}\n", header));
    lines.push("Tables:\n".to_string());
    for contract in contracts {
        lines.push(format!("  - {} (v{})\n", contract.table, contract.version));
        for field in &contract.fields {
            let mut line = format!("      * {} ({})", field.name, field.semantic_type);
            match field.role {
                FieldRole::Key => line.push_str(" [KEY]"),
                FieldRole::Timestamp => line.push_str(" [TIMESTAMP]"),
                FieldRole::Value => {}
            }
            if !field.nullable {
                line.push_str(" [NOT NULL]");
            }
            line.push('\n');
            lines.push(line);
        }
    }

    let total: usize = lines.iter().map(String::len).sum();
    if total <= budget {
        return lines.concat();
    }

    let mut summary = String::new();
    let limit = budget.saturating_sub(TRUNCATION_MARKER.len());
    for line in &lines {
        if summary.len() + line.len() > limit {
            break;
        }
        summary.push_str(line);
    }
    if summary.len() + TRUNCATION_MARKER.len() <= budget {
        summary.push_str(TRUNCATION_MARKER);
    }
    summary
}

/// Opaque "generate a query for source X" capability.
#[async_trait::async_trait]
pub trait QueryGenerator: Send + Sync {
    async fn generate(
        &self,
        question: &str,
        context: &SchemaContext,
        kind: SourceKind,
    ) -> Result<OperationDraft, GenerationError>;
}

/// Picks which registered sources a question should be planned against.
#[async_trait::async_trait]
pub trait SourceClassifier: Send + Sync {
    async fn candidate_sources(&self, question: &str, registry: &SchemaRegistry) -> Vec<SourceDescriptor>;
}

/// Scores enabled sources by word overlap between the question and each
/// source's id, description, tables and fields.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    max_sources: usize,
}

impl KeywordClassifier {
    pub fn new(max_sources: usize) -> Self {
        Self { max_sources: max_sources.max(1) }
    }

    fn score(words: &HashSet<String>, source: &SourceDescriptor, contracts: &[Arc<FieldContract>]) -> usize {
        let mut vocabulary: Vec<String> = tokenize(&source.id);
        if let Some(description) = &source.description {
            vocabulary.extend(tokenize(description));
        }
        for contract in contracts {
            vocabulary.extend(tokenize(&contract.table));
            for field in &contract.fields {
                vocabulary.extend(tokenize(&field.name));
            }
        }
        let vocabulary: HashSet<String> = vocabulary.into_iter().collect();
        words.iter().filter(|w| vocabulary.contains(*w)).count()
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Lowercased alphanumeric words of 3+ chars, with a trailing plural `s` dropped.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(|w| {
            let w = w.to_lowercase();
            match w.strip_suffix('s') {
                Some(stem) if stem.chars().count() >= 3 && !stem.ends_with('s') => stem.to_string(),
                _ => w,
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl SourceClassifier for KeywordClassifier {
    async fn candidate_sources(&self, question: &str, registry: &SchemaRegistry) -> Vec<SourceDescriptor> {
        let words: HashSet<String> = tokenize(question).into_iter().collect();
        let mut scored: Vec<(usize, SourceDescriptor)> = registry
            .list_sources()
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| {
                let contracts = registry.contracts_for(&s.id);
                (Self::score(&words, &s, &contracts), s)
            })
            .filter(|(score, _)| *score > 0)
            .collect();

        scored.sort_by(|(a_score, a), (b_score, b)| {
            b_score
                .cmp(a_score)
                .then(b.priority.cmp(&a.priority))
                .then(a.id.cmp(&b.id))
        });

        tracing::debug!(
            candidates = ?scored.iter().map(|(score, s)| (s.id.as_str(), *score)).collect::<Vec<_>>(),
            "classified candidate sources"
        );

        scored
            .into_iter()
            .take(self.max_sources)
            .map(|(_, s)| s)
            .collect()
    }
}
