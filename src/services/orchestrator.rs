// Query orchestration: classify, plan, execute, aggregate.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::AppError;
use crate::models::{ExecutionRecord, Plan, ResultRow, Warning};
use crate::services::aggregator::aggregate;
use crate::services::generation::{QueryGenerator, SourceClassifier};
use crate::services::planner::{PlanDiagnostics, Planner};
use crate::services::result_cache::ResultCache;
use crate::services::sources::AdapterSet;
use crate::services::{Executor, SchemaRegistry};

/// Everything produced while answering one question.
#[derive(Debug, Clone)]
pub struct QueryAnswer {
    pub plan: Plan,
    pub diagnostics: PlanDiagnostics,
    pub record: ExecutionRecord,
    pub rows: Vec<ResultRow>,
    /// Run warnings followed by aggregation warnings.
    pub warnings: Vec<Warning>,
    pub elapsed_ms: u64,
}

/// Caller-facing view of an answer.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerSummary {
    pub plan_id: String,
    pub run_id: String,
    pub rows: Vec<serde_json::Value>,
    pub row_count: usize,
    pub warnings: Vec<Warning>,
    pub elapsed_ms: u64,
}

impl QueryAnswer {
    pub fn summary(&self) -> AnswerSummary {
        AnswerSummary {
            plan_id: self.plan.id().to_string(),
            run_id: self.record.run_id.clone(),
            rows: self.rows.iter().map(ResultRow::to_json).collect(),
            row_count: self.rows.len(),
            warnings: self.warnings.clone(),
            elapsed_ms: self.elapsed_ms,
        }
    }
}

pub struct QueryOrchestrator {
    registry: Arc<SchemaRegistry>,
    classifier: Arc<dyn SourceClassifier>,
    planner: Planner,
    executor: Executor,
    max_parallelism: usize,
}

impl QueryOrchestrator {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        classifier: Arc<dyn SourceClassifier>,
        planner: Planner,
        executor: Executor,
    ) -> Self {
        Self {
            registry,
            classifier,
            planner,
            executor,
            max_parallelism: 4,
        }
    }

    /// Wire planner, executor and result cache from loaded configuration.
    pub fn from_config(
        config: &Config,
        registry: Arc<SchemaRegistry>,
        classifier: Arc<dyn SourceClassifier>,
        generator: Arc<dyn QueryGenerator>,
        adapters: AdapterSet,
    ) -> Self {
        let planner = Planner::from_config(&config.planner, registry.clone(), generator);
        let mut executor = Executor::from_config(&config.executor, adapters, registry.clone());
        if let Some(cache) = ResultCache::from_config(&config.cache) {
            executor = executor.with_cache(Arc::new(cache));
        }
        Self::new(registry, classifier, planner, executor).with_max_parallelism(config.executor.max_parallelism)
    }

    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism.max(1);
        self
    }

    pub async fn answer(&self, question: &str) -> Result<QueryAnswer, AppError> {
        self.answer_with_cancel(question, CancellationToken::new()).await
    }

    /// Answer a question end to end
    ///
    /// # Arguments
    /// * `question` - Natural-language question
    /// * `cancel` - Cancels in-flight fetches and skips anything not yet started
    pub async fn answer_with_cancel(&self, question: &str, cancel: CancellationToken) -> Result<QueryAnswer, AppError> {
        let start_time = Instant::now();

        let candidates = self.classifier.candidate_sources(question, &self.registry).await;
        tracing::debug!(candidates = candidates.len(), "classified question");

        let (plan, diagnostics) = self.planner.create_plan(question, &candidates).await?;
        let record = self
            .executor
            .execute_plan_with_cancel(&plan, self.max_parallelism, cancel)
            .await?;
        let output = aggregate(&record, &plan)?;

        let mut warnings = record.warnings.clone();
        warnings.extend(output.warnings);
        let elapsed_ms = start_time.elapsed().as_millis() as u64;

        tracing::info!(
            plan_id = %plan.id(),
            run_id = %record.run_id,
            rows = output.rows.len(),
            warnings = warnings.len(),
            elapsed_ms,
            "answered question"
        );

        Ok(QueryAnswer {
            plan,
            diagnostics,
            record,
            rows: output.rows,
            warnings,
            elapsed_ms,
        })
    }
}
