// Plan executor
//
// One scheduler loop owns the execution record. Operations are admitted as
// soon as every input is terminal; fetches run as their own tasks holding a
// semaphore permit, so at most `max_parallelism` adapter calls are in flight.
// Join, union and aggregate steps are marked complete here and evaluated
// later by the aggregator.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorConfig;
use crate::error::{ExecutionError, RunFailure};
use crate::models::{
    DriftNotice, ExecutionRecord, InputFallback, Operation, OperationOutput, OperationStatus,
    OperationStep, Plan, QueryPayload, Warning, WarningKind,
};
use crate::services::result_cache::ResultCache;
use crate::services::retry::{RetryDisposition, RetryError, RetryPolicy};
use crate::services::schema_registry::ValidationReport;
use crate::services::sources::{AdapterSet, SourceAdapter};
use crate::services::SchemaRegistry;

type TaskOutcome = (usize, Result<(OperationOutput, u32), RetryError<ExecutionError>>);

pub struct Executor {
    adapters: AdapterSet,
    registry: Arc<SchemaRegistry>,
    cache: Option<Arc<ResultCache>>,
    retry: RetryPolicy,
    operation_timeout: Duration,
}

impl Executor {
    pub fn new(adapters: AdapterSet, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            adapters,
            registry,
            cache: None,
            retry: RetryPolicy::default(),
            operation_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &ExecutorConfig, adapters: AdapterSet, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            retry: RetryPolicy::from_config(config),
            operation_timeout: config.operation_timeout(),
            ..Self::new(adapters, registry)
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    /// Run every operation of `plan`. Fails only when `final_output` does not succeed.
    pub async fn execute_plan(&self, plan: &Plan, max_parallelism: usize) -> Result<ExecutionRecord, RunFailure> {
        self.execute_plan_with_cancel(plan, max_parallelism, CancellationToken::new())
            .await
    }

    /// Like [`Executor::execute_plan`], stopping early when `cancel` fires: in-flight
    /// calls fail as cancelled and operations not yet started are skipped.
    pub async fn execute_plan_with_cancel(
        &self,
        plan: &Plan,
        max_parallelism: usize,
        cancel: CancellationToken,
    ) -> Result<ExecutionRecord, RunFailure> {
        let run_token = cancel.child_token();
        let max_parallelism = max_parallelism.clamp(1, Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(max_parallelism));
        let mut record = ExecutionRecord::for_plan(plan);
        let mut remaining = plan.in_degrees();
        let mut ready: VecDeque<usize> = plan
            .topological_order()
            .into_iter()
            .filter(|&i| remaining[i] == 0)
            .collect();
        let mut in_flight: JoinSet<TaskOutcome> = JoinSet::new();
        let mut tasks: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut cache_keys: HashMap<usize, String> = HashMap::new();
        // Current contracts checked against the plan, computed on the first drift
        let mut revalidation: Option<ValidationReport> = None;

        tracing::info!(
            plan_id = %plan.id(),
            run_id = %record.run_id,
            operations = plan.len(),
            max_parallelism,
            "executing plan"
        );

        loop {
            let mut deferred = VecDeque::new();
            while let Some(idx) = ready.pop_front() {
                let op = &plan.operations()[idx];

                if run_token.is_cancelled() {
                    record.entry(&op.id).mark_skipped("run cancelled");
                    release_dependents(plan, idx, &mut remaining, &mut ready);
                    continue;
                }

                if let Some(reason) = blocked_by_inputs(plan, idx, &record) {
                    tracing::warn!(operation_id = %op.id, reason = %reason, "skipping operation");
                    record.entry(&op.id).mark_skipped(reason);
                    release_dependents(plan, idx, &mut remaining, &mut ready);
                    continue;
                }

                let OperationStep::Fetch {
                    source_id,
                    table,
                    payload,
                    ..
                } = &op.step
                else {
                    let entry = record.entry(&op.id);
                    entry.mark_running();
                    entry.mark_succeeded(None, 1);
                    release_dependents(plan, idx, &mut remaining, &mut ready);
                    continue;
                };

                if record.get(&op.id).is_some_and(|r| r.drift.is_none())
                    && self.check_drift(plan, op, source_id, table, &mut record)
                {
                    let report = revalidation.get_or_insert_with(|| self.registry.validate(plan));
                    let problems: Vec<String> = report.for_operation(&op.id).map(|v| v.error.to_string()).collect();
                    if !problems.is_empty() {
                        let error = ExecutionError::ContractDrift(format!(
                            "{}.{} no longer matches the plan: {}",
                            source_id,
                            table,
                            problems.join("; ")
                        ));
                        tracing::error!(operation_id = %op.id, error = %error, "operation invalidated by contract drift");
                        record.entry(&op.id).mark_failed(error, 0);
                        release_dependents(plan, idx, &mut remaining, &mut ready);
                        continue;
                    }
                }

                let Some(adapter) = self.adapters.get(source_id) else {
                    let error = ExecutionError::Fatal(format!("no adapter registered for source '{}'", source_id));
                    tracing::error!(operation_id = %op.id, source_id = %source_id, "no adapter for source");
                    record.entry(&op.id).mark_failed(error, 0);
                    release_dependents(plan, idx, &mut remaining, &mut ready);
                    continue;
                };

                let cache_key = self.cache.as_ref().map(|_| {
                    let hash = self
                        .registry
                        .current_version(source_id, table)
                        .map(|v| v.content_hash)
                        .unwrap_or_default();
                    ResultCache::key(source_id, payload, &hash)
                });
                if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
                    if let Some(output) = cache.get(key) {
                        tracing::debug!(operation_id = %op.id, rows = output.row_count, "served from result cache");
                        let entry = record.entry(&op.id);
                        entry.mark_running();
                        entry.mark_succeeded(Some(output), 0);
                        release_dependents(plan, idx, &mut remaining, &mut ready);
                        continue;
                    }
                }

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    deferred.push_back(idx);
                    continue;
                };

                tracing::info!(operation_id = %op.id, source_id = %source_id, table = %table, "dispatching operation");
                record.entry(&op.id).mark_running();
                if let Some(key) = cache_key {
                    cache_keys.insert(idx, key);
                }

                let task = run_fetch(
                    op.id.clone(),
                    adapter,
                    payload.clone(),
                    self.retry.clone(),
                    self.operation_timeout,
                    run_token.clone(),
                );
                let handle = in_flight.spawn(async move {
                    let _permit = permit;
                    (idx, task.await)
                });
                tasks.insert(handle.id(), idx);
            }
            ready = deferred;

            if in_flight.is_empty() {
                if ready.is_empty() {
                    break;
                }
                continue;
            }

            let Some(joined) = in_flight.join_next().await else {
                continue;
            };
            let (idx, outcome) = match joined {
                Ok(done) => {
                    tasks.retain(|_, i| *i != done.0);
                    done
                }
                Err(join_error) => {
                    let Some(idx) = tasks.remove(&join_error.id()) else {
                        tracing::error!(error = %join_error, "lost track of a fetch task");
                        continue;
                    };
                    let error = ExecutionError::Fatal(format!("fetch task aborted: {}", join_error));
                    (idx, Err(RetryError::Fatal { error, attempts: 1 }))
                }
            };

            let op = &plan.operations()[idx];
            match outcome {
                Ok((output, attempts)) => {
                    tracing::info!(
                        operation_id = %op.id,
                        attempt = attempts,
                        rows = output.row_count,
                        elapsed_ms = output.execution_time_ms,
                        "operation succeeded"
                    );
                    if let (Some(cache), Some(key)) = (&self.cache, cache_keys.remove(&idx)) {
                        cache.put(key, output.clone(), None);
                    }
                    record.entry(&op.id).mark_succeeded(Some(output), attempts);
                }
                Err(failure) => {
                    let attempts = failure.attempts();
                    let error = failure.into_error();
                    tracing::error!(operation_id = %op.id, attempt = attempts, error = %error, "operation failed");
                    record.entry(&op.id).mark_failed(error, attempts);
                }
            }
            release_dependents(plan, idx, &mut remaining, &mut ready);
        }

        // Only reachable for plans whose inputs were never released; acyclic plans never get here.
        for op in plan.operations() {
            if !record.status(&op.id).is_some_and(|s| s.is_terminal()) {
                record.entry(&op.id).mark_skipped("never became ready");
            }
        }

        self.collect_warnings(plan, &mut record);
        record.finish();
        self.finish_run(plan, record)
    }

    /// Record a drift warning when the contract moved since planning. Returns whether it did.
    fn check_drift(&self, plan: &Plan, op: &Operation, source_id: &str, table: &str, record: &mut ExecutionRecord) -> bool {
        let Some(planned) = plan.contract_version(source_id, table) else {
            return false;
        };
        let current = self.registry.current_version(source_id, table);
        let drifted = current
            .as_ref()
            .map(|c| c.version != planned.version || c.content_hash != planned.content_hash)
            .unwrap_or(true);
        if !drifted {
            return false;
        }

        let message = match &current {
            Some(current) => format!(
                "{}.{} changed from v{} to v{} since planning",
                source_id, table, planned.version, current.version
            ),
            None => format!("{}.{} is no longer registered", source_id, table),
        };
        tracing::warn!(operation_id = %op.id, source_id = %source_id, table = %table, "{}", message);
        record.warn(Warning::for_operation(op.id.clone(), WarningKind::SchemaDrift, message));
        record.entry(&op.id).drift = Some(DriftNotice {
            planned: Some(planned.clone()),
            current,
        });
        true
    }

    /// Failed or skipped operations other than `final_output` become warnings.
    fn collect_warnings(&self, plan: &Plan, record: &mut ExecutionRecord) {
        let mut warnings = Vec::new();
        for op in plan.operations() {
            if op.id == plan.final_output() {
                continue;
            }
            let Some(entry) = record.get(&op.id) else {
                continue;
            };
            match entry.status {
                OperationStatus::Failed => {
                    let error = entry.error.as_ref().map(|e| e.to_string()).unwrap_or_default();
                    warnings.push(Warning::for_operation(
                        op.id.clone(),
                        WarningKind::OperationFailed,
                        format!("operation '{}' failed: {}", op.id, error),
                    ));
                }
                OperationStatus::Skipped => {
                    let reason = entry.skip_reason.clone().unwrap_or_default();
                    warnings.push(Warning::for_operation(
                        op.id.clone(),
                        WarningKind::OperationSkipped,
                        format!("operation '{}' skipped: {}", op.id, reason),
                    ));
                }
                _ => {}
            }
        }
        for warning in warnings {
            record.warn(warning);
        }
    }

    fn finish_run(&self, plan: &Plan, record: ExecutionRecord) -> Result<ExecutionRecord, RunFailure> {
        let final_id = plan.final_output();
        let Some(entry) = record.get(final_id) else {
            return Err(RunFailure {
                operation_id: final_id.to_string(),
                code: "INTERNAL_ERROR".to_string(),
                message: "final output has no record".to_string(),
                record: Box::new(record),
            });
        };

        let (code, message) = match entry.status {
            OperationStatus::Succeeded => {
                tracing::info!(
                    plan_id = %plan.id(),
                    succeeded = record.count(OperationStatus::Succeeded),
                    failed = record.count(OperationStatus::Failed),
                    skipped = record.count(OperationStatus::Skipped),
                    warnings = record.warnings.len(),
                    "plan finished"
                );
                return Ok(record);
            }
            OperationStatus::Failed => {
                let error = entry.error.clone();
                (
                    error.as_ref().map(|e| e.code()).unwrap_or("EXECUTION_FATAL").to_string(),
                    error.map(|e| e.to_string()).unwrap_or_default(),
                )
            }
            _ => (
                "OPERATION_SKIPPED".to_string(),
                entry.skip_reason.clone().unwrap_or_else(|| "skipped".to_string()),
            ),
        };

        tracing::error!(plan_id = %plan.id(), operation_id = %final_id, code = %code, "final output did not complete");
        Err(RunFailure {
            operation_id: final_id.to_string(),
            code,
            message,
            record: Box::new(record),
        })
    }
}

/// Skip reason when an input did not succeed and `idx` declares no fallback.
fn blocked_by_inputs(plan: &Plan, idx: usize, record: &ExecutionRecord) -> Option<String> {
    let op = &plan.operations()[idx];
    if op.fallback == InputFallback::EmptyResult {
        return None;
    }
    plan.inputs_of(idx)
        .iter()
        .map(|&i| &plan.operations()[i].id)
        .find(|id| record.status(id) != Some(OperationStatus::Succeeded))
        .map(|id| format!("input '{}' did not succeed", id))
}

fn release_dependents(plan: &Plan, idx: usize, remaining: &mut [usize], ready: &mut VecDeque<usize>) {
    for &dep in plan.dependents_of(idx) {
        remaining[dep] -= 1;
        if remaining[dep] == 0 {
            ready.push_back(dep);
        }
    }
}

/// One fetch under the retry policy. Each attempt is bounded by `timeout`;
/// timeouts are retryable.
async fn run_fetch(
    operation_id: String,
    adapter: Arc<dyn SourceAdapter>,
    payload: QueryPayload,
    retry: RetryPolicy,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<(OperationOutput, u32), RetryError<ExecutionError>> {
    let attempts = retry.run(
        |attempt| {
            let adapter = adapter.clone();
            let payload = &payload;
            let operation_id = &operation_id;
            async move {
                if attempt > 1 {
                    tracing::warn!(operation_id = %operation_id, attempt, "retrying operation");
                }
                match tokio::time::timeout(timeout, adapter.execute(payload, timeout)).await {
                    Ok(result) => result,
                    Err(_) => Err(ExecutionError::Retryable(format!(
                        "timed out after {}ms",
                        timeout.as_millis()
                    ))),
                }
            }
        },
        |error: &ExecutionError| {
            if error.is_retryable() {
                RetryDisposition::Retry
            } else {
                RetryDisposition::Stop
            }
        },
    );

    tokio::select! {
        _ = cancel.cancelled() => Err(RetryError::Fatal {
            error: ExecutionError::Cancelled("run cancelled".to_string()),
            attempts: 1,
        }),
        result = attempts => result,
    }
}
