// Query Planner
//
// Turns a question and a set of candidate sources into a validated plan:
// one generated fetch per source, folded left-to-right into joins and unions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;

use crate::config::PlannerConfig;
use crate::error::{PlanningError, Violation};
use crate::models::{
    merge_join_fields, FieldRole, FieldSpec, JoinMode, Operation, OperationBuilder, OperationStep, Plan,
    PlanMetadata, SemanticType, SourceDescriptor,
};
use crate::services::coercion::comparable_key_type;
use crate::services::generation::{CombineHint, OperationDraft, QueryGenerator, SchemaContext};
use crate::services::SchemaRegistry;

/// What the planner did on the way to a plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanDiagnostics {
    pub candidates: Vec<String>,
    /// Candidates left out before generation, with the reason.
    pub skipped_sources: Vec<(String, String)>,
    /// Sources whose operation was dropped during repair.
    pub dropped_sources: Vec<String>,
    /// Sources regenerated with validation feedback.
    pub regenerated_sources: Vec<String>,
    /// Violations found on the first validation pass.
    pub initial_violations: Vec<Violation>,
    /// Drafts the operation builder refused on the first pass, as `operation: reason`.
    pub initial_rejections: Vec<String>,
}

/// One source's contribution to the plan.
#[derive(Debug, Clone)]
struct DraftSlot {
    context: SchemaContext,
    draft: OperationDraft,
}

impl DraftSlot {
    fn source_id(&self) -> &str {
        &self.context.source.id
    }
}

/// Operations assembled from the current drafts, and which draft each came from.
struct Assembly {
    operations: Vec<Operation>,
    final_output: Option<String>,
    origins: HashMap<String, usize>,
    /// Draft indices that only feed a union and can be removed without breaking a join.
    optional: HashSet<usize>,
    /// Drafts the builder refused, left out of `operations`: (operation id, reason).
    rejected: BTreeMap<usize, (String, String)>,
}

/// One assembly of the drafts plus what validation said about it.
struct Attempt {
    assembly: Assembly,
    plan: Option<Plan>,
    violations: Vec<Violation>,
}

impl Attempt {
    fn is_clean(&self) -> bool {
        self.plan.is_some() && self.assembly.rejected.is_empty() && self.violations.is_empty()
    }
}

pub struct Planner {
    registry: Arc<SchemaRegistry>,
    generator: Arc<dyn QueryGenerator>,
    context_budget: usize,
}

impl Planner {
    pub fn new(registry: Arc<SchemaRegistry>, generator: Arc<dyn QueryGenerator>) -> Self {
        Self {
            registry,
            generator,
            context_budget: 4000,
        }
    }

    pub fn from_config(
        config: &PlannerConfig,
        registry: Arc<SchemaRegistry>,
        generator: Arc<dyn QueryGenerator>,
    ) -> Self {
        Self {
            context_budget: config.context_budget_chars,
            ..Self::new(registry, generator)
        }
    }

    /// Plan a question against candidate sources
    ///
    /// # Arguments
    ///
    /// * `question` - The natural-language question
    /// * `candidates` - Sources to plan against, in preference order
    ///
    /// Generates one fetch per usable source, validates the assembled plan and
    /// makes a single repair pass over every builder rejection and violation:
    /// union-only inputs with violations are dropped, everything else is
    /// regenerated once with the problems as feedback.
    pub async fn create_plan(
        &self,
        question: &str,
        candidates: &[SourceDescriptor],
    ) -> Result<(Plan, PlanDiagnostics), PlanningError> {
        if candidates.is_empty() {
            return Err(PlanningError::NoCandidateSources);
        }

        let mut diagnostics = PlanDiagnostics::default();
        let contexts = self.build_contexts(candidates, &mut diagnostics)?;

        let drafts = join_all(contexts.iter().map(|context| self.generate(question, context))).await;
        let mut slots = Vec::with_capacity(contexts.len());
        for (context, draft) in contexts.into_iter().zip(drafts) {
            slots.push(DraftSlot { context, draft: draft? });
        }

        let first = self.attempt(question, &slots)?;
        if first.is_clean() {
            let plan = first
                .plan
                .ok_or_else(|| PlanningError::MalformedPlan("plan has no operations".to_string()))?;
            log_plan(&plan, &diagnostics);
            return Ok((plan, diagnostics));
        }
        diagnostics.initial_violations = first.violations.clone();
        diagnostics.initial_rejections = first
            .assembly
            .rejected
            .values()
            .map(|(operation_id, reason)| format!("{}: {}", operation_id, reason))
            .collect();

        let slots = self.repair(question, slots, &first, &mut diagnostics).await?;

        let second = self.attempt(question, &slots)?;
        if let Some((operation_id, reason)) = second.assembly.rejected.into_values().next() {
            tracing::warn!(operation_id = %operation_id, "draft still rejected after repair");
            return Err(PlanningError::MalformedOperation { operation_id, reason });
        }
        if !second.violations.is_empty() {
            tracing::warn!(
                violations = second.violations.len(),
                "plan still invalid after repair"
            );
            return Err(PlanningError::Unrepairable {
                violations: second.violations,
            });
        }
        let plan = second
            .plan
            .ok_or_else(|| PlanningError::MalformedPlan("no operations left after repair".to_string()))?;
        log_plan(&plan, &diagnostics);
        Ok((plan, diagnostics))
    }

    fn build_contexts(
        &self,
        candidates: &[SourceDescriptor],
        diagnostics: &mut PlanDiagnostics,
    ) -> Result<Vec<SchemaContext>, PlanningError> {
        let mut seen = HashSet::new();
        let mut contexts = Vec::new();
        for candidate in candidates {
            if !seen.insert(candidate.id.clone()) {
                continue;
            }
            diagnostics.candidates.push(candidate.id.clone());

            let reason = match self.registry.source(&candidate.id) {
                None => Some("not registered"),
                Some(source) if !source.enabled => Some("disabled"),
                Some(_) => None,
            };
            let contracts = self.registry.contracts_for(&candidate.id);
            let reason = reason.or(contracts.is_empty().then_some("no field contracts"));
            if let Some(reason) = reason {
                tracing::debug!(source_id = %candidate.id, reason, "skipping candidate source");
                diagnostics
                    .skipped_sources
                    .push((candidate.id.clone(), reason.to_string()));
                continue;
            }

            let source = self.registry.source(&candidate.id).unwrap_or_else(|| candidate.clone());
            contexts.push(SchemaContext::build(source, contracts, self.context_budget));
        }

        if contexts.is_empty() {
            let reasons: Vec<String> = diagnostics
                .skipped_sources
                .iter()
                .map(|(id, reason)| format!("{} ({})", id, reason))
                .collect();
            return Err(PlanningError::NoUsableSources(reasons.join(", ")));
        }
        Ok(contexts)
    }

    async fn generate(&self, question: &str, context: &SchemaContext) -> Result<OperationDraft, PlanningError> {
        self.generator
            .generate(question, context, context.source.kind)
            .await
            .map_err(|e| PlanningError::Generation {
                source_id: context.source.id.clone(),
                message: e.0,
            })
    }

    /// Assemble the drafts and validate whatever the builder accepted.
    fn attempt(&self, question: &str, slots: &[DraftSlot]) -> Result<Attempt, PlanningError> {
        let assembly = self.assemble(slots);
        let Some(final_output) = assembly.final_output.clone() else {
            return Ok(Attempt {
                assembly,
                plan: None,
                violations: Vec::new(),
            });
        };
        let versions = self.registry.version_snapshot(&assembly.operations);
        let plan = Plan::new(
            assembly.operations.clone(),
            final_output,
            PlanMetadata::new(question, versions),
        )?;
        let violations = self.registry.validate(&plan).violations;
        Ok(Attempt {
            assembly,
            plan: Some(plan),
            violations,
        })
    }

    /// Fold drafts left to right. The first accepted fetch seeds the accumulator;
    /// each later fetch joins or unions onto it, following the draft's hint or
    /// inferring one from a shared comparable key. A draft whose fetch or combine
    /// step the builder refuses is recorded in `rejected` and left out.
    fn assemble(&self, slots: &[DraftSlot]) -> Assembly {
        let mut operations = Vec::with_capacity(slots.len() * 2);
        let mut origins = HashMap::new();
        let mut optional = HashSet::new();
        let mut rejected = BTreeMap::new();
        let mut acc_id: Option<String> = None;
        let mut acc_fields: Vec<FieldSpec> = Vec::new();
        let mut seed = 0;
        let mut combined_any = false;

        for (i, slot) in slots.iter().enumerate() {
            let fetch = match fetch_operation(slot) {
                Ok(fetch) => fetch,
                Err(err) => {
                    rejected.insert(i, rejection(err, slot));
                    continue;
                }
            };
            let fields = match &fetch.step {
                OperationStep::Fetch { fields, .. } => fields.clone(),
                _ => Vec::new(),
            };

            let Some(left_id) = acc_id.clone() else {
                seed = i;
                origins.insert(fetch.id.clone(), i);
                acc_id = Some(fetch.id.clone());
                acc_fields = fields;
                operations.push(fetch);
                continue;
            };

            let hint = slot
                .draft
                .combine
                .clone()
                .unwrap_or_else(|| infer_combine(&acc_fields, &fields));
            let is_union = matches!(hint, CombineHint::Union);
            let (combined, merged) = match hint {
                CombineHint::Join {
                    left_key,
                    right_key,
                    mode,
                } => {
                    let merged = merge_join_fields(&acc_fields, &fields, &left_key, &right_key, slot.source_id());
                    let op = OperationBuilder::join(format!("join_{}", i), left_id.as_str(), fetch.id.as_str())
                        .on(left_key, right_key)
                        .mode(mode)
                        .build();
                    (op, merged)
                }
                CombineHint::Union => {
                    let mut merged = acc_fields.clone();
                    for field in fields {
                        if !merged.iter().any(|f| f.name == field.name) {
                            merged.push(field);
                        }
                    }
                    let op = OperationBuilder::union(format!("union_{}", i), [left_id.as_str(), fetch.id.as_str()]).build();
                    (op, merged)
                }
            };
            let combined = match combined {
                Ok(op) => op,
                Err(err) => {
                    rejected.insert(i, rejection(err, slot));
                    continue;
                }
            };

            if is_union {
                optional.insert(i);
                if !combined_any {
                    optional.insert(seed);
                }
            }
            combined_any = true;
            origins.insert(fetch.id.clone(), i);
            origins.insert(combined.id.clone(), i);
            acc_id = Some(combined.id.clone());
            acc_fields = merged;
            operations.push(fetch);
            operations.push(combined);
        }

        // A seed fetch is only optional if nothing joined onto it later
        if operations.iter().any(|op| matches!(op.step, OperationStep::Join { .. })) {
            optional.remove(&seed);
        }

        Assembly {
            operations,
            final_output: acc_id,
            origins,
            optional,
            rejected,
        }
    }

    /// One repair pass over every problem of an attempt. Builder rejections are
    /// regenerated; validation violations drop union-only inputs and regenerate
    /// the rest. Each draft is regenerated at most once.
    async fn repair(
        &self,
        question: &str,
        slots: Vec<DraftSlot>,
        attempt: &Attempt,
        diagnostics: &mut PlanDiagnostics,
    ) -> Result<Vec<DraftSlot>, PlanningError> {
        let assembly = &attempt.assembly;
        let mut feedback: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        let mut drop: HashSet<usize> = HashSet::new();

        for (&i, (operation_id, reason)) in &assembly.rejected {
            feedback.entry(i).or_default().push(format!("{}: {}", operation_id, reason));
        }

        for violation in &attempt.violations {
            let Some(&origin) = assembly.origins.get(&violation.operation_id) else {
                continue;
            };
            if assembly.optional.contains(&origin) && drop.len() + 1 < slots.len() {
                drop.insert(origin);
            } else {
                feedback.entry(origin).or_default().push(violation.to_string());
            }
        }

        let mut repaired = Vec::with_capacity(slots.len());
        for (i, slot) in slots.into_iter().enumerate() {
            if drop.contains(&i) {
                tracing::info!(source_id = %slot.source_id(), "dropping union input with violations");
                diagnostics.dropped_sources.push(slot.source_id().to_string());
                continue;
            }
            match feedback.remove(&i) {
                Some(lines) => repaired.push(self.regenerate(question, slot, lines, diagnostics).await?),
                None => repaired.push(slot),
            }
        }
        Ok(repaired)
    }

    async fn regenerate(
        &self,
        question: &str,
        slot: DraftSlot,
        feedback: Vec<String>,
        diagnostics: &mut PlanDiagnostics,
    ) -> Result<DraftSlot, PlanningError> {
        tracing::info!(
            source_id = %slot.source_id(),
            violations = feedback.len(),
            "regenerating operation with feedback"
        );
        let context = slot.context.with_feedback(feedback);
        let draft = self.generate(question, &context).await?;
        diagnostics.regenerated_sources.push(context.source.id.clone());
        Ok(DraftSlot { context, draft })
    }
}

fn log_plan(plan: &Plan, diagnostics: &PlanDiagnostics) {
    tracing::info!(
        plan_id = %plan.id(),
        operations = plan.len(),
        final_output = %plan.final_output(),
        regenerated = diagnostics.regenerated_sources.len(),
        dropped = diagnostics.dropped_sources.len(),
        "plan created"
    );
}

/// Typed fetch for a draft. Field types come from the source's contract; names the
/// contract does not know are kept as text so validation can report them.
fn fetch_operation(slot: &DraftSlot) -> Result<Operation, PlanningError> {
    let source_id = slot.source_id();
    let contract = slot.context.contract(&slot.draft.table);
    let fields: Vec<FieldSpec> = match contract {
        Some(contract) if slot.draft.fields.is_empty() => contract.fields.clone(),
        _ => slot
            .draft
            .fields
            .iter()
            .map(|name| {
                contract
                    .and_then(|c| {
                        c.field(name)
                            .or_else(|| c.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name)))
                    })
                    .cloned()
                    .unwrap_or_else(|| FieldSpec::new(name.clone(), SemanticType::Text))
            })
            .collect(),
    };

    OperationBuilder::fetch(fetch_id(source_id), source_id, slot.draft.table.as_str())
        .fields(fields)
        .payload(slot.draft.payload.clone())
        .build()
}

/// Operation id and reason for a builder refusal.
fn rejection(err: PlanningError, slot: &DraftSlot) -> (String, String) {
    match err {
        PlanningError::MalformedOperation { operation_id, reason } => (operation_id, reason),
        other => (fetch_id(slot.source_id()), other.to_string()),
    }
}

fn fetch_id(source_id: &str) -> String {
    format!("fetch_{}", source_id)
}

/// Join on a field both sides share with comparable types, keys first; union otherwise.
fn infer_combine(left: &[FieldSpec], right: &[FieldSpec]) -> CombineHint {
    let comparable = |r: &FieldSpec| {
        left.iter()
            .find(|l| l.name == r.name)
            .is_some_and(|l| comparable_key_type(l.semantic_type, r.semantic_type).is_some())
    };
    let key = right
        .iter()
        .filter(|f| f.role == FieldRole::Key)
        .find(|f| comparable(f))
        .or_else(|| right.iter().find(|f| comparable(f) && f.name.ends_with("id")));

    match key {
        Some(field) => CombineHint::Join {
            left_key: field.name.clone(),
            right_key: field.name.clone(),
            mode: JoinMode::Inner,
        },
        None => CombineHint::Union,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::models::{OperationKind, QueryPayload, SourceKind};
    use crate::test_support::{crm_and_billing, sql_draft, MockGenerator};

    async fn planner(generator: MockGenerator) -> (Planner, Arc<MockGenerator>) {
        let generator = Arc::new(generator);
        let planner = Planner::new(crm_and_billing().await, generator.clone());
        (planner, generator)
    }

    fn sources(ids: &[&str]) -> Vec<SourceDescriptor> {
        ids.iter()
            .map(|id| SourceDescriptor::new(*id, SourceKind::Relational, "mock"))
            .collect()
    }

    fn users_draft() -> OperationDraft {
        sql_draft("users", &["id", "name"], "SELECT id, name FROM users")
    }

    #[tokio::test]
    async fn test_zero_candidates_is_an_error() {
        let (planner, _) = planner(MockGenerator::default()).await;
        assert!(matches!(
            planner.create_plan("anything", &[]).await,
            Err(PlanningError::NoCandidateSources)
        ));
    }

    #[tokio::test]
    async fn test_single_source_short_circuits() {
        let (planner, _) = planner(MockGenerator::default().draft("crm", users_draft())).await;
        let (plan, diagnostics) = planner.create_plan("list users", &sources(&["crm"])).await.unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan.final_output(), "fetch_crm");
        assert_eq!(plan.final_operation().kind(), OperationKind::Fetch);
        assert_eq!(plan.metadata().contract_versions.len(), 1);
        assert!(diagnostics.initial_violations.is_empty());
    }

    #[tokio::test]
    async fn test_two_sources_join_on_shared_key() {
        let generator = MockGenerator::default()
            .draft("crm", users_draft())
            .draft("billing", sql_draft("orders", &["id", "amt"], "SELECT id, amt FROM orders"));
        let (planner, _) = planner(generator).await;
        let (plan, _) = planner
            .create_plan("spend per user", &sources(&["crm", "billing"]))
            .await
            .unwrap();

        let ids: Vec<&str> = plan.operations().iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec!["fetch_crm", "fetch_billing", "join_1"]);
        assert_eq!(plan.final_output(), "join_1");
        assert_eq!(plan.operation("join_1").unwrap().inputs, vec!["fetch_crm", "fetch_billing"]);
        let versions: Vec<&str> = plan
            .metadata()
            .contract_versions
            .iter()
            .map(|v| v.source_id.as_str())
            .collect();
        assert_eq!(versions, vec!["billing", "crm"]);
    }

    #[tokio::test]
    async fn test_explicit_union_hint() {
        let mut orders = sql_draft("orders", &["id"], "SELECT id FROM orders");
        orders.combine = Some(CombineHint::Union);
        let generator = MockGenerator::default().draft("crm", users_draft()).draft("billing", orders);
        let (planner, _) = planner(generator).await;
        let (plan, _) = planner.create_plan("all ids", &sources(&["crm", "billing"])).await.unwrap();
        assert_eq!(plan.final_output(), "union_1");
    }

    #[tokio::test]
    async fn test_regenerates_once_with_feedback() {
        let generator = MockGenerator::default()
            .draft("crm", users_draft())
            .draft("billing", sql_draft("orders", &["id", "amount"], "SELECT id, amount FROM orders"))
            .draft("billing", sql_draft("orders", &["id", "amt"], "SELECT id, amt FROM orders"));
        let (planner, generator) = planner(generator).await;
        let (plan, diagnostics) = planner
            .create_plan("spend per user", &sources(&["crm", "billing"]))
            .await
            .unwrap();

        assert_eq!(plan.final_output(), "join_1");
        assert_eq!(diagnostics.regenerated_sources, vec!["billing"]);
        assert_eq!(diagnostics.initial_violations.len(), 1);
        let feedback = generator.feedback();
        assert_eq!(feedback.len(), 1);
        assert!(feedback[0].1[0].contains("amount"));
    }

    fn rejected_draft(table: &str, sql: &str) -> OperationDraft {
        OperationDraft {
            table: table.into(),
            fields: vec![],
            payload: QueryPayload::Sql(sql.into()),
            combine: None,
        }
    }

    #[tokio::test]
    async fn test_rejection_and_violation_share_the_repair_pass() {
        let generator = MockGenerator::default()
            .draft("crm", rejected_draft("users", "DELETE FROM users"))
            .draft("crm", users_draft())
            .draft("billing", sql_draft("orders", &["id", "amount"], "SELECT id, amount FROM orders"))
            .draft("billing", sql_draft("orders", &["id", "amt"], "SELECT id, amt FROM orders"));
        let (planner, generator) = planner(generator).await;
        let (plan, diagnostics) = planner
            .create_plan("spend per user", &sources(&["crm", "billing"]))
            .await
            .unwrap();

        assert_eq!(plan.final_output(), "join_1");
        assert_eq!(diagnostics.regenerated_sources, vec!["crm", "billing"]);
        assert_eq!(diagnostics.initial_rejections.len(), 1);
        assert!(diagnostics.initial_rejections[0].starts_with("fetch_crm"));
        assert_eq!(diagnostics.initial_violations.len(), 1);
        assert_eq!(diagnostics.initial_violations[0].operation_id, "fetch_billing");

        let feedback = generator.feedback();
        assert_eq!(feedback.len(), 2);
        assert_eq!(feedback[1].0, "billing");
        assert!(feedback[1].1[0].contains("amount"));
    }

    #[tokio::test]
    async fn test_every_rejected_draft_is_regenerated() {
        let generator = MockGenerator::default()
            .draft("crm", rejected_draft("users", "DELETE FROM users"))
            .draft("crm", users_draft())
            .draft("billing", rejected_draft("orders", "DROP TABLE orders"))
            .draft("billing", sql_draft("orders", &["id", "amt"], "SELECT id, amt FROM orders"));
        let (planner, _) = planner(generator).await;
        let (plan, diagnostics) = planner
            .create_plan("spend per user", &sources(&["crm", "billing"]))
            .await
            .unwrap();

        assert_eq!(plan.final_output(), "join_1");
        assert_eq!(diagnostics.initial_rejections.len(), 2);
        assert!(diagnostics.initial_violations.is_empty());
    }

    #[tokio::test]
    async fn test_drops_invalid_union_input() {
        let mut orders = sql_draft("orders", &["id", "total"], "SELECT id, total FROM orders");
        orders.combine = Some(CombineHint::Union);
        let generator = MockGenerator::default().draft("crm", users_draft()).draft("billing", orders);
        let (planner, generator) = planner(generator).await;
        let (plan, diagnostics) = planner.create_plan("all ids", &sources(&["crm", "billing"])).await.unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan.final_output(), "fetch_crm");
        assert_eq!(diagnostics.dropped_sources, vec!["billing"]);
        assert!(generator.feedback().is_empty());
    }

    #[tokio::test]
    async fn test_persistent_violation_is_unrepairable() {
        let generator = MockGenerator::default().draft(
            "crm",
            sql_draft("users", &["id", "email"], "SELECT id, email FROM users"),
        );
        let (planner, _) = planner(generator).await;
        let err = planner.create_plan("emails", &sources(&["crm"])).await.unwrap_err();
        match err {
            PlanningError::Unrepairable { violations } => {
                assert_eq!(violations[0].operation_id, "fetch_crm");
                assert!(matches!(
                    &violations[0].error,
                    ValidationError::UnknownField { field, .. } if field == "email"
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unusable_candidates_are_skipped() {
        let (planner, _) = planner(MockGenerator::default().draft("crm", users_draft())).await;
        let (plan, diagnostics) = planner
            .create_plan("users", &sources(&["ghost", "crm", "crm"]))
            .await
            .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(diagnostics.candidates, vec!["ghost", "crm"]);
        assert_eq!(diagnostics.skipped_sources, vec![("ghost".to_string(), "not registered".to_string())]);

        assert!(matches!(
            planner.create_plan("users", &sources(&["ghost"])).await,
            Err(PlanningError::NoUsableSources(_))
        ));
    }

    #[tokio::test]
    async fn test_generation_failure_names_the_source() {
        let (planner, _) = planner(MockGenerator::default().draft("crm", users_draft())).await;
        let err = planner
            .create_plan("spend", &sources(&["crm", "billing"]))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanningError::Generation { ref source_id, .. } if source_id == "billing"));
    }

    #[tokio::test]
    async fn test_non_select_draft_is_rejected() {
        let generator = MockGenerator::default().draft("crm", rejected_draft("users", "DELETE FROM users"));
        let (planner, generator) = planner(generator).await;
        assert!(matches!(
            planner.create_plan("purge", &sources(&["crm"])).await,
            Err(PlanningError::MalformedOperation { .. })
        ));
        assert_eq!(generator.feedback().len(), 1);
    }
}
