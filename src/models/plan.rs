// Plan model
//
// A plan is an arena of operations indexed by id. Edges are the declared
// `inputs`; adjacency and in-degree tables are derived once at construction and
// never mutated, so a plan can be shared freely between the scheduler and the
// aggregator. Any change produces a new plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::error::PlanningError;
use crate::models::{
    AggregateFunction, ContractVersion, FieldSpec, Measure, Operation, OperationStep, SemanticType,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanMetadata {
    pub question: String,
    pub created_at: DateTime<Utc>,
    /// Contract versions the plan was built against, sorted by (source, table).
    pub contract_versions: Vec<ContractVersion>,
}

impl PlanMetadata {
    pub fn new(question: impl Into<String>, mut contract_versions: Vec<ContractVersion>) -> Self {
        contract_versions.sort_by(|a, b| (&a.source_id, &a.table).cmp(&(&b.source_id, &b.table)));
        contract_versions.dedup_by(|a, b| a.source_id == b.source_id && a.table == b.table);
        Self {
            question: question.into(),
            created_at: Utc::now(),
            contract_versions,
        }
    }
}

/// Serialized form of a plan, used for audit and replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDocument {
    pub id: String,
    pub operations: Vec<Operation>,
    pub final_output: String,
    pub metadata: PlanMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "PlanDocument", into = "PlanDocument")]
pub struct Plan {
    id: String,
    operations: Vec<Operation>,
    final_output: String,
    metadata: PlanMetadata,
    index: HashMap<String, usize>,
    dependents: Vec<Vec<usize>>,
    input_indices: Vec<Vec<usize>>,
    on_final_path: Vec<bool>,
}

impl Plan {
    /// Build a plan, checking every structural invariant.
    pub fn new(
        operations: Vec<Operation>,
        final_output: impl Into<String>,
        metadata: PlanMetadata,
    ) -> Result<Self, PlanningError> {
        Self::with_id(Uuid::new_v4().to_string(), operations, final_output, metadata)
    }

    fn with_id(
        id: String,
        operations: Vec<Operation>,
        final_output: impl Into<String>,
        metadata: PlanMetadata,
    ) -> Result<Self, PlanningError> {
        let final_output = final_output.into();
        if operations.is_empty() {
            return Err(PlanningError::MalformedPlan("plan has no operations".to_string()));
        }

        let mut index = HashMap::with_capacity(operations.len());
        for (i, op) in operations.iter().enumerate() {
            if index.insert(op.id.clone(), i).is_some() {
                return Err(PlanningError::MalformedPlan(format!(
                    "duplicate operation id '{}'",
                    op.id
                )));
            }
        }

        for op in &operations {
            check_arity(op)?;
        }

        let mut dependents = vec![Vec::new(); operations.len()];
        let mut input_indices = Vec::with_capacity(operations.len());
        for (i, op) in operations.iter().enumerate() {
            let mut resolved = Vec::with_capacity(op.inputs.len());
            for input in &op.inputs {
                let j = *index.get(input).ok_or_else(|| {
                    PlanningError::MalformedPlan(format!(
                        "operation '{}' references unknown input '{}'",
                        op.id, input
                    ))
                })?;
                dependents[j].push(i);
                resolved.push(j);
            }
            input_indices.push(resolved);
        }

        let final_idx = *index.get(&final_output).ok_or_else(|| {
            PlanningError::MalformedPlan(format!("final output '{}' is not an operation", final_output))
        })?;

        let mut plan = Self {
            id,
            operations,
            final_output,
            metadata,
            index,
            dependents,
            input_indices,
            on_final_path: Vec::new(),
        };

        if plan.topological_order().len() != plan.operations.len() {
            return Err(PlanningError::MalformedPlan("operation inputs form a cycle".to_string()));
        }

        let mut on_path = vec![false; plan.operations.len()];
        let mut stack = vec![final_idx];
        while let Some(i) = stack.pop() {
            if on_path[i] {
                continue;
            }
            on_path[i] = true;
            stack.extend(plan.input_indices[i].iter().copied());
        }
        plan.on_final_path = on_path;

        Ok(plan)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn final_output(&self) -> &str {
        &self.final_output
    }

    pub fn final_operation(&self) -> &Operation {
        &self.operations[self.index[&self.final_output]]
    }

    pub fn metadata(&self) -> &PlanMetadata {
        &self.metadata
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn operation(&self, id: &str) -> Option<&Operation> {
        self.index_of(id).map(|i| &self.operations[i])
    }

    /// Indices of the operations consuming operation `idx`.
    pub fn dependents_of(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    pub fn inputs_of(&self, idx: usize) -> &[usize] {
        &self.input_indices[idx]
    }

    pub fn in_degrees(&self) -> Vec<usize> {
        self.input_indices.iter().map(|inputs| inputs.len()).collect()
    }

    /// Stable Kahn ordering; roots keep their declaration order.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut in_degree = self.in_degrees();
        let mut queue: VecDeque<usize> = (0..self.operations.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.operations.len());

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &dep in &self.dependents[node] {
                in_degree[dep] -= 1;
                if in_degree[dep] == 0 {
                    queue.push_back(dep);
                }
            }
        }
        order
    }

    /// Whether `id` is `final_output` or one of its transitive inputs.
    pub fn is_on_final_path(&self, id: &str) -> bool {
        self.index_of(id).map(|i| self.on_final_path[i]).unwrap_or(false)
    }

    /// Operations with no route to `final_output`.
    pub fn detached_operations(&self) -> Vec<&str> {
        self.operations
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.on_final_path[*i])
            .map(|(_, op)| op.id.as_str())
            .collect()
    }

    pub fn leaves(&self) -> Vec<&Operation> {
        self.operations.iter().filter(|op| op.inputs.is_empty()).collect()
    }

    pub fn contract_version(&self, source_id: &str, table: &str) -> Option<&ContractVersion> {
        self.metadata
            .contract_versions
            .iter()
            .find(|v| v.source_id == source_id && v.table == table)
    }

    /// Fields produced by an operation, derived from typed fetch declarations.
    pub fn output_fields(&self, id: &str) -> Option<Vec<FieldSpec>> {
        let mut memo = HashMap::new();
        self.output_fields_memo(self.index_of(id)?, &mut memo)
    }

    fn output_fields_memo(
        &self,
        idx: usize,
        memo: &mut HashMap<usize, Option<Vec<FieldSpec>>>,
    ) -> Option<Vec<FieldSpec>> {
        if let Some(cached) = memo.get(&idx) {
            return cached.clone();
        }
        let op = &self.operations[idx];
        let fields = match &op.step {
            OperationStep::Fetch { fields, .. } => Some(fields.clone()),
            OperationStep::Join { left_key, right_key, .. } => {
                let left = self.output_fields_memo(self.input_indices[idx][0], memo)?;
                let right = self.output_fields_memo(self.input_indices[idx][1], memo)?;
                let right_label = self.source_label(self.input_indices[idx][1]);
                Some(merge_join_fields(&left, &right, left_key, right_key, &right_label))
            }
            OperationStep::Union => {
                let mut merged: Vec<FieldSpec> = Vec::new();
                for &input in &self.input_indices[idx] {
                    let label = self.source_label(input);
                    for field in self.output_fields_memo(input, memo)? {
                        match merged.iter().find(|f| f.name == field.name) {
                            Some(existing) if existing.semantic_type != field.semantic_type => {
                                let mut renamed = field.clone();
                                renamed.name = format!("{}.{}", label, field.name);
                                merged.push(renamed);
                            }
                            Some(_) => {}
                            None => merged.push(field),
                        }
                    }
                }
                Some(merged)
            }
            OperationStep::Aggregate { group_by, measures } => {
                let input = self.output_fields_memo(self.input_indices[idx][0], memo)?;
                let mut fields = Vec::with_capacity(group_by.len() + measures.len());
                for name in group_by {
                    fields.push(input.iter().find(|f| &f.name == name)?.clone());
                }
                for measure in measures {
                    fields.push(measure_field(measure, &input)?);
                }
                Some(fields)
            }
        };
        memo.insert(idx, fields.clone());
        fields
    }

    /// Prefix used to disambiguate colliding field names coming from `idx`.
    pub fn source_label(&self, idx: usize) -> String {
        let op = &self.operations[idx];
        op.source_id().unwrap_or(&op.id).to_string()
    }

    pub fn to_document(&self) -> PlanDocument {
        PlanDocument {
            id: self.id.clone(),
            operations: self.operations.clone(),
            final_output: self.final_output.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Join output: all left fields, then right fields. A right key named like the left
/// key is folded into it; other collisions are prefixed with the right source label.
pub fn merge_join_fields(
    left: &[FieldSpec],
    right: &[FieldSpec],
    left_key: &str,
    right_key: &str,
    right_label: &str,
) -> Vec<FieldSpec> {
    let mut merged: Vec<FieldSpec> = left.to_vec();
    for field in right {
        if field.name == right_key && right_key == left_key {
            continue;
        }
        let mut field = field.clone();
        if merged.iter().any(|f| f.name == field.name) {
            field.name = format!("{}.{}", right_label, field.name);
        }
        merged.push(field);
    }
    merged
}

fn measure_field(measure: &Measure, input: &[FieldSpec]) -> Option<FieldSpec> {
    let semantic_type = match (measure.function, measure.field.as_deref()) {
        (AggregateFunction::Count, _) => SemanticType::Integer,
        (AggregateFunction::Avg, Some(field)) => {
            input.iter().find(|f| f.name == field)?;
            SemanticType::Float
        }
        (_, Some(field)) => input.iter().find(|f| f.name == field)?.semantic_type,
        (_, None) => return None,
    };
    Some(FieldSpec::new(measure.alias.clone(), semantic_type))
}

/// Input count each step kind needs. Documents replayed from JSON skip the
/// builder, so this is checked again for every plan.
fn check_arity(op: &Operation) -> Result<(), PlanningError> {
    let n = op.inputs.len();
    let expected = match op.step {
        OperationStep::Fetch { .. } if n != 0 => "no inputs",
        OperationStep::Join { .. } if n != 2 => "exactly two inputs",
        OperationStep::Union if n < 2 => "at least two inputs",
        OperationStep::Aggregate { .. } if n != 1 => "exactly one input",
        _ => {
            for (i, input) in op.inputs.iter().enumerate() {
                if op.inputs[..i].contains(input) {
                    return Err(PlanningError::MalformedPlan(format!(
                        "operation '{}' declares input '{}' twice",
                        op.id, input
                    )));
                }
            }
            return Ok(());
        }
    };
    Err(PlanningError::MalformedPlan(format!(
        "{} operation '{}' needs {}, has {}",
        op.kind().as_str(),
        op.id,
        expected,
        n
    )))
}

impl TryFrom<PlanDocument> for Plan {
    type Error = PlanningError;

    fn try_from(doc: PlanDocument) -> Result<Self, Self::Error> {
        Plan::with_id(doc.id, doc.operations, doc.final_output, doc.metadata)
    }
}

impl From<Plan> for PlanDocument {
    fn from(plan: Plan) -> Self {
        PlanDocument {
            id: plan.id,
            operations: plan.operations,
            final_output: plan.final_output,
            metadata: plan.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JoinMode, OperationBuilder, QueryPayload};

    fn fetch(id: &str, source: &str, fields: Vec<FieldSpec>) -> Operation {
        OperationBuilder::fetch(id, source, "t")
            .fields(fields)
            .payload(QueryPayload::Json(serde_json::json!({"collection": "t"})))
            .build()
            .unwrap()
    }

    fn users_and_orders() -> Vec<Operation> {
        vec![
            fetch(
                "users",
                "crm",
                vec![
                    FieldSpec::key("id", SemanticType::Integer),
                    FieldSpec::new("name", SemanticType::Text),
                ],
            ),
            fetch(
                "orders",
                "billing",
                vec![
                    FieldSpec::key("id", SemanticType::Integer),
                    FieldSpec::new("amt", SemanticType::Float),
                    FieldSpec::new("name", SemanticType::Text),
                ],
            ),
            OperationBuilder::join("joined", "users", "orders")
                .on("id", "id")
                .mode(JoinMode::Inner)
                .build()
                .unwrap(),
        ]
    }

    #[test]
    fn test_plan_construction_and_order() {
        let plan = Plan::new(users_and_orders(), "joined", PlanMetadata::new("q", vec![])).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.topological_order(), vec![0, 1, 2]);
        assert_eq!(plan.in_degrees(), vec![0, 0, 2]);
        assert_eq!(plan.dependents_of(0), &[2]);
        assert!(plan.is_on_final_path("users"));
        assert!(plan.detached_operations().is_empty());
        assert_eq!(plan.leaves().len(), 2);
    }

    #[test]
    fn test_rejects_dangling_input_and_missing_final() {
        let mut ops = users_and_orders();
        ops.pop();
        ops.push(
            OperationBuilder::join("joined", "users", "ghost")
                .on("id", "id")
                .build()
                .unwrap(),
        );
        assert!(Plan::new(ops, "joined", PlanMetadata::new("q", vec![])).is_err());
        assert!(Plan::new(users_and_orders(), "nope", PlanMetadata::new("q", vec![])).is_err());
    }

    #[test]
    fn test_rejects_cycles() {
        let ops = vec![
            OperationBuilder::union("a", ["b", "c"]).build().unwrap(),
            OperationBuilder::union("b", ["a", "c"]).build().unwrap(),
            fetch("c", "crm", vec![]),
        ];
        let err = Plan::new(ops, "a", PlanMetadata::new("q", vec![])).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_detached_operations_are_reported() {
        let mut ops = users_and_orders();
        ops.push(fetch("audit", "logs", vec![]));
        let plan = Plan::new(ops, "joined", PlanMetadata::new("q", vec![])).unwrap();
        assert_eq!(plan.detached_operations(), vec!["audit"]);
        assert!(!plan.is_on_final_path("audit"));
    }

    #[test]
    fn test_join_output_fields_fold_shared_key_and_prefix_collisions() {
        let plan = Plan::new(users_and_orders(), "joined", PlanMetadata::new("q", vec![])).unwrap();
        let names: Vec<String> = plan
            .output_fields("joined")
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["id", "name", "amt", "billing.name"]);
    }

    #[test]
    fn test_aggregate_output_fields() {
        let mut ops = users_and_orders();
        ops.push(
            OperationBuilder::aggregate("totals", "joined")
                .group_by(["name"])
                .measure(Measure::count("n"))
                .measure(Measure::of(AggregateFunction::Avg, "amt", "avg_amt"))
                .build()
                .unwrap(),
        );
        let plan = Plan::new(ops, "totals", PlanMetadata::new("q", vec![])).unwrap();
        let fields = plan.output_fields("totals").unwrap();
        assert_eq!(fields[0].name, "name");
        assert_eq!(fields[1].semantic_type, SemanticType::Integer);
        assert_eq!(fields[2].semantic_type, SemanticType::Float);
    }

    #[test]
    fn test_json_round_trip_preserves_order_and_versions() {
        let versions = vec![ContractVersion {
            source_id: "crm".into(),
            table: "t".into(),
            version: 3,
            content_hash: "abc".into(),
        }];
        let plan = Plan::new(users_and_orders(), "joined", PlanMetadata::new("q", versions)).unwrap();
        let json = plan.to_json().unwrap();
        let restored = Plan::from_json(&json).unwrap();

        assert_eq!(restored.id(), plan.id());
        assert_eq!(restored.operations(), plan.operations());
        assert_eq!(restored.final_output(), "joined");
        assert_eq!(restored.contract_version("crm", "t").unwrap().version, 3);
    }

    #[test]
    fn test_deserializing_invalid_document_fails() {
        let mut doc = Plan::new(users_and_orders(), "joined", PlanMetadata::new("q", vec![]))
            .unwrap()
            .to_document();
        doc.final_output = "missing".into();
        let json = serde_json::to_string(&doc).unwrap();
        assert!(Plan::from_json(&json).is_err());
    }

    #[test]
    fn test_replayed_document_with_wrong_input_counts_is_rejected() {
        let plan = Plan::new(users_and_orders(), "joined", PlanMetadata::new("q", vec![])).unwrap();

        let mut one_sided = plan.to_document();
        let join = one_sided.operations.iter_mut().find(|op| op.id == "joined").unwrap();
        join.inputs.truncate(1);
        let err = Plan::try_from(one_sided).unwrap_err();
        assert!(matches!(&err, PlanningError::MalformedPlan(msg) if msg.contains("exactly two inputs")));

        let mut json: serde_json::Value = serde_json::from_str(&plan.to_json().unwrap()).unwrap();
        let ops = json["operations"].as_array_mut().unwrap();
        let mut aggregate = serde_json::to_value(
            OperationBuilder::aggregate("counted", "joined")
                .measure(Measure::count("n"))
                .build()
                .unwrap(),
        )
        .unwrap();
        aggregate["inputs"] = serde_json::json!([]);
        ops.push(aggregate);
        assert!(Plan::from_json(&json.to_string()).is_err());

        let mut fetch_with_input = plan.to_document();
        fetch_with_input.operations[0].inputs.push("joined".into());
        assert!(Plan::try_from(fetch_with_input).is_err());
    }
}
