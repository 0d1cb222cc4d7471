// Result aggregator
//
// Materializes the final output of a plan from the fetch outputs held in an
// execution record. Join, union and aggregate steps are evaluated here, in
// memory, so the same record always yields the same rows.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use crate::error::AggregationError;
use crate::models::{
    AggregateFunction, ExecutionRecord, FieldSpec, InputFallback, JoinMode, Measure, Operation,
    OperationOutput, OperationStatus, OperationStep, Plan, ResultRow, SemanticType, Value, Warning,
    WarningKind,
};
use crate::services::coercion::{coerce, comparable_key_type, key_of, KeyValue};

/// Unified rows of `final_output` plus anything worth telling the caller about them.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateOutput {
    pub rows: Vec<ResultRow>,
    pub warnings: Vec<Warning>,
}

impl AggregateOutput {
    pub fn rows_json(&self) -> Vec<serde_json::Value> {
        self.rows.iter().map(ResultRow::to_json).collect()
    }
}

/// Produce the rows of `plan`'s final output from a completed run.
pub fn aggregate(record: &ExecutionRecord, plan: &Plan) -> Result<AggregateOutput, AggregationError> {
    let mut materializer = Materializer {
        record,
        plan,
        memo: HashMap::new(),
        warnings: Vec::new(),
    };
    let final_idx = plan
        .index_of(plan.final_output())
        .ok_or_else(|| AggregationError::MissingResult {
            operation_id: plan.final_output().to_string(),
        })?;
    let rows = materializer.materialize(final_idx)?;
    tracing::info!(
        plan_id = %plan.id(),
        rows = rows.len(),
        warnings = materializer.warnings.len(),
        "aggregated final output"
    );
    Ok(AggregateOutput {
        rows,
        warnings: materializer.warnings,
    })
}

struct Materializer<'a> {
    record: &'a ExecutionRecord,
    plan: &'a Plan,
    memo: HashMap<usize, Vec<ResultRow>>,
    warnings: Vec<Warning>,
}

impl<'a> Materializer<'a> {
    fn materialize(&mut self, idx: usize) -> Result<Vec<ResultRow>, AggregationError> {
        if let Some(rows) = self.memo.get(&idx) {
            return Ok(rows.clone());
        }

        let (plan, record) = (self.plan, self.record);
        let op = &plan.operations()[idx];
        let missing = || AggregationError::MissingResult {
            operation_id: op.id.clone(),
        };
        let op_record = record.get(&op.id).ok_or_else(missing)?;
        if op_record.status != OperationStatus::Succeeded {
            return Err(missing());
        }

        let rows = match &op.step {
            OperationStep::Fetch { fields, .. } => {
                let output = op_record.output.as_ref().ok_or_else(missing)?;
                convert_rows(&op.id, fields, output)?
            }
            OperationStep::Join {
                left_key,
                right_key,
                mode,
            } => {
                let inputs = plan.inputs_of(idx);
                let left = self.input_rows(op, inputs[0])?;
                let right = self.input_rows(op, inputs[1])?;
                self.join(op, (inputs[0], &left[..]), (inputs[1], &right[..]), left_key, right_key, *mode)?
            }
            OperationStep::Union => {
                let mut parts = Vec::with_capacity(op.inputs.len());
                for &input in plan.inputs_of(idx) {
                    parts.push((input, self.input_rows(op, input)?));
                }
                self.union(parts)
            }
            OperationStep::Aggregate { group_by, measures } => {
                let input = plan.inputs_of(idx)[0];
                let rows = self.input_rows(op, input)?;
                group(op, &rows, group_by, measures)?
            }
        };

        tracing::debug!(operation_id = %op.id, kind = %op.kind(), rows = rows.len(), "materialized operation");
        self.memo.insert(idx, rows.clone());
        Ok(rows)
    }

    /// Rows of one input, or an empty set when it did not succeed and `op` allows that.
    fn input_rows(&mut self, op: &Operation, input_idx: usize) -> Result<Vec<ResultRow>, AggregationError> {
        let input = &self.plan.operations()[input_idx];
        if self.record.status(&input.id) == Some(OperationStatus::Succeeded) {
            return self.materialize(input_idx);
        }
        match op.fallback {
            InputFallback::EmptyResult => {
                self.warnings.push(Warning::for_operation(
                    op.id.clone(),
                    WarningKind::EmptyFallback,
                    format!("input '{}' did not succeed; treated as empty", input.id),
                ));
                Ok(Vec::new())
            }
            InputFallback::None => Err(AggregationError::MissingResult {
                operation_id: input.id.clone(),
            }),
        }
    }

    fn field_names(&self, idx: usize, rows: &[ResultRow]) -> Vec<(String, Option<SemanticType>)> {
        match self.plan.output_fields(&self.plan.operations()[idx].id) {
            Some(fields) if !fields.is_empty() => {
                fields.into_iter().map(|f| (f.name, Some(f.semantic_type))).collect()
            }
            _ => rows
                .iter()
                .flat_map(|r| r.fields.keys().cloned())
                .collect::<BTreeSet<String>>()
                .into_iter()
                .map(|name| (name, None))
                .collect(),
        }
    }

    fn join(
        &self,
        op: &Operation,
        (left_idx, left): (usize, &[ResultRow]),
        (right_idx, right): (usize, &[ResultRow]),
        left_key: &str,
        right_key: &str,
        mode: JoinMode,
    ) -> Result<Vec<ResultRow>, AggregationError> {
        let left_fields = self.field_names(left_idx, left);
        let right_fields = self.field_names(right_idx, right);
        let canonical = match (key_type(&left_fields, left_key), key_type(&right_fields, right_key)) {
            (Some(l), Some(r)) => Some(
                comparable_key_type(l, r).ok_or(AggregationError::IncomparableKeys { left: l, right: r })?,
            ),
            _ => None,
        };

        let left_input = &self.plan.operations()[left_idx].id;
        let right_input = &self.plan.operations()[right_idx].id;
        let left_keys = join_keys(&op.id, left_input, left, left_key, canonical)?;
        let right_keys = join_keys(&op.id, right_input, right, right_key, canonical)?;

        // (left row, matched right row); sorted so output is left-major either way
        let mut pairs: Vec<(usize, Option<usize>)> = Vec::new();
        if right.len() <= left.len() {
            let index = build_index(&right_keys);
            for (li, key) in left_keys.iter().enumerate() {
                match key.as_ref().and_then(|k| index.get(k)) {
                    Some(matches) => pairs.extend(matches.iter().map(|&ri| (li, Some(ri)))),
                    None if mode == JoinMode::LeftOuter => pairs.push((li, None)),
                    None => {}
                }
            }
        } else {
            let index = build_index(&left_keys);
            let mut matched = vec![false; left.len()];
            for (ri, key) in right_keys.iter().enumerate() {
                if let Some(matches) = key.as_ref().and_then(|k| index.get(k)) {
                    for &li in matches {
                        pairs.push((li, Some(ri)));
                        matched[li] = true;
                    }
                }
            }
            if mode == JoinMode::LeftOuter {
                pairs.extend(matched.iter().enumerate().filter(|(_, m)| !**m).map(|(li, _)| (li, None)));
            }
            pairs.sort_unstable();
        }

        let left_names: BTreeSet<&str> = left_fields.iter().map(|(name, _)| name.as_str()).collect();
        let label = self.plan.source_label(right_idx);
        let right_columns: Vec<(&str, String)> = right_fields
            .iter()
            .filter(|(name, _)| !(name == right_key && right_key == left_key))
            .map(|(name, _)| {
                let out = if left_names.contains(name.as_str()) {
                    format!("{}.{}", label, name)
                } else {
                    name.clone()
                };
                (name.as_str(), out)
            })
            .collect();

        let rows: Vec<ResultRow> = pairs
            .into_iter()
            .map(|(li, ri)| {
                let mut row = ResultRow::new(op.id.clone());
                row.fields = left[li].fields.clone();
                for (name, out) in &right_columns {
                    let value = ri
                        .and_then(|ri| right[ri].get(name).cloned())
                        .unwrap_or(Value::Null);
                    row.fields.insert(out.clone(), value);
                }
                row
            })
            .collect();

        tracing::debug!("JOIN {} produced {} rows from {} x {}", op.id, rows.len(), left.len(), right.len());
        Ok(rows)
    }

    fn union(&self, parts: Vec<(usize, Vec<ResultRow>)>) -> Vec<ResultRow> {
        let mut merged: Vec<(String, Option<SemanticType>)> = Vec::new();
        let mut renamed_parts = Vec::with_capacity(parts.len());

        for (idx, rows) in parts {
            let label = self.plan.source_label(idx);
            let mut renames: HashMap<String, String> = HashMap::new();
            for (name, ty) in self.field_names(idx, &rows) {
                let existing = merged.iter().find(|(n, _)| *n == name).map(|(_, t)| *t);
                match existing {
                    Some(Some(existing)) if ty.is_some_and(|t| t != existing) => {
                        let prefixed = format!("{}.{}", label, name);
                        renames.insert(name, prefixed.clone());
                        merged.push((prefixed, ty));
                    }
                    Some(_) => {}
                    None => merged.push((name, ty)),
                }
            }
            renamed_parts.push((rows, renames));
        }

        let mut out = Vec::new();
        for (rows, renames) in renamed_parts {
            for row in rows {
                let mut unified = ResultRow::new(row.provenance);
                for (name, value) in row.fields {
                    let name = renames.get(&name).cloned().unwrap_or(name);
                    unified.fields.insert(name, value);
                }
                for (name, _) in &merged {
                    unified.fields.entry(name.clone()).or_insert(Value::Null);
                }
                out.push(unified);
            }
        }
        out
    }
}

fn key_type(fields: &[(String, Option<SemanticType>)], key: &str) -> Option<SemanticType> {
    fields.iter().find(|(name, _)| name == key).and_then(|(_, ty)| *ty)
}

/// Convert raw adapter rows into typed rows using the declared field specs.
/// Without declarations every cell is inferred from its JSON form.
fn convert_rows(
    operation_id: &str,
    fields: &[FieldSpec],
    output: &OperationOutput,
) -> Result<Vec<ResultRow>, AggregationError> {
    output
        .rows
        .iter()
        .map(|raw| {
            let object = raw.as_object().ok_or_else(|| AggregationError::MalformedRow {
                operation_id: operation_id.to_string(),
            })?;
            let mut row = ResultRow::new(operation_id);
            if fields.is_empty() {
                for (name, cell) in object {
                    row.fields.insert(name.clone(), Value::from_json(cell));
                }
            } else {
                for field in fields {
                    let cell = object.get(&field.name).map(Value::from_json).unwrap_or(Value::Null);
                    row.fields.insert(field.name.clone(), coerce(&cell, field.semantic_type)?);
                }
            }
            Ok(row)
        })
        .collect()
}

fn join_keys(
    operation_id: &str,
    input: &str,
    rows: &[ResultRow],
    key: &str,
    canonical: Option<SemanticType>,
) -> Result<Vec<Option<KeyValue>>, AggregationError> {
    rows.iter()
        .map(|row| {
            let value = row.get(key).ok_or_else(|| AggregationError::MissingKeyField {
                operation_id: operation_id.to_string(),
                input: input.to_string(),
                field: key.to_string(),
            })?;
            let value = match canonical {
                Some(ty) => coerce(value, ty)?,
                None => value.clone(),
            };
            Ok(key_of(&value))
        })
        .collect()
}

fn build_index(keys: &[Option<KeyValue>]) -> HashMap<&KeyValue, Vec<usize>> {
    let mut index: HashMap<&KeyValue, Vec<usize>> = HashMap::new();
    for (i, key) in keys.iter().enumerate() {
        if let Some(key) = key {
            index.entry(key).or_default().push(i);
        }
    }
    index
}

/// Group rows in first-occurrence order and evaluate each measure per group.
fn group(
    op: &Operation,
    rows: &[ResultRow],
    group_by: &[String],
    measures: &[Measure],
) -> Result<Vec<ResultRow>, AggregationError> {
    let mut groups: Vec<Vec<&ResultRow>> = Vec::new();
    let mut index: HashMap<Vec<Option<KeyValue>>, usize> = HashMap::new();

    for row in rows {
        let key: Vec<Option<KeyValue>> = group_by
            .iter()
            .map(|name| row.get(name).and_then(key_of))
            .collect();
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(row);
    }
    if groups.is_empty() && group_by.is_empty() {
        groups.push(Vec::new());
    }

    groups
        .into_iter()
        .map(|members| {
            let mut out = ResultRow::new(op.id.clone());
            for name in group_by {
                let value = members
                    .first()
                    .and_then(|r| r.get(name).cloned())
                    .unwrap_or(Value::Null);
                out.fields.insert(name.clone(), value);
            }
            for measure in measures {
                out.fields.insert(measure.alias.clone(), evaluate(measure, &members)?);
            }
            Ok(out)
        })
        .collect()
}

fn evaluate(measure: &Measure, rows: &[&ResultRow]) -> Result<Value, AggregationError> {
    let Some(field) = measure.field.as_deref() else {
        return Ok(Value::Integer(rows.len() as i64));
    };
    let values: Vec<&Value> = rows
        .iter()
        .filter_map(|r| r.get(field))
        .filter(|v| !v.is_null())
        .collect();

    match measure.function {
        AggregateFunction::Count => Ok(Value::Integer(values.len() as i64)),
        AggregateFunction::Sum if values.is_empty() => Ok(Value::Null),
        AggregateFunction::Sum => {
            let integers: Option<Vec<i64>> = values
                .iter()
                .map(|v| match v {
                    Value::Integer(i) => Some(*i),
                    _ => None,
                })
                .collect();
            if let Some(sum) = integers.and_then(|ints| ints.into_iter().try_fold(0i64, i64::checked_add)) {
                return Ok(Value::Integer(sum));
            }
            Ok(Value::Float(floats(&values)?.iter().sum()))
        }
        AggregateFunction::Avg if values.is_empty() => Ok(Value::Null),
        AggregateFunction::Avg => {
            let floats = floats(&values)?;
            Ok(Value::Float(floats.iter().sum::<f64>() / floats.len() as f64))
        }
        AggregateFunction::Min => extreme(&values, Ordering::Less),
        AggregateFunction::Max => extreme(&values, Ordering::Greater),
    }
}

fn floats(values: &[&Value]) -> Result<Vec<f64>, AggregationError> {
    values
        .iter()
        .map(|v| match coerce(v, SemanticType::Float)? {
            Value::Float(f) => Ok(f),
            other => Err(AggregationError::InvalidValue {
                value: format!("{:?}", other),
                to: SemanticType::Float,
                reason: "not numeric".to_string(),
            }),
        })
        .collect()
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) | (Value::Timestamp(x), Value::Timestamp(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Boolean(x), Value::Boolean(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn extreme(values: &[&Value], wanted: Ordering) -> Result<Value, AggregationError> {
    let Some((first, rest)) = values.split_first() else {
        return Ok(Value::Null);
    };
    let Some(target) = first.semantic_type() else {
        return Ok(Value::Null);
    };
    let mut best = (*first).clone();
    for value in rest {
        let candidate = coerce(value, target)?;
        match compare(&candidate, &best) {
            Some(ordering) if ordering == wanted => best = candidate,
            Some(_) => {}
            None => {
                return Err(AggregationError::UnsupportedCoercion {
                    from: candidate.semantic_type().unwrap_or(target),
                    to: target,
                })
            }
        }
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use crate::models::{OperationBuilder, PlanMetadata, QueryPayload};
    use serde_json::json;

    fn fetch(id: &str, source: &str, fields: Vec<FieldSpec>) -> Operation {
        OperationBuilder::fetch(id, source, "t")
            .fields(fields)
            .payload(QueryPayload::Json(json!({"collection": "t"})))
            .build()
            .unwrap()
    }

    fn users() -> Operation {
        fetch(
            "users",
            "crm",
            vec![
                FieldSpec::key("id", SemanticType::Integer),
                FieldSpec::new("name", SemanticType::Text),
            ],
        )
    }

    fn orders() -> Operation {
        fetch(
            "orders",
            "billing",
            vec![
                FieldSpec::key("id", SemanticType::Integer),
                FieldSpec::new("amt", SemanticType::Integer),
            ],
        )
    }

    fn join(mode: JoinMode) -> Operation {
        OperationBuilder::join("joined", "users", "orders")
            .on("id", "id")
            .mode(mode)
            .build()
            .unwrap()
    }

    fn succeed(record: &mut ExecutionRecord, id: &str, rows: Vec<serde_json::Value>) {
        record.entry(id).mark_succeeded(Some(OperationOutput::new(rows, 1)), 1);
    }

    fn run(ops: Vec<Operation>, final_output: &str, outputs: Vec<(&str, Vec<serde_json::Value>)>) -> (Plan, ExecutionRecord) {
        let plan = Plan::new(ops, final_output, PlanMetadata::new("q", vec![])).unwrap();
        let mut record = ExecutionRecord::for_plan(&plan);
        for op in plan.operations() {
            if !op.is_fetch() {
                record.entry(&op.id).mark_succeeded(None, 1);
            }
        }
        for (id, rows) in outputs {
            succeed(&mut record, id, rows);
        }
        (plan, record)
    }

    #[test]
    fn test_inner_join_example() {
        let (plan, record) = run(
            vec![users(), orders(), join(JoinMode::Inner)],
            "joined",
            vec![
                ("users", vec![json!({"id": 1, "name": "a"}), json!({"id": 2, "name": "b"})]),
                ("orders", vec![json!({"id": 1, "amt": 10})]),
            ],
        );
        let output = aggregate(&record, &plan).unwrap();
        assert_eq!(output.rows_json(), vec![json!({"id": 1, "name": "a", "amt": 10})]);
        assert_eq!(output.rows[0].provenance, "joined");
        assert!(output.warnings.is_empty());
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let (plan, record) = run(
            vec![users(), orders(), join(JoinMode::LeftOuter)],
            "joined",
            vec![
                ("users", vec![json!({"id": 2, "name": "b"}), json!({"id": 1, "name": "a"})]),
                ("orders", vec![json!({"id": 1, "amt": 10}), json!({"id": 1, "amt": 5})]),
            ],
        );
        let first = aggregate(&record, &plan).unwrap();
        let second = aggregate(&record, &plan).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_left_outer_null_fills_and_keeps_left_order() {
        let (plan, record) = run(
            vec![users(), orders(), join(JoinMode::LeftOuter)],
            "joined",
            vec![
                ("users", vec![json!({"id": 2, "name": "b"}), json!({"id": 1, "name": "a"})]),
                (
                    "orders",
                    vec![json!({"id": 1, "amt": 10}), json!({"id": 1, "amt": 5}), json!({"id": 9, "amt": 1})],
                ),
            ],
        );
        // right side is larger here, so the left input is the one indexed
        let rows = aggregate(&record, &plan).unwrap().rows_json();
        assert_eq!(
            rows,
            vec![
                json!({"id": 2, "name": "b", "amt": null}),
                json!({"id": 1, "name": "a", "amt": 10}),
                json!({"id": 1, "name": "a", "amt": 5}),
            ]
        );
    }

    #[test]
    fn test_join_coerces_keys_to_common_type() {
        let events = fetch(
            "events",
            "logs",
            vec![
                FieldSpec::key("id", SemanticType::Text),
                FieldSpec::new("kind", SemanticType::Text),
            ],
        );
        let join = OperationBuilder::join("joined", "users", "events").on("id", "id").build().unwrap();
        let (plan, record) = run(
            vec![users(), events, join],
            "joined",
            vec![
                ("users", vec![json!({"id": 1, "name": "a"})]),
                ("events", vec![json!({"id": "1", "kind": "login"}), json!({"id": null, "kind": "x"})]),
            ],
        );
        let rows = aggregate(&record, &plan).unwrap().rows_json();
        assert_eq!(rows, vec![json!({"id": 1, "name": "a", "kind": "login"})]);
    }

    #[test]
    fn test_missing_key_field_is_an_error() {
        let untyped = fetch("orders", "billing", vec![]);
        let (plan, record) = run(
            vec![users(), untyped, join(JoinMode::Inner)],
            "joined",
            vec![
                ("users", vec![json!({"id": 1, "name": "a"})]),
                ("orders", vec![json!({"amt": 10})]),
            ],
        );
        assert_eq!(
            aggregate(&record, &plan).unwrap_err(),
            AggregationError::MissingKeyField {
                operation_id: "joined".into(),
                input: "orders".into(),
                field: "id".into(),
            }
        );
    }

    #[test]
    fn test_incomparable_key_types_are_an_error() {
        let flags = fetch("orders", "billing", vec![FieldSpec::key("id", SemanticType::Boolean)]);
        let (plan, record) = run(
            vec![users(), flags, join(JoinMode::Inner)],
            "joined",
            vec![("users", vec![]), ("orders", vec![])],
        );
        assert!(matches!(
            aggregate(&record, &plan),
            Err(AggregationError::IncomparableKeys { .. })
        ));
    }

    #[test]
    fn test_union_prefixes_conflicting_fields() {
        let archive = fetch(
            "archive_users",
            "archive",
            vec![
                FieldSpec::key("id", SemanticType::Text),
                FieldSpec::new("name", SemanticType::Text),
            ],
        );
        let union = OperationBuilder::union("all_users", ["users", "archive_users"]).build().unwrap();
        let (plan, record) = run(
            vec![users(), archive, union],
            "all_users",
            vec![
                ("users", vec![json!({"id": 1, "name": "a"})]),
                ("archive_users", vec![json!({"id": "u-7", "name": "z"})]),
            ],
        );
        let output = aggregate(&record, &plan).unwrap();
        assert_eq!(
            output.rows_json(),
            vec![
                json!({"id": 1, "name": "a", "archive.id": null}),
                json!({"id": null, "name": "z", "archive.id": "u-7"}),
            ]
        );
        assert_eq!(output.rows[1].provenance, "archive_users");
    }

    #[test]
    fn test_grouping_and_measures() {
        let agg = OperationBuilder::aggregate("totals", "orders")
            .group_by(["id"])
            .measure(Measure::count("n"))
            .measure(Measure::of(AggregateFunction::Sum, "amt", "total"))
            .measure(Measure::of(AggregateFunction::Avg, "amt", "mean"))
            .measure(Measure::of(AggregateFunction::Max, "amt", "top"))
            .build()
            .unwrap();
        let (plan, record) = run(
            vec![orders(), agg],
            "totals",
            vec![(
                "orders",
                vec![
                    json!({"id": 2, "amt": 4}),
                    json!({"id": 1, "amt": 10}),
                    json!({"id": 2, "amt": null}),
                    json!({"id": 2, "amt": 6}),
                ],
            )],
        );
        assert_eq!(
            aggregate(&record, &plan).unwrap().rows_json(),
            vec![
                json!({"id": 2, "n": 3, "total": 10, "mean": 5.0, "top": 6}),
                json!({"id": 1, "n": 1, "total": 10, "mean": 10.0, "top": 10}),
            ]
        );
    }

    #[test]
    fn test_empty_fallback_and_missing_inputs() {
        let lenient = OperationBuilder::join("joined", "users", "orders")
            .on("id", "id")
            .mode(JoinMode::LeftOuter)
            .fallback(InputFallback::EmptyResult)
            .build()
            .unwrap();
        let (plan, mut record) = run(
            vec![users(), orders(), lenient],
            "joined",
            vec![("users", vec![json!({"id": 1, "name": "a"})])],
        );
        record.entry("orders").mark_failed(ExecutionError::Fatal("denied".into()), 1);

        let output = aggregate(&record, &plan).unwrap();
        assert_eq!(output.rows_json(), vec![json!({"id": 1, "name": "a", "amt": null})]);
        assert_eq!(output.warnings.len(), 1);
        assert_eq!(output.warnings[0].kind, WarningKind::EmptyFallback);

        let (plan, mut record) = run(vec![users(), orders(), join(JoinMode::Inner)], "joined", vec![]);
        record.entry("joined").mark_skipped("input failed");
        assert_eq!(
            aggregate(&record, &plan).unwrap_err(),
            AggregationError::MissingResult {
                operation_id: "joined".into()
            }
        );
    }

    #[test]
    fn test_non_object_rows_are_rejected() {
        let (plan, record) = run(vec![users()], "users", vec![("users", vec![json!([1, 2])])]);
        assert!(matches!(
            aggregate(&record, &plan),
            Err(AggregationError::MalformedRow { .. })
        ));
    }
}
