// Operation model
//
// Operations are a tagged union over the four step kinds. Every operation is
// produced by `OperationBuilder`, which rejects shapes the executor and
// aggregator cannot handle before they ever reach a plan.

use serde::{Deserialize, Serialize};

use crate::error::PlanningError;
use crate::models::FieldSpec;
use crate::validation::PayloadValidator;

/// Source-specific query body. The core only inspects SQL bodies for safety.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "format", content = "body", rename_all = "snake_case")]
pub enum QueryPayload {
    Sql(String),
    Json(serde_json::Value),
}

impl QueryPayload {
    /// Stable textual form, used for cache keys.
    pub fn fingerprint(&self) -> String {
        match self {
            QueryPayload::Sql(sql) => format!("sql:{}", sql.trim()),
            QueryPayload::Json(value) => format!("json:{}", value),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    #[default]
    Inner,
    /// Unmatched left rows are kept with right-side fields null-filled.
    LeftOuter,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Measure {
    pub function: AggregateFunction,
    /// `None` only for `Count`, meaning count rows.
    pub field: Option<String>,
    pub alias: String,
}

impl Measure {
    pub fn count(alias: impl Into<String>) -> Self {
        Self {
            function: AggregateFunction::Count,
            field: None,
            alias: alias.into(),
        }
    }

    pub fn of(function: AggregateFunction, field: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            function,
            field: Some(field.into()),
            alias: alias.into(),
        }
    }
}

/// What a dependent does when one of its inputs did not succeed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputFallback {
    /// The dependent is skipped.
    #[default]
    None,
    /// The failed input contributes an empty result set.
    EmptyResult,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Fetch,
    Join,
    Union,
    Aggregate,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Fetch => "fetch",
            OperationKind::Join => "join",
            OperationKind::Union => "union",
            OperationKind::Aggregate => "aggregate",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OperationStep {
    Fetch {
        source_id: String,
        table: String,
        fields: Vec<FieldSpec>,
        payload: QueryPayload,
    },
    Join {
        left_key: String,
        right_key: String,
        mode: JoinMode,
    },
    Union,
    Aggregate {
        group_by: Vec<String>,
        measures: Vec<Measure>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    pub id: String,
    /// Declared output name.
    pub output: String,
    /// Declared input operation ids; for joins `[left, right]`.
    pub inputs: Vec<String>,
    #[serde(default)]
    pub fallback: InputFallback,
    pub step: OperationStep,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self.step {
            OperationStep::Fetch { .. } => OperationKind::Fetch,
            OperationStep::Join { .. } => OperationKind::Join,
            OperationStep::Union => OperationKind::Union,
            OperationStep::Aggregate { .. } => OperationKind::Aggregate,
        }
    }

    /// Target source; only fetches talk to an adapter.
    pub fn source_id(&self) -> Option<&str> {
        match &self.step {
            OperationStep::Fetch { source_id, .. } => Some(source_id),
            _ => None,
        }
    }

    pub fn table(&self) -> Option<&str> {
        match &self.step {
            OperationStep::Fetch { table, .. } => Some(table),
            _ => None,
        }
    }

    pub fn is_fetch(&self) -> bool {
        self.kind() == OperationKind::Fetch
    }
}

/// Builder that only emits well-formed operations.
#[derive(Debug, Clone)]
pub struct OperationBuilder {
    id: String,
    output: Option<String>,
    inputs: Vec<String>,
    fallback: InputFallback,
    kind: OperationKind,
    source_id: Option<String>,
    table: Option<String>,
    fields: Vec<FieldSpec>,
    payload: Option<QueryPayload>,
    left_key: Option<String>,
    right_key: Option<String>,
    mode: JoinMode,
    group_by: Vec<String>,
    measures: Vec<Measure>,
}

impl OperationBuilder {
    fn new(id: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            id: id.into(),
            output: None,
            inputs: Vec::new(),
            fallback: InputFallback::None,
            kind,
            source_id: None,
            table: None,
            fields: Vec::new(),
            payload: None,
            left_key: None,
            right_key: None,
            mode: JoinMode::Inner,
            group_by: Vec::new(),
            measures: Vec::new(),
        }
    }

    pub fn fetch(id: impl Into<String>, source_id: impl Into<String>, table: impl Into<String>) -> Self {
        let mut builder = Self::new(id, OperationKind::Fetch);
        builder.source_id = Some(source_id.into());
        builder.table = Some(table.into());
        builder
    }

    pub fn join(id: impl Into<String>, left: impl Into<String>, right: impl Into<String>) -> Self {
        let mut builder = Self::new(id, OperationKind::Join);
        builder.inputs = vec![left.into(), right.into()];
        builder
    }

    pub fn union<I, S>(id: impl Into<String>, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut builder = Self::new(id, OperationKind::Union);
        builder.inputs = inputs.into_iter().map(Into::into).collect();
        builder
    }

    pub fn aggregate(id: impl Into<String>, input: impl Into<String>) -> Self {
        let mut builder = Self::new(id, OperationKind::Aggregate);
        builder.inputs = vec![input.into()];
        builder
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn fallback(mut self, fallback: InputFallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(mut self, fields: Vec<FieldSpec>) -> Self {
        self.fields = fields;
        self
    }

    pub fn payload(mut self, payload: QueryPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn on(mut self, left_key: impl Into<String>, right_key: impl Into<String>) -> Self {
        self.left_key = Some(left_key.into());
        self.right_key = Some(right_key.into());
        self
    }

    pub fn mode(mut self, mode: JoinMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn group_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn measure(mut self, measure: Measure) -> Self {
        self.measures.push(measure);
        self
    }

    fn reject(&self, reason: impl Into<String>) -> PlanningError {
        PlanningError::MalformedOperation {
            operation_id: self.id.clone(),
            reason: reason.into(),
        }
    }

    pub fn build(self) -> Result<Operation, PlanningError> {
        if self.id.trim().is_empty() {
            return Err(self.reject("operation id must not be empty"));
        }
        if self.inputs.iter().any(|input| input == &self.id) {
            return Err(self.reject("operation cannot consume its own output"));
        }
        for (i, input) in self.inputs.iter().enumerate() {
            if self.inputs[..i].contains(input) {
                return Err(self.reject(format!("input '{}' declared twice", input)));
            }
        }

        let step = match self.kind {
            OperationKind::Fetch => self.fetch_step()?,
            OperationKind::Join => self.join_step()?,
            OperationKind::Union => {
                if self.inputs.len() < 2 {
                    return Err(self.reject("union needs at least two inputs"));
                }
                OperationStep::Union
            }
            OperationKind::Aggregate => self.aggregate_step()?,
        };

        let output = self.output.unwrap_or_else(|| self.id.clone());
        Ok(Operation {
            id: self.id,
            output,
            inputs: self.inputs,
            fallback: self.fallback,
            step,
        })
    }

    fn fetch_step(&self) -> Result<OperationStep, PlanningError> {
        let source_id = match self.source_id.as_deref() {
            Some(s) if !s.trim().is_empty() => s.to_string(),
            _ => return Err(self.reject("fetch needs a target source")),
        };
        let table = match self.table.as_deref() {
            Some(t) if !t.trim().is_empty() => t.to_string(),
            _ => return Err(self.reject("fetch needs a table or collection")),
        };
        if !self.inputs.is_empty() {
            return Err(self.reject("fetch takes no inputs"));
        }
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| self.reject("fetch needs a query payload"))?;
        match &payload {
            QueryPayload::Sql(sql) => {
                PayloadValidator::validate_select_only(sql).map_err(|e| self.reject(e))?;
            }
            QueryPayload::Json(value) => {
                if !value.is_object() {
                    return Err(self.reject("JSON payload must be an object"));
                }
            }
        }
        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(self.reject(format!("field '{}' declared twice", field.name)));
            }
        }
        Ok(OperationStep::Fetch {
            source_id,
            table,
            fields: self.fields.clone(),
            payload,
        })
    }

    fn join_step(&self) -> Result<OperationStep, PlanningError> {
        if self.inputs.len() != 2 {
            return Err(self.reject("join needs exactly two inputs"));
        }
        match (self.left_key.as_deref(), self.right_key.as_deref()) {
            (Some(l), Some(r)) if !l.is_empty() && !r.is_empty() => Ok(OperationStep::Join {
                left_key: l.to_string(),
                right_key: r.to_string(),
                mode: self.mode,
            }),
            _ => Err(self.reject("join needs a key on both sides")),
        }
    }

    fn aggregate_step(&self) -> Result<OperationStep, PlanningError> {
        if self.inputs.len() != 1 {
            return Err(self.reject("aggregate needs exactly one input"));
        }
        if self.group_by.is_empty() && self.measures.is_empty() {
            return Err(self.reject("aggregate needs a grouping or a measure"));
        }
        for measure in &self.measures {
            if measure.field.is_none() && measure.function != AggregateFunction::Count {
                return Err(self.reject(format!("measure '{}' needs a field", measure.alias)));
            }
        }
        Ok(OperationStep::Aggregate {
            group_by: self.group_by.clone(),
            measures: self.measures.clone(),
        })
    }
}
