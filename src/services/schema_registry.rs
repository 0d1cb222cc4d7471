// Schema registry
//
// Holds source descriptors and the current field contract of every
// (source, table) pair. Readers take `Arc` snapshots under a short read lock
// and never wait on writers; writers serialize per (source, table) so two
// refreshes of the same table cannot interleave their version bumps.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::{AppError, ValidationError, Violation};
use crate::models::{
    ContractVersion, FieldContract, FieldSpec, Operation, OperationStep, Plan, QueryPayload,
    SourceDescriptor,
};
use crate::services::coercion::comparable_key_type;
use crate::storage::SqliteStorage;
use crate::validation::PayloadValidator;

type ContractKey = (String, String);

/// Outcome of checking a plan against the registry's current contracts.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub valid: bool,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            valid: violations.is_empty(),
            violations,
        }
    }

    /// Ids of operations with at least one violation.
    pub fn violating_operations(&self) -> BTreeSet<&str> {
        self.violations.iter().map(|v| v.operation_id.as_str()).collect()
    }

    pub fn for_operation<'a>(&'a self, operation_id: &'a str) -> impl Iterator<Item = &'a Violation> {
        self.violations.iter().filter(move |v| v.operation_id == operation_id)
    }

    /// One line per violation, as fed back into regeneration.
    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(|v| v.to_string()).collect()
    }
}

pub struct SchemaRegistry {
    sources: RwLock<HashMap<String, SourceDescriptor>>,
    contracts: RwLock<HashMap<ContractKey, Arc<FieldContract>>>,
    write_locks: Mutex<HashMap<ContractKey, Arc<tokio::sync::Mutex<()>>>>,
    storage: Option<Arc<SqliteStorage>>,
}

impl SchemaRegistry {
    /// Registry without persistence, used by tests and one-shot tools.
    pub fn in_memory() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            contracts: RwLock::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
            storage: None,
        }
    }

    /// Registry backed by SQLite, preloaded with every persisted source and current contract.
    pub async fn open(storage: Arc<SqliteStorage>) -> Result<Self, AppError> {
        let sources = storage.list_sources().await?;
        let contracts = storage.load_current_contracts().await?;
        tracing::info!(
            sources = sources.len(),
            contracts = contracts.len(),
            "loaded schema registry"
        );

        let registry = Self {
            storage: Some(storage),
            ..Self::in_memory()
        };
        {
            let mut map = registry.sources.write().unwrap_or_else(PoisonError::into_inner);
            for source in sources {
                map.insert(source.id.clone(), source);
            }
        }
        {
            let mut map = registry.contracts.write().unwrap_or_else(PoisonError::into_inner);
            for contract in contracts {
                map.insert((contract.source_id.clone(), contract.table.clone()), Arc::new(contract));
            }
        }
        Ok(registry)
    }

    /// Register or update a source. `created_at` of an existing entry is kept.
    pub async fn upsert_source(&self, mut source: SourceDescriptor) -> Result<(), AppError> {
        if let Some(existing) = self.source(&source.id) {
            source.created_at = existing.created_at;
            source.updated_at = chrono::Utc::now();
        }
        if let Some(storage) = &self.storage {
            storage.save_source(&source).await?;
        }
        tracing::info!(source_id = %source.id, kind = %source.kind, enabled = source.enabled, "registered source");
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source.id.clone(), source);
        Ok(())
    }

    pub fn source(&self, source_id: &str) -> Option<SourceDescriptor> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_id)
            .cloned()
    }

    /// All sources, highest priority first, then by id.
    pub fn list_sources(&self) -> Vec<SourceDescriptor> {
        let mut sources: Vec<SourceDescriptor> = self
            .sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        sources.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        sources
    }

    /// Current contract for one table.
    pub fn list_fields(&self, source_id: &str, table: &str) -> Result<Arc<FieldContract>, AppError> {
        self.contract(source_id, table).ok_or_else(|| {
            AppError::NotFound(format!("no field contract for {}.{}", source_id, table))
        })
    }

    fn contract(&self, source_id: &str, table: &str) -> Option<Arc<FieldContract>> {
        self.contracts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(source_id.to_string(), table.to_string()))
            .cloned()
    }

    /// Current contracts of every table of a source, ordered by table name.
    pub fn contracts_for(&self, source_id: &str) -> Vec<Arc<FieldContract>> {
        let mut contracts: Vec<Arc<FieldContract>> = self
            .contracts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.source_id == source_id)
            .cloned()
            .collect();
        contracts.sort_by(|a, b| a.table.cmp(&b.table));
        contracts
    }

    pub fn current_version(&self, source_id: &str, table: &str) -> Option<ContractVersion> {
        self.contract(source_id, table).map(|c| c.version_stamp())
    }

    /// Versions of every (source, table) fetched by the given operations.
    pub fn version_snapshot<'a>(&self, operations: impl IntoIterator<Item = &'a Operation>) -> Vec<ContractVersion> {
        operations
            .into_iter()
            .filter_map(|op| match &op.step {
                OperationStep::Fetch { source_id, table, .. } => self.current_version(source_id, table),
                _ => None,
            })
            .collect()
    }

    fn write_lock(&self, key: &ContractKey) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Install new field content for a table.
    ///
    /// The version only moves when the content hash changes; the stored
    /// contract is returned either way.
    pub async fn upsert_fields(
        &self,
        source_id: &str,
        table: &str,
        contract: FieldContract,
    ) -> Result<Arc<FieldContract>, AppError> {
        if self.source(source_id).is_none() {
            return Err(AppError::NotFound(format!("source '{}' is not registered", source_id)));
        }

        let key = (source_id.to_string(), table.to_string());
        let lock = self.write_lock(&key);
        let _guard = lock.lock().await;

        let next = match self.contract(source_id, table) {
            None => FieldContract::new(source_id, table, contract.fields),
            Some(current) => match current.next_version(contract.fields) {
                None => {
                    tracing::debug!(source_id, table, version = current.version, "field contract unchanged");
                    return Ok(current);
                }
                Some(next) => next,
            },
        };

        if let Some(storage) = &self.storage {
            storage.save_contract(&next).await?;
        }

        tracing::info!(
            source_id,
            table,
            version = next.version,
            fields = next.fields.len(),
            "installed field contract"
        );

        let next = Arc::new(next);
        self.contracts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, next.clone());
        Ok(next)
    }

    /// Check every operation of `plan` against the current contracts.
    pub fn validate(&self, plan: &Plan) -> ValidationReport {
        let mut violations = Vec::new();
        for op in plan.operations() {
            let mut push = |error: ValidationError| {
                violations.push(Violation {
                    operation_id: op.id.clone(),
                    error,
                })
            };
            match &op.step {
                OperationStep::Fetch {
                    source_id,
                    table,
                    fields,
                    payload,
                } => self.validate_fetch(source_id, table, fields, payload, &mut push),
                OperationStep::Join { left_key, right_key, .. } => {
                    validate_join(plan, op, left_key, right_key, &mut push)
                }
                OperationStep::Union => validate_union(plan, op, &mut push),
                OperationStep::Aggregate { group_by, measures } => {
                    let Some(input) = plan.output_fields(&op.inputs[0]) else {
                        continue;
                    };
                    let referenced = group_by
                        .iter()
                        .chain(measures.iter().filter_map(|m| m.field.as_ref()));
                    for name in referenced {
                        if !input.iter().any(|f| &f.name == name) {
                            push(ValidationError::UnknownAggregateField { field: name.clone() });
                        }
                    }
                }
            }
        }

        if !violations.is_empty() {
            tracing::debug!(plan_id = %plan.id(), violations = violations.len(), "plan failed validation");
        }
        ValidationReport::from_violations(violations)
    }

    fn validate_fetch(
        &self,
        source_id: &str,
        table: &str,
        fields: &[FieldSpec],
        payload: &QueryPayload,
        push: &mut impl FnMut(ValidationError),
    ) {
        match self.source(source_id) {
            None => {
                push(ValidationError::UnknownSource {
                    source_id: source_id.to_string(),
                });
                return;
            }
            Some(source) if !source.enabled => {
                push(ValidationError::SourceDisabled {
                    source_id: source_id.to_string(),
                });
                return;
            }
            Some(_) => {}
        }

        let Some(contract) = self.contract(source_id, table) else {
            push(ValidationError::MissingContract {
                source_id: source_id.to_string(),
                table: table.to_string(),
            });
            return;
        };

        for field in fields {
            match contract.field(&field.name) {
                None => push(ValidationError::UnknownField {
                    source_id: source_id.to_string(),
                    table: table.to_string(),
                    field: field.name.clone(),
                }),
                Some(actual) if actual.semantic_type != field.semantic_type => {
                    push(ValidationError::FieldTypeMismatch {
                        source_id: source_id.to_string(),
                        table: table.to_string(),
                        field: field.name.clone(),
                        declared: field.semantic_type,
                        actual: actual.semantic_type,
                    })
                }
                Some(_) => {}
            }
        }

        if let QueryPayload::Sql(sql) = payload {
            match PayloadValidator::referenced_columns(sql) {
                Ok(columns) => {
                    let known: BTreeSet<String> =
                        contract.fields.iter().map(|f| f.name.to_lowercase()).collect();
                    let declared: BTreeSet<String> = fields.iter().map(|f| f.name.to_lowercase()).collect();
                    for column in columns {
                        if !known.contains(&column) && !declared.contains(&column) {
                            push(ValidationError::UnknownField {
                                source_id: source_id.to_string(),
                                table: table.to_string(),
                                field: column,
                            });
                        }
                    }
                }
                Err(message) => push(ValidationError::InvalidPayload { message }),
            }
        }
    }
}

fn validate_join(
    plan: &Plan,
    op: &Operation,
    left_key: &str,
    right_key: &str,
    push: &mut impl FnMut(ValidationError),
) {
    let (left_id, right_id) = (&op.inputs[0], &op.inputs[1]);
    let (Some(left), Some(right)) = (plan.output_fields(left_id), plan.output_fields(right_id)) else {
        return;
    };

    let left_field = left.iter().find(|f| f.name == left_key);
    let right_field = right.iter().find(|f| f.name == right_key);
    if left_field.is_none() {
        push(ValidationError::MissingJoinKey {
            input: left_id.clone(),
            key: left_key.to_string(),
        });
    }
    if right_field.is_none() {
        push(ValidationError::MissingJoinKey {
            input: right_id.clone(),
            key: right_key.to_string(),
        });
    }
    if let (Some(l), Some(r)) = (left_field, right_field) {
        if comparable_key_type(l.semantic_type, r.semantic_type).is_none() {
            push(ValidationError::IncompatibleKeyTypes {
                left_key: left_key.to_string(),
                left_type: l.semantic_type,
                right_key: right_key.to_string(),
                right_type: r.semantic_type,
            });
        }
    }
}

fn validate_union(plan: &Plan, op: &Operation, push: &mut impl FnMut(ValidationError)) {
    let mut shared: Option<BTreeSet<String>> = None;
    for input in &op.inputs {
        let Some(fields) = plan.output_fields(input) else {
            return;
        };
        let names: BTreeSet<String> = fields.into_iter().map(|f| f.name).collect();
        shared = Some(match shared {
            None => names,
            Some(acc) => acc.intersection(&names).cloned().collect(),
        });
    }
    if shared.map(|s| s.is_empty()).unwrap_or(false) {
        push(ValidationError::DisjointUnion {
            inputs: op.inputs.clone(),
        });
    }
}
