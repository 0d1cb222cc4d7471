// PostgreSQL source adapter using connection pooling
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Pool, PoolError};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};
use tokio_postgres::types::Type;
use url::Url;

use crate::error::{AppError, ExecutionError};
use crate::models::{FieldContract, FieldSpec, OperationOutput, QueryPayload, SemanticType, SourceKind};
use crate::services::sources::SourceAdapter;
use crate::validation::PayloadValidator;

pub struct PostgresAdapter {
    pool: Pool,
    row_limit: u64,
}

impl PostgresAdapter {
    pub fn new(pool: Pool, connection_url: &str, row_limit: u64) -> Result<Self, AppError> {
        let url = Url::parse(connection_url)
            .map_err(|e| AppError::Validation(format!("Invalid PostgreSQL URL: {}", e)))?;

        if url.scheme() != "postgresql" && url.scheme() != "postgres" {
            return Err(AppError::Validation(
                "URL must use postgresql:// or postgres:// scheme".to_string(),
            ));
        }

        Ok(Self { pool, row_limit })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, ExecutionError> {
        self.pool.get().await.map_err(classify_pool_error)
    }
}

/// SQLSTATE classes worth retrying: connection exceptions, serialization
/// failures and deadlocks, resource exhaustion, operator intervention.
pub fn is_retryable_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || matches!(code, "40001" | "40P01" | "57014" | "57P01" | "57P02" | "57P03")
}

fn classify_pg_error(e: tokio_postgres::Error) -> ExecutionError {
    match e.as_db_error() {
        Some(db_error) => {
            let code = db_error.code().code();
            let message = format!("Code: {}, Message: {}", code, db_error.message());
            if is_retryable_sqlstate(code) {
                ExecutionError::Retryable(message)
            } else {
                ExecutionError::Fatal(message)
            }
        }
        // No server response: the connection itself broke.
        None => ExecutionError::Retryable(e.to_string()),
    }
}

fn classify_pool_error(e: PoolError) -> ExecutionError {
    match e {
        PoolError::Backend(e) => classify_pg_error(e),
        PoolError::Timeout(_) => ExecutionError::Retryable("timed out waiting for a pooled connection".to_string()),
        other => ExecutionError::Fatal(format!("Failed to get connection from pool: {}", other)),
    }
}

fn cell_to_json(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Value {
    let converted = match *ty {
        Type::INT2 => row.try_get::<_, Option<i16>>(idx).map(|v| v.map(|v| json!(v))),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx).map(|v| v.map(|v| json!(v))),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).map(|v| v.map(|v| json!(v))),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx).map(|v| v.map(|v| json!(v))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map(|v| v.map(|v| json!(v))),
        Type::BOOL => row.try_get::<_, Option<bool>>(idx).map(|v| v.map(|v| json!(v))),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .map(|v| v.map(|v| json!(v.to_rfc3339()))),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .map(|v| v.map(|v| json!(v.and_utc().to_rfc3339()))),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .map(|v| v.map(|v| json!(v.to_string()))),
        Type::FLOAT4_ARRAY => row
            .try_get::<_, Option<Vec<f32>>>(idx)
            .map(|v| v.map(|v| json!(v))),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx),
        _ => row.try_get::<_, Option<String>>(idx).map(|v| v.map(Value::String)),
    };
    match converted {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        // Types with no textual mapping are surfaced by name
        Err(_) => json!(format!("<{}>", ty.name())),
    }
}

#[async_trait::async_trait]
impl SourceAdapter for PostgresAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Relational
    }

    async fn connect(&self) -> Result<(), ExecutionError> {
        self.client().await.map(|_| ())
    }

    async fn introspect(&self, source_id: &str) -> Result<Vec<FieldContract>, ExecutionError> {
        let client = self.client().await?;

        let key_rows = client
            .query(
                r#"
                SELECT kcu.table_schema, kcu.table_name, kcu.column_name
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage kcu
                  ON tc.constraint_name = kcu.constraint_name
                 AND tc.table_schema = kcu.table_schema
                WHERE tc.constraint_type = 'PRIMARY KEY'
                "#,
                &[],
            )
            .await
            .map_err(classify_pg_error)?;
        let keys: HashSet<(String, String, String)> = key_rows
            .iter()
            .map(|row| (row.get(0), row.get(1), row.get(2)))
            .collect();

        let rows = client
            .query(
                r#"
                SELECT c.table_schema, c.table_name, c.column_name, c.data_type, c.udt_name, c.is_nullable
                FROM information_schema.columns c
                JOIN information_schema.tables t
                  ON t.table_schema = c.table_schema AND t.table_name = c.table_name
                WHERE c.table_schema NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
                  AND t.table_type IN ('BASE TABLE', 'VIEW')
                ORDER BY c.table_schema, c.table_name, c.ordinal_position
                "#,
                &[],
            )
            .await
            .map_err(classify_pg_error)?;

        let mut tables: BTreeMap<String, Vec<FieldSpec>> = BTreeMap::new();
        for row in rows {
            let schema: String = row.get(0);
            let table: String = row.get(1);
            let column: String = row.get(2);
            let data_type: String = row.get(3);
            let udt_name: String = row.get(4);
            let nullable = row.get::<_, String>(5) == "YES";

            // USER-DEFINED covers extension types such as pgvector
            let physical = if data_type == "USER-DEFINED" { udt_name } else { data_type };
            let semantic_type = SemanticType::from_database_type(&physical);

            let is_key = keys.contains(&(schema.clone(), table.clone(), column.clone()));
            let mut field = if is_key {
                FieldSpec::key(column, semantic_type)
            } else {
                FieldSpec::new(column, semantic_type)
            };
            if !nullable {
                field = field.not_null();
            }

            let name = if schema == "public" { table } else { format!("{}.{}", schema, table) };
            tables.entry(name).or_default().push(field);
        }

        tracing::debug!(source_id, tables = tables.len(), "introspected postgres source");

        Ok(tables
            .into_iter()
            .map(|(table, fields)| FieldContract::new(source_id, table, fields))
            .collect())
    }

    async fn execute(
        &self,
        payload: &QueryPayload,
        timeout: Duration,
    ) -> Result<OperationOutput, ExecutionError> {
        let sql = match payload {
            QueryPayload::Sql(sql) => sql,
            QueryPayload::Json(_) => {
                return Err(ExecutionError::Fatal(
                    "PostgreSQL sources only accept SQL payloads".to_string(),
                ))
            }
        };
        PayloadValidator::validate_select_only(sql).map_err(ExecutionError::Fatal)?;
        let sql = PayloadValidator::ensure_limit(sql, self.row_limit).map_err(ExecutionError::Fatal)?;

        let client = self.client().await?;
        let start_time = Instant::now();

        let rows = tokio::time::timeout(timeout, client.query(sql.as_str(), &[]))
            .await
            .map_err(|_| ExecutionError::Retryable(format!("Query timeout after {:?}", timeout)))?
            .map_err(classify_pg_error)?;

        let json_rows: Vec<Value> = rows
            .iter()
            .map(|row| {
                let object: serde_json::Map<String, Value> = row
                    .columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, column)| (column.name().to_string(), cell_to_json(row, idx, column.type_())))
                    .collect();
                Value::Object(object)
            })
            .collect();

        Ok(OperationOutput::new(
            json_rows,
            start_time.elapsed().as_millis() as u64,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ConnectionPoolManager;

    #[test]
    fn test_sqlstate_classification() {
        assert!(is_retryable_sqlstate("08006"));
        assert!(is_retryable_sqlstate("40001"));
        assert!(is_retryable_sqlstate("40P01"));
        assert!(is_retryable_sqlstate("53300"));
        assert!(is_retryable_sqlstate("57P01"));
        assert!(!is_retryable_sqlstate("42P01"));
        assert!(!is_retryable_sqlstate("42501"));
        assert!(!is_retryable_sqlstate("22012"));
    }

    #[tokio::test]
    async fn test_rejects_non_postgres_urls() {
        let pools = ConnectionPoolManager::new();
        let pool = pools
            .get_or_create_pool("postgresql://localhost:5432/db")
            .await
            .unwrap();
        assert!(PostgresAdapter::new(pool.clone(), "mysql://localhost/db", 100).is_err());
        assert!(PostgresAdapter::new(pool, "postgres://localhost/db", 100).is_ok());
    }

    #[tokio::test]
    async fn test_json_payloads_are_fatal() {
        let pools = ConnectionPoolManager::new();
        let pool = pools
            .get_or_create_pool("postgresql://localhost:5432/db")
            .await
            .unwrap();
        let adapter = PostgresAdapter::new(pool, "postgres://localhost/db", 100).unwrap();
        let err = adapter
            .execute(&QueryPayload::Json(json!({"find": "users"})), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
