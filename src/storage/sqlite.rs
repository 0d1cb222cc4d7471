use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Result as SqliteResult, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{FieldContract, FieldSpec, SourceDescriptor, SourceKind};

/// SQLite persistence for the schema registry.
/// Uses tokio::Mutex for async-friendly locking
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

fn parse_timestamp(idx: usize, value: String) -> SqliteResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn source_from_row(row: &Row<'_>) -> SqliteResult<SourceDescriptor> {
    let kind: String = row.get(2)?;
    let kind = SourceKind::from_str(&kind).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into())
    })?;
    Ok(SourceDescriptor {
        id: row.get(0)?,
        connection_ref: row.get(1)?,
        kind,
        priority: row.get(3)?,
        enabled: row.get(4)?,
        description: row.get(5)?,
        created_at: parse_timestamp(6, row.get(6)?)?,
        updated_at: parse_timestamp(7, row.get(7)?)?,
    })
}

fn contract_from_row(row: &Row<'_>) -> SqliteResult<FieldContract> {
    let fields_json: String = row.get(4)?;
    let fields: Vec<FieldSpec> = serde_json::from_str(&fields_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    let version: i64 = row.get(2)?;
    Ok(FieldContract {
        source_id: row.get(0)?,
        table: row.get(1)?,
        fields,
        version: version as u64,
        content_hash: row.get(3)?,
        updated_at: parse_timestamp(5, row.get(5)?)?,
    })
}

impl SqliteStorage {
    /// Open (or create) the registry database. Accepts `sqlite:` URL prefixes.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        let path_str = db_path.as_ref().to_string_lossy();
        let clean_path: &str = if path_str.starts_with("sqlite:") {
            path_str.trim_start_matches("sqlite:").trim_start_matches("//")
        } else {
            path_str.as_ref()
        };

        let conn = Connection::open(clean_path)?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// In-memory database, mostly for tests.
    pub async fn in_memory() -> SqliteResult<Self> {
        let storage = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> SqliteResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id TEXT PRIMARY KEY,
                connection_ref TEXT NOT NULL,
                kind TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                description TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        // Every version is kept; the highest version per (source, table) is current.
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS field_contracts (
                source_id TEXT NOT NULL,
                table_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                fields_json TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (source_id, table_name, version),
                FOREIGN KEY (source_id) REFERENCES sources(id) ON DELETE CASCADE
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_field_contracts_source ON field_contracts(source_id, table_name, version DESC)",
            [],
        )?;

        Ok(())
    }

    /// Insert or replace a source descriptor
    pub async fn save_source(&self, source: &SourceDescriptor) -> SqliteResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO sources (id, connection_ref, kind, priority, enabled, description, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                connection_ref = excluded.connection_ref,
                kind = excluded.kind,
                priority = excluded.priority,
                enabled = excluded.enabled,
                description = excluded.description,
                updated_at = excluded.updated_at
            "#,
            rusqlite::params![
                source.id,
                source.connection_ref,
                source.kind.as_str(),
                source.priority,
                source.enabled,
                source.description,
                source.created_at.to_rfc3339(),
                source.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_source(&self, id: &str) -> SqliteResult<Option<SourceDescriptor>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, connection_ref, kind, priority, enabled, description, created_at, updated_at FROM sources WHERE id = ?1",
        )?;
        match stmt.query_row(rusqlite::params![id], source_from_row) {
            Ok(source) => Ok(Some(source)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list_sources(&self) -> SqliteResult<Vec<SourceDescriptor>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, connection_ref, kind, priority, enabled, description, created_at, updated_at FROM sources ORDER BY priority DESC, id ASC",
        )?;
        let rows = stmt.query_map([], source_from_row)?;
        rows.collect()
    }

    /// Delete a source and, by cascade, its contracts
    pub async fn delete_source(&self, id: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock().await;
        let rows_affected = conn.execute("DELETE FROM sources WHERE id = ?1", rusqlite::params![id])?;
        Ok(rows_affected > 0)
    }

    /// Append a contract version. Re-saving an existing version overwrites it.
    pub async fn save_contract(&self, contract: &FieldContract) -> SqliteResult<()> {
        let fields_json = serde_json::to_string(&contract.fields)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO field_contracts
            (source_id, table_name, version, content_hash, fields_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            rusqlite::params![
                contract.source_id,
                contract.table,
                contract.version as i64,
                contract.content_hash,
                fields_json,
                contract.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Current (highest-version) contract of every (source, table) pair.
    pub async fn load_current_contracts(&self) -> SqliteResult<Vec<FieldContract>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT c.source_id, c.table_name, c.version, c.content_hash, c.fields_json, c.updated_at
            FROM field_contracts c
            WHERE c.version = (
                SELECT MAX(version) FROM field_contracts m
                WHERE m.source_id = c.source_id AND m.table_name = c.table_name
            )
            ORDER BY c.source_id, c.table_name
            "#,
        )?;
        let rows = stmt.query_map([], contract_from_row)?;
        rows.collect()
    }

    /// All recorded versions of one contract, oldest first.
    pub async fn contract_history(&self, source_id: &str, table: &str) -> SqliteResult<Vec<FieldContract>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT source_id, table_name, version, content_hash, fields_json, updated_at
            FROM field_contracts
            WHERE source_id = ?1 AND table_name = ?2
            ORDER BY version ASC
            "#,
        )?;
        let rows = stmt.query_map(rusqlite::params![source_id, table], contract_from_row)?;
        rows.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SemanticType;
    use tempfile::tempdir;

    fn orders_contract() -> FieldContract {
        FieldContract::new(
            "billing",
            "orders",
            vec![
                FieldSpec::key("id", SemanticType::Integer),
                FieldSpec::new("amt", SemanticType::Float),
            ],
        )
    }

    #[test]
    fn test_sqlite_storage_creation_with_url_prefix() {
        let dir = tempdir().unwrap();
        let db_path = format!("sqlite:{}", dir.path().join("registry.db").display());
        let rt = tokio::runtime::Runtime::new().unwrap();
        let storage = rt.block_on(async { SqliteStorage::new(&db_path).await });
        assert!(storage.is_ok());
        assert!(dir.path().join("registry.db").exists());
    }

    #[tokio::test]
    async fn test_source_round_trip() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let source = SourceDescriptor::new("billing", SourceKind::Relational, "postgres://billing")
            .with_priority(3)
            .with_description("invoices and orders");
        storage.save_source(&source).await.unwrap();

        let loaded = storage.get_source("billing").await.unwrap().unwrap();
        assert_eq!(loaded.kind, SourceKind::Relational);
        assert_eq!(loaded.priority, 3);
        assert_eq!(loaded.description.as_deref(), Some("invoices and orders"));
        assert!(storage.get_source("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sources_listed_by_priority() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage
            .save_source(&SourceDescriptor::new("a", SourceKind::Document, "mongo://a"))
            .await
            .unwrap();
        storage
            .save_source(&SourceDescriptor::new("b", SourceKind::Vector, "qdrant://b").with_priority(9))
            .await
            .unwrap();

        let ids: Vec<String> = storage.list_sources().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_current_contract_is_highest_version() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage
            .save_source(&SourceDescriptor::new("billing", SourceKind::Relational, "pg"))
            .await
            .unwrap();

        let v1 = orders_contract();
        let mut fields = v1.fields.clone();
        fields.push(FieldSpec::new("currency", SemanticType::Text));
        let v2 = v1.next_version(fields).unwrap();

        storage.save_contract(&v1).await.unwrap();
        storage.save_contract(&v2).await.unwrap();

        let current = storage.load_current_contracts().await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].version, 2);
        assert!(current[0].has_field("currency"));

        let history = storage.contract_history("billing", "orders").await.unwrap();
        assert_eq!(history.iter().map(|c| c.version).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_deleting_source_cascades_contracts() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage
            .save_source(&SourceDescriptor::new("billing", SourceKind::Relational, "pg"))
            .await
            .unwrap();
        storage.save_contract(&orders_contract()).await.unwrap();

        assert!(storage.delete_source("billing").await.unwrap());
        assert!(storage.load_current_contracts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_contract_for_unknown_source_is_rejected() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        assert!(storage.save_contract(&orders_contract()).await.is_err());
    }
}
