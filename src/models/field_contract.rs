use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Semantic type of a field, independent of any engine's physical type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Vector,
}

impl SemanticType {
    pub const ALL: [SemanticType; 6] = [
        SemanticType::Text,
        SemanticType::Integer,
        SemanticType::Float,
        SemanticType::Boolean,
        SemanticType::Timestamp,
        SemanticType::Vector,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticType::Text => "text",
            SemanticType::Integer => "integer",
            SemanticType::Float => "float",
            SemanticType::Boolean => "boolean",
            SemanticType::Timestamp => "timestamp",
            SemanticType::Vector => "vector",
        }
    }

    /// Map an engine's physical type name onto a semantic type.
    ///
    /// Unknown physical types fall back to `Text`.
    pub fn from_database_type(data_type: &str) -> Self {
        let lowered = data_type.to_lowercase();
        let base = lowered.split('(').next().unwrap_or("").trim();
        match base {
            "smallint" | "integer" | "int" | "int2" | "int4" | "int8" | "bigint" | "serial"
            | "bigserial" | "long" | "int32" | "int64" => SemanticType::Integer,
            "real" | "float" | "float4" | "float8" | "double" | "double precision" | "numeric"
            | "decimal" => SemanticType::Float,
            "bool" | "boolean" => SemanticType::Boolean,
            "timestamp" | "timestamptz" | "timestamp with time zone"
            | "timestamp without time zone" | "date" | "datetime" => SemanticType::Timestamp,
            "vector" | "embedding" | "float[]" | "real[]" => SemanticType::Vector,
            _ => SemanticType::Text,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, SemanticType::Integer | SemanticType::Float)
    }
}

impl std::fmt::Display for SemanticType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FieldRole {
    Key,
    Value,
    Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FieldSpec {
    pub name: String,
    pub semantic_type: SemanticType,
    pub nullable: bool,
    pub role: FieldRole,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        let role = if semantic_type == SemanticType::Timestamp {
            FieldRole::Timestamp
        } else {
            FieldRole::Value
        };
        Self {
            name: name.into(),
            semantic_type,
            nullable: true,
            role,
        }
    }

    pub fn key(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            nullable: false,
            role: FieldRole::Key,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Identity of a contract version as recorded by a plan at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ContractVersion {
    pub source_id: String,
    pub table: String,
    pub version: u64,
    pub content_hash: String,
}

/// Versioned field contract for one (source, table) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldContract {
    pub source_id: String,
    pub table: String,
    pub fields: Vec<FieldSpec>,
    pub version: u64,
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
}

impl FieldContract {
    pub fn new(source_id: impl Into<String>, table: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        let content_hash = Self::compute_hash(&fields);
        Self {
            source_id: source_id.into(),
            table: table.into(),
            fields,
            version: 1,
            content_hash,
            updated_at: Utc::now(),
        }
    }

    /// Hash over the ordered field list; field order is part of the contract.
    pub fn compute_hash(fields: &[FieldSpec]) -> String {
        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update(field.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(field.semantic_type.as_str().as_bytes());
            hasher.update([field.nullable as u8]);
            hasher.update(format!("{:?}", field.role).as_bytes());
            hasher.update([0xffu8]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Successor contract carrying `fields`, or `None` when the content is unchanged.
    pub fn next_version(&self, fields: Vec<FieldSpec>) -> Option<FieldContract> {
        let content_hash = Self::compute_hash(&fields);
        if content_hash == self.content_hash {
            return None;
        }
        Some(FieldContract {
            source_id: self.source_id.clone(),
            table: self.table.clone(),
            fields,
            version: self.version + 1,
            content_hash,
            updated_at: Utc::now(),
        })
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn key_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.role == FieldRole::Key)
    }

    pub fn version_stamp(&self) -> ContractVersion {
        ContractVersion {
            source_id: self.source_id.clone(),
            table: self.table.clone(),
            version: self.version,
            content_hash: self.content_hash.clone(),
        }
    }
}
