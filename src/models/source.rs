use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Family of backing store a source belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Relational,
    Document,
    Vector,
    MessageLog,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Relational => "relational",
            SourceKind::Document => "document",
            SourceKind::Vector => "vector",
            SourceKind::MessageLog => "message_log",
        }
    }

    /// Parse a source kind, accepting common engine names as aliases.
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "relational" | "postgresql" | "postgres" | "mysql" | "sql" => Ok(SourceKind::Relational),
            "document" | "mongodb" | "mongo" => Ok(SourceKind::Document),
            "vector" | "qdrant" | "pgvector" => Ok(SourceKind::Vector),
            "message_log" | "log" | "kafka" => Ok(SourceKind::MessageLog),
            _ => Err(format!("Unsupported source kind: {}", s)),
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDescriptor {
    pub id: String,
    /// Opaque reference handed to the adapter; never interpreted by the core.
    pub connection_ref: String,
    pub kind: SourceKind,
    pub priority: i32,
    pub enabled: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourceDescriptor {
    pub fn new(id: impl Into<String>, kind: SourceKind, connection_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            connection_ref: connection_ref.into(),
            kind,
            priority: 0,
            enabled: true,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
