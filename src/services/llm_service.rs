use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::json;

use crate::config::Config;
use crate::models::{QueryPayload, SourceKind};
use crate::services::generation::{CombineHint, GenerationError, OperationDraft, QueryGenerator, SchemaContext};

/// Query generator backed by an HTTP LLM gateway.
pub struct LlmQueryGenerator {
    gateway_url: String,
    api_key: Option<String>,
    http_client: HttpClient,
}

/// Shape the gateway is asked to answer with.
#[derive(Debug, Deserialize)]
struct DraftResponse {
    table: String,
    #[serde(default)]
    fields: Vec<String>,
    payload: serde_json::Value,
    #[serde(default)]
    combine: Option<CombineHint>,
}

impl LlmQueryGenerator {
    pub fn new(config: &Config) -> Self {
        Self::with_gateway(config.llm.gateway_url.clone(), config.llm.api_key.clone())
    }

    pub fn with_gateway(gateway_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            api_key,
            http_client: HttpClient::new(),
        }
    }

    fn payload_hints(kind: SourceKind) -> &'static str {
        match kind {
            SourceKind::Relational => {
                r#"- "payload" is a single PostgreSQL SELECT statement as a string
- Use LIMIT rather than TOP or FETCH FIRST
- Only reference tables and columns listed in the schema"#
            }
            SourceKind::Document => {
                r#"- "payload" is a JSON object: {"collection": ..., "filter": {...}, "projection": [...]}"#
            }
            SourceKind::Vector => {
                r#"- "payload" is a JSON object: {"collection": ..., "query_text": ..., "top_k": N}"#
            }
            SourceKind::MessageLog => {
                r#"- "payload" is a JSON object: {"topic": ..., "from": RFC3339, "to": RFC3339, "filter": {...}}"#
            }
        }
    }

    pub fn build_prompt(question: &str, context: &SchemaContext, kind: SourceKind) -> String {
        let mut prompt = format!(
            r#"You are a query planner. Given the schema of one {kind} data source and a question, produce the query this source must run to contribute to the answer.

{summary}
Question: {question}

Answer with ONLY a JSON object, no markdown:
{{"table": "<table or collection>", "fields": ["<field>", ...], "payload": <query>, "combine": null | {{"type": "join", "left_key": "<field from earlier results>", "right_key": "<field of this table>", "mode": "inner" | "left_outer"}} | {{"type": "union"}}}}
{hints}
- "fields" lists exactly the fields the payload returns
"#,
            kind = kind,
            summary = context.summary,
            question = question,
            hints = Self::payload_hints(kind),
        );

        if !context.feedback.is_empty() {
            prompt.push_str("\nA previous answer was rejected:\n");
            for line in &context.feedback {
                prompt.push_str(&format!("- {}\n", line));
            }
            prompt.push_str("Correct these problems.\n");
        }
        prompt
    }

    /// Parse the gateway's text answer into a draft.
    pub fn parse_draft(text: &str, kind: SourceKind) -> Result<OperationDraft, GenerationError> {
        let cleaned = text
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();

        let response: DraftResponse = serde_json::from_str(cleaned)
            .map_err(|e| GenerationError(format!("Failed to parse generated draft: {}", e)))?;

        let payload = match (kind, response.payload) {
            (SourceKind::Relational, serde_json::Value::String(sql)) => QueryPayload::Sql(sql),
            (SourceKind::Relational, other) => {
                return Err(GenerationError(format!(
                    "relational payload must be a SQL string, got {}",
                    other
                )))
            }
            (_, serde_json::Value::String(raw)) => {
                let value = serde_json::from_str(&raw)
                    .map_err(|e| GenerationError(format!("payload is not JSON: {}", e)))?;
                QueryPayload::Json(value)
            }
            (_, value) => QueryPayload::Json(value),
        };

        Ok(OperationDraft {
            table: response.table,
            fields: response.fields,
            payload,
            combine: response.combine,
        })
    }

    async fn call_llm_api(&self, prompt: &str) -> Result<String, GenerationError> {
        let mut request = self.http_client.post(&self.gateway_url).json(&json!({
            "prompt": prompt,
            "max_tokens": 800,
            "temperature": 0.1,
        }));

        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| GenerationError(format!("Failed to call LLM service: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GenerationError(format!(
                "LLM service returned error {}: {}",
                status, error_text
            )));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GenerationError(format!("Failed to parse LLM response: {}", e)))?;

        result["text"]
            .as_str()
            .or_else(|| result["content"].as_str())
            .or_else(|| result["response"].as_str())
            .map(str::to_string)
            .ok_or_else(|| GenerationError("LLM response does not contain a draft".to_string()))
    }

    /// Draft used when no gateway is configured: the first table named in the
    /// question (or the first table at all), every field, no combine hint.
    pub fn fallback_draft(question: &str, context: &SchemaContext, kind: SourceKind) -> Result<OperationDraft, GenerationError> {
        let lowered = question.to_lowercase();
        let contract = context
            .contracts
            .iter()
            .find(|c| lowered.contains(&c.table.to_lowercase()))
            .or_else(|| context.contracts.first())
            .ok_or_else(|| GenerationError(format!("source '{}' has no tables", context.source.id)))?;

        let fields: Vec<String> = contract.fields.iter().map(|f| f.name.clone()).collect();
        let payload = match kind {
            SourceKind::Relational => {
                let projection = if fields.is_empty() { "*".to_string() } else { fields.join(", ") };
                QueryPayload::Sql(format!("SELECT {} FROM {}", projection, contract.table))
            }
            SourceKind::Document | SourceKind::Vector => {
                QueryPayload::Json(json!({"collection": contract.table, "projection": fields}))
            }
            SourceKind::MessageLog => QueryPayload::Json(json!({"topic": contract.table})),
        };

        tracing::warn!(
            source_id = %context.source.id,
            table = %contract.table,
            "using fallback query generation; configure llm.gateway_url for better results"
        );

        Ok(OperationDraft {
            table: contract.table.clone(),
            fields,
            payload,
            combine: None,
        })
    }
}

#[async_trait::async_trait]
impl QueryGenerator for LlmQueryGenerator {
    async fn generate(
        &self,
        question: &str,
        context: &SchemaContext,
        kind: SourceKind,
    ) -> Result<OperationDraft, GenerationError> {
        if self.gateway_url.trim().is_empty() {
            return Self::fallback_draft(question, context, kind);
        }
        let prompt = Self::build_prompt(question, context, kind);
        let text = self.call_llm_api(&prompt).await?;
        Self::parse_draft(&text, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldContract, FieldSpec, JoinMode, SemanticType, SourceDescriptor};
    use std::sync::Arc;

    fn context() -> SchemaContext {
        let source = SourceDescriptor::new("billing", SourceKind::Relational, "pg");
        let contract = FieldContract::new(
            "billing",
            "orders",
            vec![
                FieldSpec::key("id", SemanticType::Integer),
                FieldSpec::new("amt", SemanticType::Float),
            ],
        );
        SchemaContext::build(source, vec![Arc::new(contract)], 2000)
    }

    #[test]
    fn test_parse_sql_draft_with_fences() {
        let text = r#"```json
{"table": "orders", "fields": ["id", "amt"], "payload": "SELECT id, amt FROM orders",
 "combine": {"type": "join", "left_key": "id", "right_key": "id"}}
```"#;
        let draft = LlmQueryGenerator::parse_draft(text, SourceKind::Relational).unwrap();
        assert_eq!(draft.table, "orders");
        assert_eq!(draft.payload, QueryPayload::Sql("SELECT id, amt FROM orders".into()));
        assert_eq!(
            draft.combine,
            Some(CombineHint::Join {
                left_key: "id".into(),
                right_key: "id".into(),
                mode: JoinMode::Inner,
            })
        );
    }

    #[test]
    fn test_parse_document_draft() {
        let text = r#"{"table": "events", "payload": {"collection": "events"}, "combine": {"type": "union"}}"#;
        let draft = LlmQueryGenerator::parse_draft(text, SourceKind::Document).unwrap();
        assert!(matches!(draft.payload, QueryPayload::Json(_)));
        assert_eq!(draft.combine, Some(CombineHint::Union));
        assert!(draft.fields.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_sql_relational_payload() {
        let text = r#"{"table": "orders", "payload": {"find": "orders"}}"#;
        assert!(LlmQueryGenerator::parse_draft(text, SourceKind::Relational).is_err());
        assert!(LlmQueryGenerator::parse_draft("SELECT 1", SourceKind::Relational).is_err());
    }

    #[test]
    fn test_prompt_carries_feedback() {
        let ctx = context().with_feedback(vec!["field 'amount' does not exist".into()]);
        let prompt = LlmQueryGenerator::build_prompt("total spend", &ctx, SourceKind::Relational);
        assert!(prompt.contains("Question: total spend"));
        assert!(prompt.contains("* amt (float)"));
        assert!(prompt.contains("field 'amount' does not exist"));
    }

    #[tokio::test]
    async fn test_fallback_without_gateway() {
        let generator = LlmQueryGenerator::with_gateway("", None);
        let draft = generator
            .generate("list orders", &context(), SourceKind::Relational)
            .await
            .unwrap();
        assert_eq!(draft.payload, QueryPayload::Sql("SELECT id, amt FROM orders".into()));
        assert_eq!(draft.fields, vec!["id", "amt"]);
    }
}
