//! Natural-language to SQL translation through a chat-completions model.
//!
//! The assistant only calls the translator on a cache miss, once per request.
//! Whatever comes back is cleaned here and still has to pass the access
//! validator before it runs.

use crate::error::{CacheError, Result};
use crate::security::AuthorizedIds;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, error, info};

lazy_static! {
    static ref FENCE_RE: Regex = Regex::new(r"(?i)```(?:sql)?").unwrap();
    static ref COMMENT_LINE_RE: Regex = Regex::new(r"(?m)^\s*(?:--|#).*$").unwrap();
}

/// Everything the model needs to write one query.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationRequest {
    pub question: String,
    /// Table and relation description of the target database.
    pub schema_context: String,
    /// Children the query must be restricted to; `None` for administrators.
    pub restrict_to: Option<AuthorizedIds>,
}

impl TranslationRequest {
    pub fn unrestricted(question: impl Into<String>, schema_context: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            schema_context: schema_context.into(),
            restrict_to: None,
        }
    }

    pub fn restricted(
        question: impl Into<String>,
        schema_context: impl Into<String>,
        ids: AuthorizedIds,
    ) -> Self {
        Self {
            question: question.into(),
            schema_context: schema_context.into(),
            restrict_to: Some(ids),
        }
    }

    /// Prompt sent as the user message.
    pub fn prompt(&self) -> String {
        let restriction = match &self.restrict_to {
            None => String::new(),
            Some(ids) if ids.len() == 1 => format!(
                r#"
ACCESS RESTRICTION:
- You may only read data of the student with IdPersonne {ids}.
- Every query MUST filter on it, e.g. `WHERE e.IdPersonne = {ids}` or
  `WHERE ie.Eleve = (SELECT id FROM eleve WHERE IdPersonne = {ids})`.
- Use `=` for a single student, never `IN` with one element.
"#,
                ids = ids.joined()
            ),
            Some(ids) => format!(
                r#"
ACCESS RESTRICTION:
- You may only read data of the students with IdPersonne in ({ids}).
- Every query MUST filter on them, e.g. `WHERE e.IdPersonne IN ({ids})` or
  `WHERE ie.Eleve IN (SELECT id FROM eleve WHERE IdPersonne IN ({ids}))`.
"#,
                ids = ids.joined()
            ),
        };

        format!(
            r#"You are an expert MySQL assistant for a school database.
Write ONE read-only SELECT statement answering the question below.

Relations:
- eleve.IdPersonne = personne.id
- inscriptioneleve.Classe = classe.id
- classe.IDNIV = niveau.id
- inscriptioneleve.AnneeScolaire = anneescolaire.id

Schema:
{schema}
{restriction}
Rules:
- No comments, no semicolons, no data modification.
- Use COUNT(*) with a descriptive alias for "combien", "nombre", "total".

Question: "{question}"

Return only the SQL, no other text."#,
            schema = self.schema_context,
            restriction = restriction,
            question = self.question
        )
    }
}

/// The external question-to-SQL collaborator.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Raw model output for `request`. Callers clean it with [`clean_sql`].
    async fn translate(&self, request: &TranslationRequest) -> Result<String>;
}

pub struct OpenAiTranslator {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiTranslator {
    pub fn new(api_key: String) -> Self {
        Self::with_endpoint(api_key, "https://api.openai.com/v1".to_string(), "gpt-4o".to_string())
    }

    pub fn with_endpoint(api_key: String, base_url: String, model: String) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client: reqwest::Client::new(),
        }
    }

    async fn call_llm(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You translate questions into MySQL SELECT statements. Return only SQL."},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.1,
            "max_tokens": 2048
        });

        let response = self
            .client
            .post(&format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CacheError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CacheError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if !status.is_success() {
            let message = response_json["error"]["message"]
                .as_str()
                .unwrap_or("unknown error");
            error!("LLM API returned {}: {}", status, message);
            return Err(CacheError::Llm(format!("LLM API returned {}: {}", status, message)));
        }

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| CacheError::Llm("No content in LLM response".to_string()))?;

        if content.trim().is_empty() {
            return Err(CacheError::Llm("Empty LLM response".to_string()));
        }
        Ok(content.to_string())
    }
}

#[async_trait]
impl Translator for OpenAiTranslator {
    async fn translate(&self, request: &TranslationRequest) -> Result<String> {
        info!("Translating question with {}: {}", self.model, request.question);
        let raw = self.call_llm(&request.prompt()).await?;
        debug!("LLM returned: {}", raw);
        Ok(raw)
    }
}

/// Strip markdown fences, full-line comments and the trailing `;`.
pub fn clean_sql(raw: &str) -> String {
    let without_fences = FENCE_RE.replace_all(raw, "");
    let without_comments = COMMENT_LINE_RE.replace_all(&without_fences, "");
    let lines: Vec<&str> = without_comments
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect();
    lines
        .join("\n")
        .trim()
        .trim_end_matches(';')
        .trim_end()
        .to_string()
}
