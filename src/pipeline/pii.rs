//! PII redaction step.
//!
//! The actual classification of "what counts as PII" is an external
//! collaborator upstream (a Presidio-backed NLP model); here it is a small
//! [`PiiAnalyzer`] trait with a regex-based default covering the
//! high-confidence patterns that are cheap and reliable without a model:
//! emails, IPv4 addresses, US-style phone numbers, and credit-card-shaped
//! digit runs.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::{json, Value};

use crate::error::CodegateError;
use crate::pipeline::{AlertSeverity, PipelineContext, Step, StepOutcome};
use crate::session::SessionStore;

const STEP_NAME: &str = "redacting_step";

#[derive(Debug, Clone)]
pub struct PiiMatch {
    pub start: usize,
    pub end: usize,
    pub kind: String,
    pub value: String,
}

pub trait PiiAnalyzer: Send + Sync {
    fn analyze(&self, text: &str) -> Vec<PiiMatch>;
}

/// Default analyzer: four independently-compiled patterns, checked in
/// declaration order, matches merged and sorted by position.
pub struct RegexPiiAnalyzer {
    patterns: Vec<(&'static str, Regex)>,
}

impl RegexPiiAnalyzer {
    pub fn new() -> Self {
        let patterns = vec![
            ("email", Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap()),
            ("ipv4_address", Regex::new(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b").unwrap()),
            (
                "phone_number",
                Regex::new(r"\b\(?[0-9]{3}\)?[-.\s][0-9]{3}[-.\s][0-9]{4}\b").unwrap(),
            ),
            (
                "credit_card",
                Regex::new(r"\b[0-9]{4}[- ]?[0-9]{4}[- ]?[0-9]{4}[- ]?[0-9]{4}\b").unwrap(),
            ),
        ];
        Self { patterns }
    }
}

impl Default for RegexPiiAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl PiiAnalyzer for RegexPiiAnalyzer {
    fn analyze(&self, text: &str) -> Vec<PiiMatch> {
        let mut matches = Vec::new();
        for (kind, pattern) in &self.patterns {
            for m in pattern.find_iter(text) {
                matches.push(PiiMatch {
                    start: m.start(),
                    end: m.end(),
                    kind: (*kind).to_string(),
                    value: m.as_str().to_string(),
                });
            }
        }
        matches.sort_by_key(|m| m.start);
        // Drop matches that overlap an earlier, already-accepted one
        // (e.g. a phone number embedded inside a longer digit run).
        let mut accepted: Vec<PiiMatch> = Vec::with_capacity(matches.len());
        for m in matches {
            if accepted.last().map(|prev| m.start < prev.end).unwrap_or(false) {
                continue;
            }
            accepted.push(m);
        }
        accepted
    }
}

pub struct RedactingStep {
    analyzer: Arc<dyn PiiAnalyzer>,
}

impl RedactingStep {
    pub fn new(analyzer: Arc<dyn PiiAnalyzer>) -> Self {
        Self { analyzer }
    }
}

impl Default for RedactingStep {
    fn default() -> Self {
        Self::new(Arc::new(RegexPiiAnalyzer::new()))
    }
}

#[async_trait::async_trait]
impl Step for RedactingStep {
    fn name(&self) -> &str {
        STEP_NAME
    }

    async fn process(
        &self,
        mut request: Value,
        mut context: PipelineContext,
        session_store: &SessionStore,
    ) -> Result<StepOutcome, CodegateError> {
        let mut counts: HashMap<String, usize> = HashMap::new();

        if let Some(messages) = request.get_mut("messages").and_then(Value::as_array_mut) {
            for message in messages.iter_mut() {
                redact_message_content(message, self.analyzer.as_ref(), session_store, &context.session_id, &mut counts);
            }
        }

        let total: usize = counts.values().sum();
        if total > 0 {
            let kinds = counts
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            context.push_alert(
                STEP_NAME,
                format!("redacted {total} PII value(s): {kinds}"),
                AlertSeverity::Info,
            );
            context
                .metadata
                .insert("redacted_pii_count".to_string(), json!(total));
            context
                .metadata
                .insert("redacted_pii_details".to_string(), json!(counts));
            context
                .metadata
                .insert("redacted_text".to_string(), json!(true));
            context
                .metadata
                .insert("session_id".to_string(), json!(context.session_id.clone()));
            context
                .metadata
                .insert("sensitive_data_manager".to_string(), json!("session-store"));

            if let Some(messages) = request.get_mut("messages").and_then(Value::as_array_mut) {
                messages.insert(
                    0,
                    json!({
                        "role": "system",
                        "content": "Some values in this conversation were replaced with placeholders by a security proxy. Treat any token shaped like #uuid# as an opaque identifier, not literal text.",
                    }),
                );
            }
        }

        Ok(StepOutcome::continue_with(request, context))
    }
}

fn redact_message_content(
    message: &mut Value,
    analyzer: &dyn PiiAnalyzer,
    session_store: &SessionStore,
    session_id: &str,
    counts: &mut HashMap<String, usize>,
) {
    let Some(content) = message.get_mut("content") else {
        return;
    };

    match content {
        Value::String(text) => {
            *text = redact_text(text, analyzer, session_store, session_id, counts);
        }
        Value::Array(parts) => {
            for part in parts.iter_mut() {
                if let Some(Value::String(text)) = part.get_mut("text") {
                    *text = redact_text(text, analyzer, session_store, session_id, counts);
                }
            }
        }
        _ => {}
    }
}

fn redact_text(
    text: &str,
    analyzer: &dyn PiiAnalyzer,
    session_store: &SessionStore,
    session_id: &str,
    counts: &mut HashMap<String, usize>,
) -> String {
    let matches = analyzer.analyze(text);
    if matches.is_empty() {
        return text.to_string();
    }

    let mut rewritten = String::with_capacity(text.len());
    let mut cursor = 0;
    for m in matches {
        rewritten.push_str(&text[cursor..m.start]);
        let placeholder = session_store.store(
            session_id,
            m.value.clone(),
            "pii".to_string(),
            m.kind.clone(),
        );
        rewritten.push_str(&placeholder);
        *counts.entry(m.kind).or_insert(0) += 1;
        cursor = m.end;
    }
    rewritten.push_str(&text[cursor..]);
    rewritten
}
