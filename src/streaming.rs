//! Streaming response rewriter.
//!
//! Upstream SSE chunks arrive as arbitrary byte slices that can split a
//! record, a placeholder token, or even a UUID's hex digits at any byte
//! boundary. [`SseFramer`] buffers until a full `\n\n`-terminated record
//! is available; [`StreamRewriter`] then threads the parsed JSON through
//! an ordered list of [`OutputStep`]s, each of which may swallow, pass
//! through, or inject chunks before re-framing them back onto the wire.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::pipeline::PipelineContext;
use crate::session::SessionStore;

const THINKING_WRAP_SIGNATURE: &str = "Cline";

/// Per-stream state carried across chunks by the output steps that need
/// it (currently just the unredaction step's placeholder-straddling
/// buffer and the notifier's one-shot flag).
pub struct OutputContext {
    pub prefix_buffer: String,
    pub notified: bool,
}

impl OutputContext {
    pub fn new() -> Self {
        Self {
            prefix_buffer: String::new(),
            notified: false,
        }
    }
}

impl Default for OutputContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
pub trait OutputStep: Send + Sync {
    fn name(&self) -> &str;

    /// Zero or more chunks to emit in place of `chunk` (zero swallows it,
    /// two or more injects additional chunks alongside it).
    async fn process(
        &self,
        chunk: Value,
        output_context: &mut OutputContext,
        input_context: &PipelineContext,
        session_store: &SessionStore,
    ) -> Vec<Value>;
}

/// Buffers raw bytes and yields complete `\n\n`-terminated SSE records.
pub struct SseFramer {
    buffer: Vec<u8>,
}

impl SseFramer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feeds in newly-arrived bytes and drains every complete record.
    /// Any trailing partial record stays buffered for the next call.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut records = Vec::new();
        while let Some(pos) = find_double_newline(&self.buffer) {
            let record: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            records.push(String::from_utf8_lossy(&record).into_owned());
        }
        records
    }
}

impl Default for SseFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Strips the `data: ` prefix from a raw SSE record, if present.
fn sse_payload(record: &str) -> Option<&str> {
    record.trim_end().strip_prefix("data:").map(|rest| rest.trim_start())
}

pub struct StreamRewriter {
    output_steps: Vec<Arc<dyn OutputStep>>,
    framer: SseFramer,
    output_context: OutputContext,
}

impl StreamRewriter {
    pub fn new(output_steps: Vec<Arc<dyn OutputStep>>) -> Self {
        Self {
            output_steps,
            framer: SseFramer::new(),
            output_context: OutputContext::new(),
        }
    }

    /// Runs every buffered complete record through the output-step chain
    /// and returns the bytes ready to write back to the client.
    pub async fn process_upstream_chunk(
        &mut self,
        bytes: &[u8],
        input_context: &PipelineContext,
        session_store: &SessionStore,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        for record in self.framer.push(bytes) {
            let Some(payload) = sse_payload(&record) else {
                out.extend_from_slice(record.as_bytes());
                continue;
            };
            if payload.trim() == "[DONE]" {
                out.extend_from_slice(b"data: [DONE]\n\n");
                continue;
            }
            let Ok(parsed) = serde_json::from_str::<Value>(payload) else {
                out.extend_from_slice(record.as_bytes());
                continue;
            };

            for chunk in self.run_output_steps(parsed, input_context, session_store).await {
                out.extend_from_slice(b"data: ");
                out.extend_from_slice(serde_json::to_string(&chunk).unwrap_or_default().as_bytes());
                out.extend_from_slice(b"\n\n");
            }
        }
        out
    }

    /// Processes a non-streamed single JSON body as one record.
    pub async fn process_single_body(
        &mut self,
        body: Value,
        input_context: &PipelineContext,
        session_store: &SessionStore,
    ) -> Value {
        let mut chunks = self.run_output_steps(body, input_context, session_store).await;
        chunks.pop().unwrap_or(Value::Null)
    }

    async fn run_output_steps(
        &mut self,
        chunk: Value,
        input_context: &PipelineContext,
        session_store: &SessionStore,
    ) -> Vec<Value> {
        let mut chunks = vec![chunk];
        for step in &self.output_steps {
            let mut next = Vec::with_capacity(chunks.len());
            for c in chunks {
                let emitted = step
                    .process(c, &mut self.output_context, input_context, session_store)
                    .await;
                next.extend(emitted);
            }
            chunks = next;
        }
        chunks
    }
}

/// Returns true if `buffer` consists only of characters that could still
/// extend into a well-formed UUID (hex digits, with hyphens only at the
/// UUID's four hyphen positions) and is not yet longer than one.
fn can_be_uuid(buffer: &str) -> bool {
    if buffer.chars().count() > 36 {
        return false;
    }
    buffer.chars().enumerate().all(|(i, c)| {
        if c == '-' {
            matches!(i, 8 | 13 | 18 | 23)
        } else {
            c.is_ascii_hexdigit()
        }
    })
}

fn is_complete_uuid(buffer: &str) -> bool {
    if buffer.chars().count() != 36 {
        return false;
    }
    buffer.chars().enumerate().all(|(i, c)| match i {
        8 | 13 | 18 | 23 => c == '-',
        _ => c.is_ascii_hexdigit(),
    })
}

/// Scans `prefix_buffer + new_text` for `#uuid#` placeholders, substitutes
/// the original value for each well-formed one, and leaves any trailing
/// partial placeholder in `prefix_buffer` for the next chunk.
pub fn unredact_text(
    prefix_buffer: &mut String,
    new_text: &str,
    session_store: &SessionStore,
    session_id: &str,
) -> String {
    let content: Vec<char> = std::mem::take(prefix_buffer).chars().chain(new_text.chars()).collect();
    let mut output = String::with_capacity(content.len());
    let mut i = 0;

    while i < content.len() {
        if content[i] != '#' {
            output.push(content[i]);
            i += 1;
            continue;
        }

        match content[i + 1..].iter().position(|&c| c == '#') {
            Some(rel_close) => {
                let close = i + 1 + rel_close;
                let inner: String = content[i + 1..close].iter().collect();
                if is_complete_uuid(&inner) {
                    let placeholder = format!("#{inner}#");
                    match session_store.get_original(session_id, &placeholder) {
                        Some(original) => output.push_str(&original),
                        None => output.push_str(&placeholder),
                    }
                } else {
                    output.push('#');
                    output.push_str(&inner);
                    output.push('#');
                }
                i = close + 1;
            }
            None => {
                let remainder: String = content[i + 1..].iter().collect();
                if can_be_uuid(&remainder) {
                    prefix_buffer.push('#');
                    prefix_buffer.push_str(&remainder);
                } else {
                    output.push('#');
                    output.push_str(&remainder);
                }
                i = content.len();
            }
        }
    }

    output
}

/// Restores placeholder tokens in streamed `delta.content` text.
pub struct PiiUnredactionStep;

#[async_trait::async_trait]
impl OutputStep for PiiUnredactionStep {
    fn name(&self) -> &str {
        "pii_unredaction_step"
    }

    async fn process(
        &self,
        mut chunk: Value,
        output_context: &mut OutputContext,
        input_context: &PipelineContext,
        session_store: &SessionStore,
    ) -> Vec<Value> {
        if let Some(choices) = chunk.get_mut("choices").and_then(Value::as_array_mut) {
            for choice in choices.iter_mut() {
                if let Some(Value::String(text)) = choice.pointer_mut("/delta/content") {
                    let rewritten = unredact_text(
                        &mut output_context.prefix_buffer,
                        text,
                        session_store,
                        &input_context.session_id,
                    );
                    *text = rewritten;
                }
            }
        }
        vec![chunk]
    }
}

/// Prepends a synthetic notice chunk summarizing redactions, once, on the
/// first chunk carrying a role header.
pub struct RedactionNotifierStep;

#[async_trait::async_trait]
impl OutputStep for RedactionNotifierStep {
    fn name(&self) -> &str {
        "redaction_notifier_step"
    }

    async fn process(
        &self,
        chunk: Value,
        output_context: &mut OutputContext,
        input_context: &PipelineContext,
        _session_store: &SessionStore,
    ) -> Vec<Value> {
        if output_context.notified {
            return vec![chunk];
        }

        let count = input_context
            .metadata
            .get("redacted_pii_count")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if count == 0 {
            return vec![chunk];
        }

        let carries_role = chunk.pointer("/choices/0/delta/role").is_some();
        if !carries_role {
            return vec![chunk];
        }

        let kinds = input_context
            .metadata
            .get("redacted_pii_details")
            .and_then(Value::as_object)
            .map(|details| {
                let mut entries: Vec<(&String, u64)> = details
                    .iter()
                    .map(|(kind, n)| (kind, n.as_u64().unwrap_or(0)))
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                entries
                    .into_iter()
                    .map(|(kind, n)| format!("{n} {kind}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        let mut summary = format!("CodeGate protected {count} instances of PII, including {kinds}");

        let wrap_in_thinking = input_context
            .alerts
            .iter()
            .any(|a| a.trigger_string.contains(THINKING_WRAP_SIGNATURE));
        if wrap_in_thinking {
            summary = format!("<thinking>{summary}</thinking>");
        }

        output_context.notified = true;
        let notice = json!({ "choices": [{ "delta": { "role": "assistant", "content": summary } }] });
        vec![notice, chunk]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn framer_yields_only_complete_records() {
        let mut framer = SseFramer::new();
        let records = framer.push(b"data: {\"a\":1}\n\ndata: {\"a\":2");
        assert_eq!(records, vec!["data: {\"a\":1}\n\n"]);
        let records = framer.push(b"}\n\n");
        assert_eq!(records, vec!["data: {\"a\":2}\n\n"]);
    }

    #[test]
    fn can_be_uuid_accepts_valid_prefixes_and_rejects_bad_ones() {
        assert!(can_be_uuid(""));
        assert!(can_be_uuid("abcd1234"));
        assert!(can_be_uuid("abcd1234-ef01"));
        assert!(!can_be_uuid("zz"));
        assert!(!can_be_uuid("abcd123-4"));
    }

    #[tokio::test]
    async fn unredact_restores_a_value_split_across_three_chunks() {
        let store = SessionStore::new(Duration::from_secs(60));
        let placeholder = store.store("s1", "john@example.com".into(), "pii".into(), "email".into());
        let uuid_part = &placeholder[1..placeholder.len() - 1];
        let split_a = uuid_part.len() / 3;
        let split_b = 2 * uuid_part.len() / 3;

        let mut prefix = String::new();
        let mut out = String::new();
        out.push_str(&unredact_text(&mut prefix, &format!("hi #{}", &uuid_part[..split_a]), &store, "s1"));
        out.push_str(&unredact_text(&mut prefix, &uuid_part[split_a..split_b], &store, "s1"));
        out.push_str(&unredact_text(&mut prefix, &format!("{}# bye", &uuid_part[split_b..]), &store, "s1"));

        assert_eq!(out, "hi john@example.com bye");
    }

    #[test]
    fn malformed_marker_is_emitted_verbatim() {
        let store = SessionStore::new(Duration::from_secs(60));
        let mut prefix = String::new();
        let out = unredact_text(&mut prefix, "price is #5#", &store, "s1");
        assert_eq!(out, "price is #5#");
    }

    #[tokio::test]
    async fn notifier_fires_once_on_the_role_chunk_then_stays_quiet() {
        let store = SessionStore::new(Duration::from_secs(60));
        let mut context = PipelineContext::new("req-1".into(), "s1".into());
        context.metadata.insert("redacted_pii_count".into(), json!(1));
        context.metadata.insert("redacted_pii_details".into(), json!({"email": 1}));

        let step = RedactionNotifierStep;
        let mut output_context = OutputContext::new();

        let role_chunk = json!({"choices": [{"delta": {"role": "assistant"}}]});
        let emitted = step.process(role_chunk, &mut output_context, &context, &store).await;
        assert_eq!(emitted.len(), 2);
        assert!(output_context.notified);
        let notice = emitted[0].pointer("/choices/0/delta/content").unwrap().as_str().unwrap();
        assert_eq!(notice, "CodeGate protected 1 instances of PII, including 1 email");

        let next_chunk = json!({"choices": [{"delta": {"content": "hi"}}]});
        let emitted = step.process(next_chunk.clone(), &mut output_context, &context, &store).await;
        assert_eq!(emitted, vec![next_chunk]);
    }
}
