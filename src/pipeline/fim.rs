//! FIM (fill-in-middle) request normalization.
//!
//! Copilot-style completion requests carry a flat `{prompt, suffix}` shape
//! rather than the chat `{messages: [...]}` shape every other step
//! understands. The normalizer wraps `prompt` into a single synthetic user
//! message before the pipeline runs; the denormalizer splices the
//! (possibly rewritten) message content back into the original shape
//! afterward so the provider never sees anything but its own wire format.

use serde_json::{json, Value};

const SUFFIX_KEY: &str = "_fim_suffix";

/// Converts a `{prompt, suffix, ...}` body into `{messages: [...]}`.
/// A request that is already chat-shaped passes through unchanged.
pub fn normalize(request: &Value) -> Value {
    if request.get("messages").is_some() {
        return request.clone();
    }

    let prompt = request.get("prompt").and_then(Value::as_str).unwrap_or("").to_string();
    json!({
        "messages": [{"role": "user", "content": prompt}],
        SUFFIX_KEY: request.get("suffix").cloned().unwrap_or(Value::Null),
    })
}

/// Reverses [`normalize`]: takes the pipeline's final (possibly rewritten)
/// chat-shaped request and the original provider-shaped request, and
/// returns the original shape with `prompt` replaced by the rewritten
/// message content.
pub fn denormalize(original: &Value, processed: &Value) -> Value {
    let mut result = original.clone();
    let rewritten_prompt = processed
        .get("messages")
        .and_then(|m| m.get(0))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str);

    if let Some(prompt) = rewritten_prompt {
        result["prompt"] = json!(prompt);
    }
    result
}
