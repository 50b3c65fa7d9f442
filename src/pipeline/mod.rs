//! Request/response pipeline driver.
//!
//! A pipeline is a non-empty ordered list of [`Step`] values threaded
//! through a shared [`PipelineContext`]. Steps are plain values behind a
//! trait object — no inheritance tree, just a fixed `process` contract,
//! the same shape the teacher uses for its pluggable selection strategies.

pub mod fim;
pub mod pii;
pub mod suspicious;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::CodegateError;
use crate::session::SessionStore;

pub const DEFAULT_REQUEST_ID_HEADER: &str = "x-request-id";
const FIM_USER_AGENT_TOKEN: &str = "GithubCopilot/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Info,
    Likely,
    Possibly,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Likely => "likely",
            AlertSeverity::Possibly => "possibly",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub step_name: String,
    pub trigger_string: String,
    pub severity: AlertSeverity,
}

/// Per-request state threaded through every step of a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub request_id: String,
    pub session_id: String,
    pub alerts: Vec<Alert>,
    pub metadata: HashMap<String, Value>,
}

impl PipelineContext {
    pub fn new(request_id: String, session_id: String) -> Self {
        Self {
            request_id,
            session_id,
            alerts: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn push_alert(&mut self, step_name: &str, trigger_string: impl Into<String>, severity: AlertSeverity) {
        self.alerts.push(Alert {
            step_name: step_name.to_string(),
            trigger_string: trigger_string.into(),
            severity,
        });
    }
}

pub enum Control {
    Continue,
    ShortCircuit(Value),
}

pub struct StepOutcome {
    pub request: Value,
    pub context: PipelineContext,
    pub control: Control,
}

impl StepOutcome {
    pub fn continue_with(request: Value, context: PipelineContext) -> Self {
        Self {
            request,
            context,
            control: Control::Continue,
        }
    }
}

/// A single transformation stage. Steps never see the raw wire bytes —
/// only the already-decoded JSON body and the shared context.
#[async_trait::async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a failure in this step should replace the forwarded
    /// response with a canned error instead of the step being a no-op.
    fn critical(&self) -> bool {
        false
    }

    async fn process(
        &self,
        request: Value,
        context: PipelineContext,
        session_store: &SessionStore,
    ) -> Result<StepOutcome, CodegateError>;
}

pub enum PipelineKind {
    Input,
    Fim,
}

/// Chooses a pipeline for a decoded chat-completions request. Every other
/// request is forwarded untouched (`None`).
pub fn select_pipeline(method: &str, path: &str, user_agent: Option<&str>) -> Option<PipelineKind> {
    if !method.eq_ignore_ascii_case("POST") || !path.ends_with("/chat/completions") {
        return None;
    }
    let is_fim = user_agent
        .map(|ua| ua.contains(FIM_USER_AGENT_TOKEN))
        .unwrap_or(false);
    Some(if is_fim { PipelineKind::Fim } else { PipelineKind::Input })
}

pub struct Pipeline {
    steps: Vec<Arc<dyn Step>>,
}

impl Pipeline {
    pub fn new(steps: Vec<Arc<dyn Step>>) -> Self {
        assert!(!steps.is_empty(), "a pipeline must have at least one step");
        Self { steps }
    }

    /// Runs every step in order. Returns the (possibly rewritten) request
    /// and context, plus `Some(response)` if a step short-circuited.
    pub async fn run(
        &self,
        mut request: Value,
        mut context: PipelineContext,
        session_store: &SessionStore,
    ) -> (Value, PipelineContext, Option<Value>) {
        for step in &self.steps {
            let attempt_request = request.clone();
            let attempt_context = context.clone();
            match step.process(attempt_request, attempt_context, session_store).await {
                Ok(outcome) => {
                    request = outcome.request;
                    context = outcome.context;
                    if let Control::ShortCircuit(response) = outcome.control {
                        return (request, context, Some(response));
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        step = step.name(),
                        request_id = %context.request_id,
                        error = %err,
                        "pipeline step failed"
                    );
                    if step.critical() {
                        return (request, context, Some(canned_error_body(step.name())));
                    }
                }
            }
        }
        (request, context, None)
    }
}

fn canned_error_body(step_name: &str) -> Value {
    json!({ "error": format!("pipeline step {step_name} failed") })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Passthrough;

    #[async_trait::async_trait]
    impl Step for Passthrough {
        fn name(&self) -> &str {
            "passthrough"
        }
        async fn process(
            &self,
            request: Value,
            context: PipelineContext,
            _session_store: &SessionStore,
        ) -> Result<StepOutcome, CodegateError> {
            Ok(StepOutcome::continue_with(request, context))
        }
    }

    struct AlwaysFails;

    #[async_trait::async_trait]
    impl Step for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }
        fn critical(&self) -> bool {
            true
        }
        async fn process(
            &self,
            _request: Value,
            _context: PipelineContext,
            _session_store: &SessionStore,
        ) -> Result<StepOutcome, CodegateError> {
            Err(CodegateError::PipelineStepError {
                step: self.name().to_string(),
                source: anyhow::anyhow!("boom"),
            })
        }
    }

    #[tokio::test]
    async fn passthrough_pipeline_is_a_no_op() {
        let store = SessionStore::new(std::time::Duration::from_secs(60));
        let pipeline = Pipeline::new(vec![Arc::new(Passthrough)]);
        let request = json!({"messages": []});
        let context = PipelineContext::new("req-1".into(), "sess-1".into());
        let (out, _, response) = pipeline.run(request.clone(), context, &store).await;
        assert_eq!(out, request);
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn a_critical_step_failure_short_circuits() {
        let store = SessionStore::new(std::time::Duration::from_secs(60));
        let pipeline = Pipeline::new(vec![Arc::new(AlwaysFails)]);
        let context = PipelineContext::new("req-1".into(), "sess-1".into());
        let (_, _, response) = pipeline.run(json!({}), context, &store).await;
        assert!(response.is_some());
    }

    #[test]
    fn selects_fim_for_copilot_user_agent() {
        assert!(matches!(
            select_pipeline("POST", "/v1/chat/completions", Some("GithubCopilot/1.200.0")),
            Some(PipelineKind::Fim)
        ));
        assert!(matches!(
            select_pipeline("POST", "/v1/chat/completions", Some("curl/8.0")),
            Some(PipelineKind::Input)
        ));
        assert!(select_pipeline("GET", "/v1/models", None).is_none());
    }
}
