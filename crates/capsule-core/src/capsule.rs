//! Capsule data model: the unit of work, its result, and the PASS request a
//! blocked result carries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Trace key that forces the arbiter audit regardless of kind.
pub const TRACE_ARBITER: &str = "arbiter";
/// Trace key written on resumed capsules: the depth of the PASS round that produced them.
pub const TRACE_PASS_DEPTH: &str = "pass_depth";
/// Payload key holding a pre-identified skill id for the reflex fast path.
pub const PAYLOAD_SKILL_ID: &str = "skill_id";
/// Header of the section the PASS broker appends to a resumed goal.
pub const ASSIST_CONTEXT_HEADER: &str = "ADDED CONTEXT FROM ASSISTANTS";
/// Exact error string of the depth-exceeded terminal result.
pub const MAX_PASS_DEPTH_EXCEEDED: &str = "max_pass_depth_exceeded";

// Resolver roles named by needs.
pub const ROLE_TRUTH: &str = "Truth";
pub const ROLE_INTELLIGENCE: &str = "Intelligence";
pub const ROLE_SIMPLIFIER: &str = "Simplifier";
pub const ROLE_STRATEGY: &str = "Strategy";

/// Capsule kind. `Task` and `Skill` imply stricter auditing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapsuleKind {
    Task,
    #[default]
    Chat,
    Skill,
}

impl CapsuleKind {
    /// Task and skill capsules are dispatched near-deterministically.
    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Task | Self::Skill)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Chat => "chat",
            Self::Skill => "skill",
        }
    }
}

/// A unit of work submitted for dispatch.
///
/// Immutable once built. The PASS broker never rewrites a capsule in place: it derives
/// a new one with [`Capsule::resumed_with`] so the original stays auditable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capsule {
    pub id: String,
    pub kind: CapsuleKind,
    pub goal: String,
    #[serde(default)]
    pub trace: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl Capsule {
    pub fn new(id: impl Into<String>, kind: CapsuleKind, goal: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            goal: goal.into(),
            trace: BTreeMap::new(),
            payload: None,
        }
    }

    pub fn task(id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self::new(id, CapsuleKind::Task, goal)
    }

    pub fn chat(id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self::new(id, CapsuleKind::Chat, goal)
    }

    pub fn with_trace(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.trace.insert(key.into(), value);
        self
    }

    pub fn with_arbiter(self, enabled: bool) -> Self {
        self.with_trace(TRACE_ARBITER, serde_json::Value::Bool(enabled))
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// True when the arbiter contradiction audit must run.
    pub fn wants_arbiter(&self) -> bool {
        self.kind == CapsuleKind::Task
            || self
                .trace
                .get(TRACE_ARBITER)
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
    }

    /// Pre-identified skill id from the payload, if any.
    pub fn skill_id(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get(PAYLOAD_SKILL_ID))
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// PASS depth recorded on a resumed capsule (0 for caller-built capsules).
    pub fn pass_depth(&self) -> u32 {
        self.trace
            .get(TRACE_PASS_DEPTH)
            .and_then(|v| v.as_u64())
            .map(|d| d as u32)
            .unwrap_or(0)
    }

    /// Derive the capsule for the next PASS round. The goal keeps the original text and
    /// gains an assist section when at least one assist was gathered.
    pub fn resumed_with(&self, assists: &[AssistNote], depth: u32) -> Capsule {
        let mut goal = self.goal.clone();
        let gathered: Vec<&AssistNote> = assists.iter().filter(|a| !a.text.trim().is_empty()).collect();
        if !gathered.is_empty() {
            goal.push_str("\n\n");
            goal.push_str(ASSIST_CONTEXT_HEADER);
            goal.push_str(":\n");
            for note in gathered {
                goal.push_str(&format!("- [{} via {}] {}\n", note.role, note.minister, note.text.trim()));
            }
        }
        let mut trace = self.trace.clone();
        trace.insert(TRACE_PASS_DEPTH.to_string(), serde_json::Value::from(depth));
        Capsule {
            id: self.id.clone(),
            kind: self.kind,
            goal,
            trace,
            payload: self.payload.clone(),
        }
    }
}

/// One assist gathered by the PASS broker for a need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistNote {
    pub role: String,
    pub minister: String,
    pub text: String,
}

/// A named capability request raised inside a PASS request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Need {
    pub role: String,
    pub description: String,
}

impl Need {
    pub fn new(role: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            description: description.into(),
        }
    }
}

/// Why a result was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassReason {
    LowOutputConfidence,
    Contradiction,
    ResourceDowngrade,
}

impl PassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowOutputConfidence => "low_output_confidence",
            Self::Contradiction => "contradiction",
            Self::ResourceDowngrade => "resource_downgrade",
        }
    }
}

impl std::fmt::Display for PassReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attached to a blocked result; consumed by the PASS broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassRequest {
    pub reason: PassReason,
    /// Ordered; the broker resolves them in this order.
    pub needs: Vec<Need>,
    #[serde(default)]
    pub critique: Option<String>,
    /// The text (reply or goal) that produced the block.
    pub original: String,
    #[serde(default)]
    pub score: Option<f32>,
}

/// Terminal failure classes. Together with `blocked` this separates the error
/// taxonomy without inspecting logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Cancelled,
    InvalidProfile,
    LowOutputConfidence,
    Contradiction,
    ResourceDowngrade,
    DepthExceeded,
}

impl From<PassReason> for FailureKind {
    fn from(reason: PassReason) -> Self {
        match reason {
            PassReason::LowOutputConfidence => Self::LowOutputConfidence,
            PassReason::Contradiction => Self::Contradiction,
            PassReason::ResourceDowngrade => Self::ResourceDowngrade,
        }
    }
}

/// Output of a successful (or audited-but-blocked) pass.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CapsuleOutput {
    pub text: String,
    /// Title of the profile that produced the text.
    pub minister: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Structured output of a reflex skill.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Auxiliary telemetry attached to every result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CapsuleMetrics {
    #[serde(default)]
    pub reflex: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metabolic_cost: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default)]
    pub downgraded: bool,
    #[serde(default)]
    pub pass_depth: u32,
    #[serde(default)]
    pub elapsed_ms: u64,
}

/// Outcome of one executor pass (or of a whole PASS resolution).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsuleResult {
    pub ok: bool,
    pub capsule_id: String,
    #[serde(default)]
    pub output: CapsuleOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_request: Option<PassRequest>,
    #[serde(default)]
    pub metrics: CapsuleMetrics,
}

impl CapsuleResult {
    pub fn success(capsule_id: impl Into<String>, output: CapsuleOutput, metrics: CapsuleMetrics) -> Self {
        Self {
            ok: true,
            capsule_id: capsule_id.into(),
            output,
            error: None,
            failure: None,
            blocked: false,
            pass_request: None,
            metrics,
        }
    }

    /// Recoverable: the PASS broker may resolve it.
    pub fn blocked(
        capsule_id: impl Into<String>,
        output: CapsuleOutput,
        request: PassRequest,
        metrics: CapsuleMetrics,
    ) -> Self {
        Self {
            ok: false,
            capsule_id: capsule_id.into(),
            output,
            error: Some(request.reason.as_str().to_string()),
            failure: Some(request.reason.into()),
            blocked: true,
            pass_request: Some(request),
            metrics,
        }
    }

    /// Terminal, non-retryable at this layer.
    pub fn failed(
        capsule_id: impl Into<String>,
        failure: FailureKind,
        error: impl Into<String>,
        metrics: CapsuleMetrics,
    ) -> Self {
        Self {
            ok: false,
            capsule_id: capsule_id.into(),
            output: CapsuleOutput::default(),
            error: Some(error.into()),
            failure: Some(failure),
            blocked: false,
            pass_request: None,
            metrics,
        }
    }

    pub fn reason(&self) -> Option<PassReason> {
        self.pass_request.as_ref().map(|r| r.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_always_wants_arbiter() {
        assert!(Capsule::task("c1", "2+2").wants_arbiter());
        assert!(!Capsule::chat("c2", "hi").wants_arbiter());
        assert!(Capsule::chat("c3", "hi").with_arbiter(true).wants_arbiter());
    }

    #[test]
    fn resumed_capsule_keeps_original_and_appends_assists() {
        let original = Capsule::chat("c1", "Explain tides").with_arbiter(true);
        let notes = vec![
            AssistNote { role: "Truth".into(), minister: "Fact Checker".into(), text: "The moon drives tides.".into() },
            AssistNote { role: "Intelligence".into(), minister: "Analyst".into(), text: "   ".into() },
        ];
        let resumed = original.resumed_with(&notes, 1);

        assert_eq!(original.goal, "Explain tides");
        assert!(resumed.goal.starts_with("Explain tides"));
        assert!(resumed.goal.contains(ASSIST_CONTEXT_HEADER));
        assert!(resumed.goal.contains("The moon drives tides."));
        assert!(!resumed.goal.contains("Analyst"));
        assert_eq!(resumed.pass_depth(), 1);
        assert!(resumed.wants_arbiter());
    }

    #[test]
    fn resumed_without_assists_keeps_goal() {
        let original = Capsule::chat("c1", "Explain tides");
        let resumed = original.resumed_with(&[], 2);
        assert_eq!(resumed.goal, original.goal);
        assert_eq!(resumed.pass_depth(), 2);
    }

    #[test]
    fn pass_reason_serializes_snake_case() {
        let json = serde_json::to_string(&PassReason::LowOutputConfidence).unwrap();
        assert_eq!(json, "\"low_output_confidence\"");
    }

    #[test]
    fn skill_id_ignores_blank() {
        let c = Capsule::new("c", CapsuleKind::Skill, "x").with_payload(serde_json::json!({ "skill_id": "  " }));
        assert_eq!(c.skill_id(), None);
        let c = c.with_payload(serde_json::json!({ "skill_id": "clock" }));
        assert_eq!(c.skill_id(), Some("clock"));
    }
}
