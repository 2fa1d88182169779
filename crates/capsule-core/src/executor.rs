//! Capsule Executor (dispatch engine).
//!
//! One pass over a capsule walks a fixed sequence of states:
//!
//! ```text
//! Selecting -> Admitting -> Dispatching -> AuditingOutput -> [AuditingArbiter] -> Done | Blocked
//! ```
//!
//! Transport failures are terminal at this layer; low confidence, contradictions, and
//! resource exhaustion come back as blocked results for the PASS broker. The admission
//! permit is held for the whole pass and released on every exit path when it drops.

use crate::budget::{compute_budget, BudgetPolicy, HeuristicTokenCounter, TokenCounter};
use crate::cabinet::Cabinet;
use crate::capsule::{
    Capsule, CapsuleMetrics, CapsuleOutput, CapsuleResult, FailureKind, Need, PassReason, PassRequest,
    ROLE_INTELLIGENCE, ROLE_SIMPLIFIER, ROLE_TRUTH,
};
use crate::error::DispatchError;
use crate::load_balancer::{AdmissionDecision, AdmissionPermit, DenialReason, LoadBalancer, NodeRef};
use crate::prompts::{arbiter_prompt, scoring_prompt, simplify_need_description, ARBITER_CLEAR_MARKER};
use crate::registry::{BackendRegistry, CostTable, MetabolicCost, Profile};
use crate::telemetry::{
    TelemetryEvent, EVENT_ADMITTED, EVENT_AUDITED, EVENT_BLOCKED, EVENT_COMPLETED, EVENT_DENIED,
    EVENT_DISPATCHED, EVENT_FAILED, EVENT_REFLEX, EVENT_SELECTED,
};
use crate::traits::{
    Embedder, InferenceBackend, InvokeRequest, NullSkillRegistry, NullTelemetry, ResourceProvider,
    SkillRegistry, TelemetrySink,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_OUTPUT_CONFIDENCE_THRESHOLD: f32 = 0.7;
pub const DEFAULT_CONFIDENCE_ON_PARSE_FAILURE: f32 = 0.5;
pub const DEFAULT_REQUESTED_TOKENS: u32 = 1_024;

/// Leading number of a scorer reply, after an optional short label ("Score: 0.8").
/// Group 2 catches fractions and ratings ("3/10", "7 out of 10").
static LEADING_DECIMAL: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)^\D{0,24}?(\d+(?:\.\d+)?|\.\d+)\s*(/|out\s+of\b)?").ok());

/// `[audit]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// Scores strictly below this block with `low_output_confidence`.
    pub output_confidence_threshold: f32,
    /// Token the arbiter leads with when it finds nothing wrong.
    pub clear_marker: String,
    /// Resolver roles a contradiction block asks for.
    pub arbiter_roles: Vec<String>,
    /// Resolver roles a low-confidence block asks for.
    pub low_confidence_roles: Vec<String>,
    /// Profile title used for scoring. `None` scores with the President.
    pub scorer: Option<String>,
    pub score_tokens: u32,
    pub critique_tokens: u32,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            output_confidence_threshold: DEFAULT_OUTPUT_CONFIDENCE_THRESHOLD,
            clear_marker: ARBITER_CLEAR_MARKER.to_string(),
            arbiter_roles: vec![ROLE_TRUTH.to_string(), ROLE_INTELLIGENCE.to_string()],
            low_confidence_roles: vec![ROLE_INTELLIGENCE.to_string()],
            scorer: None,
            score_tokens: 16,
            critique_tokens: 256,
        }
    }
}

/// `[sampling]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    /// Used for `task` and `skill` capsules.
    pub strict_temperature: f32,
    pub relaxed_temperature: f32,
    /// Output ceiling requested before budgeting.
    pub requested_tokens: u32,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            strict_temperature: 0.1,
            relaxed_temperature: 0.7,
            requested_tokens: DEFAULT_REQUESTED_TOKENS,
        }
    }
}

/// `[timeouts]` config section, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub health_ms: u64,
    pub embed_ms: u64,
    /// Reflex skill execution; a skill that overruns falls through to model dispatch.
    pub skill_ms: u64,
    pub invoke_ms: u64,
    pub scoring_ms: u64,
    pub arbiter_ms: u64,
    pub assist_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            health_ms: crate::load_balancer::DEFAULT_HEALTH_TIMEOUT_MS,
            embed_ms: 5_000,
            skill_ms: 5_000,
            invoke_ms: 60_000,
            scoring_ms: 15_000,
            arbiter_ms: 30_000,
            assist_ms: 30_000,
        }
    }
}

impl TimeoutSettings {
    pub fn health(&self) -> Duration {
        Duration::from_millis(self.health_ms)
    }
    pub fn embed(&self) -> Duration {
        Duration::from_millis(self.embed_ms)
    }
    pub fn skill(&self) -> Duration {
        Duration::from_millis(self.skill_ms)
    }
    pub fn invoke(&self) -> Duration {
        Duration::from_millis(self.invoke_ms)
    }
    pub fn scoring(&self) -> Duration {
        Duration::from_millis(self.scoring_ms)
    }
    pub fn arbiter(&self) -> Duration {
        Duration::from_millis(self.arbiter_ms)
    }
    pub fn assist(&self) -> Duration {
        Duration::from_millis(self.assist_ms)
    }
}

/// Everything the executor reads from config.
#[derive(Debug, Clone, Default)]
pub struct ExecutorSettings {
    pub audit: AuditSettings,
    pub sampling: SamplingSettings,
    pub timeouts: TimeoutSettings,
    pub budget: BudgetPolicy,
    pub cost_table: CostTable,
}

/// External collaborators. Optional ones default to their null objects.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn InferenceBackend>,
    pub embedder: Arc<dyn Embedder>,
    pub resources: Arc<dyn ResourceProvider>,
    pub skills: Arc<dyn SkillRegistry>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub token_counter: Arc<dyn TokenCounter>,
}

impl Collaborators {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        embedder: Arc<dyn Embedder>,
        resources: Arc<dyn ResourceProvider>,
    ) -> Self {
        Self {
            backend,
            embedder,
            resources,
            skills: Arc::new(NullSkillRegistry),
            telemetry: Arc::new(NullTelemetry),
            token_counter: Arc::new(HeuristicTokenCounter),
        }
    }

    pub fn with_skills(mut self, skills: Arc<dyn SkillRegistry>) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = counter;
        self
    }
}

/// Executor states, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Selecting,
    Admitting,
    Dispatching,
    AuditingOutput,
    AuditingArbiter,
    Done,
    Blocked,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Selecting => "selecting",
            Self::Admitting => "admitting",
            Self::Dispatching => "dispatching",
            Self::AuditingOutput => "auditing_output",
            Self::AuditingArbiter => "auditing_arbiter",
            Self::Done => "done",
            Self::Blocked => "blocked",
        }
    }
}

/// Result of an assist call made on behalf of the PASS broker.
#[derive(Debug, Clone, PartialEq)]
pub enum AssistOutcome {
    Answered(String),
    Denied(DenialReason),
}

/// Race `fut` against cancellation and a deadline.
pub(crate) async fn bounded<F, T>(
    call: &'static str,
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, DispatchError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DispatchError::Cancelled(call)),
        outcome = tokio::time::timeout(limit, fut) => outcome.map_err(|_| DispatchError::Timeout {
            call,
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

/// Race `fut` against cancellation only. For calls that bound themselves.
pub(crate) async fn cancellable<F, T>(call: &'static str, cancel: &CancellationToken, fut: F) -> Result<T, DispatchError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DispatchError::Cancelled(call)),
        value = fut => Ok(value),
    }
}

/// Parse a scorer reply into [0, 1]. Unparseable replies, values outside [0, 1], and
/// ratings on another scale score [`DEFAULT_CONFIDENCE_ON_PARSE_FAILURE`].
pub fn parse_confidence(raw: &str) -> f32 {
    LEADING_DECIMAL
        .as_ref()
        .and_then(|re| re.captures(raw.trim()))
        .filter(|caps| caps.get(2).is_none())
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f32>().ok())
        .filter(|v| (0.0..=1.0).contains(v))
        .unwrap_or(DEFAULT_CONFIDENCE_ON_PARSE_FAILURE)
}

fn is_decoration(c: char) -> bool {
    matches!(c, '*' | '_' | '`' | '"' | '\'' | '#')
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Trim whitespace, markdown emphasis, quotes, and trailing punctuation.
fn strip_decoration(text: &str) -> &str {
    text.trim()
        .trim_start_matches(|c: char| is_decoration(c) || c.is_whitespace())
        .trim_end_matches(|c: char| is_decoration(c) || c.is_whitespace() || matches!(c, '.' | '!' | ':'))
}

const NEGATIONS: [&str; 4] = ["not", "isn't", "never", "no"];

/// Arbiter verdict. Clear when the marker opens the critique, stands alone on a line,
/// or closes the critique without a negation in front of it. Anything else, including
/// an empty critique, counts as a contradiction.
pub fn critique_is_clear(critique: &str, marker: &str) -> bool {
    let marker = marker.trim();
    if marker.is_empty() {
        return false;
    }
    leads_with_marker(critique, marker)
        || critique.lines().any(|line| strip_decoration(line).eq_ignore_ascii_case(marker))
        || ends_with_marker(critique, marker)
}

fn leads_with_marker(critique: &str, marker: &str) -> bool {
    let lead = critique
        .trim_start()
        .trim_start_matches(is_decoration)
        .trim_start();
    if lead.len() < marker.len() || !lead.is_char_boundary(marker.len()) {
        return false;
    }
    let (head, rest) = lead.split_at(marker.len());
    head.eq_ignore_ascii_case(marker) && !rest.starts_with(is_word_char)
}

fn ends_with_marker(critique: &str, marker: &str) -> bool {
    let tail = strip_decoration(critique);
    if tail.len() < marker.len() || !tail.is_char_boundary(tail.len() - marker.len()) {
        return false;
    }
    let (before, last) = tail.split_at(tail.len() - marker.len());
    if !last.eq_ignore_ascii_case(marker) || before.ends_with(is_word_char) {
        return false;
    }
    let previous = before
        .trim_end_matches(|c: char| is_decoration(c) || c.is_whitespace())
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    !NEGATIONS.contains(&previous.as_str())
}

pub struct CapsuleExecutor {
    registry: Arc<BackendRegistry>,
    cabinet: Arc<Cabinet>,
    balancer: Arc<LoadBalancer>,
    backend: Arc<dyn InferenceBackend>,
    resources: Arc<dyn ResourceProvider>,
    skills: Arc<dyn SkillRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    token_counter: Arc<dyn TokenCounter>,
    settings: ExecutorSettings,
}

impl CapsuleExecutor {
    pub fn new(
        registry: Arc<BackendRegistry>,
        cabinet: Arc<Cabinet>,
        balancer: Arc<LoadBalancer>,
        collaborators: &Collaborators,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            registry,
            cabinet,
            balancer,
            backend: Arc::clone(&collaborators.backend),
            resources: Arc::clone(&collaborators.resources),
            skills: Arc::clone(&collaborators.skills),
            telemetry: Arc::clone(&collaborators.telemetry),
            token_counter: Arc::clone(&collaborators.token_counter),
            settings,
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn cabinet(&self) -> &Cabinet {
        &self.cabinet
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub(crate) fn emit(&self, event: TelemetryEvent) {
        self.telemetry.emit(event);
    }

    /// Run one pass over `capsule`. Never panics and never returns an `Err`: every
    /// outcome, including cancellation, is a [`CapsuleResult`].
    pub async fn execute(&self, capsule: &Capsule, cancel: &CancellationToken) -> CapsuleResult {
        let started = Instant::now();
        let mut metrics = CapsuleMetrics {
            pass_depth: capsule.pass_depth(),
            ..CapsuleMetrics::default()
        };
        info!(
            target: "capsule::executor",
            capsule_id = %capsule.id,
            kind = capsule.kind.as_str(),
            goal_len = capsule.goal.len(),
            depth = metrics.pass_depth,
            "Executing capsule"
        );
        let result = self.run(capsule, cancel, &mut metrics).await;
        self.conclude(capsule, result, started)
    }

    async fn run(&self, capsule: &Capsule, cancel: &CancellationToken, metrics: &mut CapsuleMetrics) -> CapsuleResult {
        if cancel.is_cancelled() {
            return self.dispatch_failure(capsule, DispatchError::Cancelled("selection"), metrics);
        }

        self.enter(capsule, ExecutionState::Selecting);
        match self.try_reflex(capsule, cancel, metrics).await {
            Ok(Some(result)) => return result,
            Ok(None) => {}
            Err(e) => return self.dispatch_failure(capsule, e, metrics),
        }
        let (selected, delegation) = match self.select(capsule, cancel).await {
            Ok(choice) => choice,
            Err(e) => return self.dispatch_failure(capsule, e, metrics),
        };
        metrics.delegation_confidence = Some(delegation);
        self.emit(
            TelemetryEvent::new(EVENT_SELECTED, &capsule.id)
                .with("minister", selected.title.as_str())
                .with("delegation_confidence", delegation as f64),
        );

        self.enter(capsule, ExecutionState::Admitting);
        let (profile, permit) = match self.admit(capsule, selected, cancel, metrics).await {
            Ok(admitted) => admitted,
            Err(result) => return result,
        };

        self.enter(capsule, ExecutionState::Dispatching);
        let reply = match self.dispatch(capsule, &profile, &permit, cancel, metrics).await {
            Ok(reply) => reply,
            Err(e) => return self.dispatch_failure(capsule, e, metrics),
        };

        self.enter(capsule, ExecutionState::AuditingOutput);
        let confidence = match self.score(capsule, &reply, cancel).await {
            Ok(score) => score,
            Err(e) => return self.dispatch_failure(capsule, e, metrics),
        };
        metrics.output_confidence = Some(confidence);
        self.emit(
            TelemetryEvent::new(EVENT_AUDITED, &capsule.id)
                .with("audit", "output")
                .with("confidence", confidence as f64),
        );
        let output = CapsuleOutput {
            text: reply,
            minister: profile.title.clone(),
            confidence: Some(confidence),
            data: None,
        };

        if confidence < self.settings.audit.output_confidence_threshold {
            let request = PassRequest {
                reason: PassReason::LowOutputConfidence,
                needs: self.needs_for(
                    &self.settings.audit.low_confidence_roles,
                    "Supply the missing facts or reasoning so the reply fully and correctly answers the goal.",
                ),
                critique: None,
                original: output.text.clone(),
                score: Some(confidence),
            };
            return CapsuleResult::blocked(&capsule.id, output, request, metrics.clone());
        }

        if capsule.wants_arbiter() {
            self.enter(capsule, ExecutionState::AuditingArbiter);
            let critique = match self.arbitrate(capsule, &output.text, cancel).await {
                Ok(critique) => critique,
                Err(e) => return self.dispatch_failure(capsule, e, metrics),
            };
            let clear = critique_is_clear(&critique, &self.settings.audit.clear_marker);
            self.emit(
                TelemetryEvent::new(EVENT_AUDITED, &capsule.id)
                    .with("audit", "arbiter")
                    .with("clear", clear),
            );
            if !clear {
                let description = format!("Resolve the contradiction raised by the arbiter: {}", critique.trim());
                let request = PassRequest {
                    reason: PassReason::Contradiction,
                    needs: self.needs_for(&self.settings.audit.arbiter_roles, &description),
                    critique: Some(critique),
                    original: output.text.clone(),
                    score: Some(confidence),
                };
                return CapsuleResult::blocked(&capsule.id, output, request, metrics.clone());
            }
        }

        drop(permit);
        CapsuleResult::success(&capsule.id, output, metrics.clone())
    }

    fn enter(&self, capsule: &Capsule, state: ExecutionState) {
        debug!(target: "capsule::executor", capsule_id = %capsule.id, state = state.as_str(), "State transition");
    }

    /// Reflex fast path: an explicit `payload.skill_id`, else a registry lookup on the goal.
    /// A failed skill falls through to model dispatch.
    async fn try_reflex(
        &self,
        capsule: &Capsule,
        cancel: &CancellationToken,
        metrics: &mut CapsuleMetrics,
    ) -> Result<Option<CapsuleResult>, DispatchError> {
        let skill_id = match capsule.skill_id() {
            Some(id) if self.skills.has(id) => id.to_string(),
            _ => match self.skills.lookup(&capsule.goal) {
                Some(id) if self.skills.has(&id) => id,
                _ => return Ok(None),
            },
        };
        let execution = self.skills.execute(&skill_id, capsule.payload.as_ref());
        let outcome = match bounded("skill", self.settings.timeouts.skill(), cancel, execution).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(target: "capsule::executor", capsule_id = %capsule.id, skill = %skill_id, error = %e, "Skill overran; falling through to model dispatch");
                return Ok(None);
            }
        };
        if !outcome.success {
            debug!(
                target: "capsule::executor",
                capsule_id = %capsule.id,
                skill = %skill_id,
                "Skill failed; falling through to model dispatch"
            );
            return Ok(None);
        }
        metrics.reflex = true;
        self.emit(TelemetryEvent::new(EVENT_REFLEX, &capsule.id).with("skill", skill_id.as_str()));
        let text = match &outcome.output {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let output = CapsuleOutput {
            text,
            minister: skill_id,
            confidence: None,
            data: Some(outcome.output),
        };
        Ok(Some(CapsuleResult::success(&capsule.id, output, metrics.clone())))
    }

    /// Cabinet routing with President fallback. Only cancellation is an error.
    async fn select(&self, capsule: &Capsule, cancel: &CancellationToken) -> Result<(Arc<Profile>, f32), DispatchError> {
        let threshold = self.cabinet.confidence_threshold();
        let convened = bounded("selection", self.settings.timeouts.embed(), cancel, self.cabinet.convene(&capsule.goal)).await;
        let choice = match convened {
            Ok(Ok((profile, confidence))) if confidence >= threshold => (profile, confidence),
            Ok(Ok((profile, confidence))) => {
                debug!(
                    target: "capsule::executor",
                    capsule_id = %capsule.id,
                    best = %profile.title,
                    confidence,
                    threshold,
                    "Delegation below threshold; President takes the capsule"
                );
                (self.cabinet.president(), confidence)
            }
            Ok(Err(e)) => {
                warn!(target: "capsule::executor", capsule_id = %capsule.id, error = %e, "Cabinet unavailable; President takes the capsule");
                (self.cabinet.president(), 0.0)
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(target: "capsule::executor", capsule_id = %capsule.id, error = %e, "Cabinet timed out; President takes the capsule");
                (self.cabinet.president(), 0.0)
            }
        };
        Ok(choice)
    }

    /// Admission with one downgrade retry through the President.
    async fn admit(
        &self,
        capsule: &Capsule,
        selected: Arc<Profile>,
        cancel: &CancellationToken,
        metrics: &mut CapsuleMetrics,
    ) -> Result<(Arc<Profile>, AdmissionPermit), CapsuleResult> {
        let mut profile = selected;
        let mut retried = false;
        loop {
            if !self.balancer.knows_backend(&profile.backend_id) {
                warn!(
                    target: "capsule::executor",
                    capsule_id = %capsule.id,
                    minister = %profile.title,
                    backend = %profile.backend_id,
                    "Profile has no configured nodes"
                );
                let error = format!("profile {} names backend {} with no nodes", profile.title, profile.backend_id);
                return Err(CapsuleResult::failed(&capsule.id, FailureKind::InvalidProfile, error, metrics.clone()));
            }
            let required_mb = self.settings.cost_table.required_mb(profile.metabolic_cost);
            metrics.metabolic_cost = Some(required_mb);
            let decision = cancellable("admission", cancel, self.balancer.request_load(&profile.backend_id, required_mb))
                .await
                .map_err(|e| self.dispatch_failure(capsule, e, metrics))?;
            let reason = match decision {
                AdmissionDecision::Admitted(permit) => {
                    metrics.node = Some(permit.node().node_id.clone());
                    self.emit(
                        TelemetryEvent::new(EVENT_ADMITTED, &capsule.id)
                            .with("minister", profile.title.as_str())
                            .with("node", permit.node().node_id.as_str())
                            .with("required_mb", required_mb),
                    );
                    return Ok((profile, permit));
                }
                AdmissionDecision::Denied(reason) => reason,
            };
            self.emit(
                TelemetryEvent::new(EVENT_DENIED, &capsule.id)
                    .with("minister", profile.title.as_str())
                    .with("required_mb", required_mb)
                    .with("reason", reason.as_str()),
            );

            let downgradable = !profile.president && profile.metabolic_cost > MetabolicCost::Micro;
            if !retried && downgradable {
                let president = self.registry.default_profile();
                info!(
                    target: "capsule::executor",
                    capsule_id = %capsule.id,
                    from = %profile.title,
                    to = %president.title,
                    reason = reason.as_str(),
                    "Admission denied; downgrading to the President"
                );
                retried = true;
                metrics.downgraded = true;
                profile = president;
                continue;
            }

            let request = PassRequest {
                reason: PassReason::ResourceDowngrade,
                needs: vec![Need::new(ROLE_SIMPLIFIER, simplify_need_description())],
                critique: Some(format!("admission denied: {}", reason.as_str())),
                original: capsule.goal.clone(),
                score: None,
            };
            let output = CapsuleOutput {
                minister: profile.title.clone(),
                ..CapsuleOutput::default()
            };
            return Err(CapsuleResult::blocked(&capsule.id, output, request, metrics.clone()));
        }
    }

    async fn dispatch(
        &self,
        capsule: &Capsule,
        profile: &Profile,
        permit: &AdmissionPermit,
        cancel: &CancellationToken,
        metrics: &mut CapsuleMetrics,
    ) -> Result<String, DispatchError> {
        let snapshot = cancellable("budget", cancel, self.resources.snapshot()).await?;
        let (max_tokens, details) = compute_budget(
            &capsule.goal,
            self.settings.sampling.requested_tokens,
            &snapshot,
            profile.metabolic_cost,
            &self.settings.cost_table,
            &self.settings.budget,
            self.token_counter.as_ref(),
        );
        metrics.effective_tokens = Some(max_tokens);
        let temperature = if capsule.kind.is_strict() {
            self.settings.sampling.strict_temperature
        } else {
            self.settings.sampling.relaxed_temperature
        };
        let request = InvokeRequest {
            backend_id: profile.backend_id.clone(),
            prompt: capsule.goal.clone(),
            max_tokens,
            temperature,
            timeout: self.settings.timeouts.invoke(),
        };
        let reply = self.call("dispatch", permit.node(), &request, cancel).await?;
        self.emit(
            TelemetryEvent::new(EVENT_DISPATCHED, &capsule.id)
                .with("minister", profile.title.as_str())
                .with("node", permit.node().node_id.as_str())
                .with("max_tokens", max_tokens)
                .with("prompt_tokens", details.prompt_tokens)
                .with("reply_len", reply.len()),
        );
        Ok(reply)
    }

    fn scorer(&self) -> Arc<Profile> {
        match &self.settings.audit.scorer {
            Some(title) => match self.registry.get_profile(title) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(target: "capsule::executor", error = %e, "Configured scorer missing; scoring with the President");
                    self.registry.default_profile()
                }
            },
            None => self.registry.default_profile(),
        }
    }

    async fn score(&self, capsule: &Capsule, reply: &str, cancel: &CancellationToken) -> Result<f32, DispatchError> {
        let scorer = self.scorer();
        let request = InvokeRequest {
            backend_id: scorer.backend_id.clone(),
            prompt: scoring_prompt(&capsule.goal, reply),
            max_tokens: self.settings.audit.score_tokens,
            temperature: 0.0,
            timeout: self.settings.timeouts.scoring(),
        };
        let node = self.audit_node(&scorer, cancel).await?;
        let raw = self.call("scoring", &node, &request, cancel).await?;
        let confidence = parse_confidence(&raw);
        debug!(target: "capsule::executor", capsule_id = %capsule.id, scorer = %scorer.title, confidence, "Output scored");
        Ok(confidence)
    }

    async fn arbitrate(&self, capsule: &Capsule, reply: &str, cancel: &CancellationToken) -> Result<String, DispatchError> {
        let president = self.registry.default_profile();
        let request = InvokeRequest {
            backend_id: president.backend_id.clone(),
            prompt: arbiter_prompt(&capsule.goal, reply),
            max_tokens: self.settings.audit.critique_tokens,
            temperature: 0.0,
            timeout: self.settings.timeouts.arbiter(),
        };
        let node = self.audit_node(&president, cancel).await?;
        self.call("arbiter", &node, &request, cancel).await
    }

    /// Audit calls ride on the capsule's admission and commit no load of their own.
    async fn audit_node(&self, profile: &Profile, cancel: &CancellationToken) -> Result<NodeRef, DispatchError> {
        cancellable("probe", cancel, self.balancer.probe(&profile.backend_id))
            .await?
            .ok_or_else(|| DispatchError::NoLiveNode(profile.backend_id.clone()))
    }

    async fn call(
        &self,
        call: &'static str,
        node: &NodeRef,
        request: &InvokeRequest,
        cancel: &CancellationToken,
    ) -> Result<String, DispatchError> {
        bounded(call, request.timeout, cancel, self.backend.invoke(node, request))
            .await?
            .map_err(DispatchError::from)
    }

    /// Admitted assist call for the PASS broker. Holds its own permit for the call.
    pub(crate) async fn assist(
        &self,
        profile: &Profile,
        prompt: String,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<AssistOutcome, DispatchError> {
        let required_mb = self.settings.cost_table.required_mb(profile.metabolic_cost);
        let permit = match cancellable("assist", cancel, self.balancer.request_load(&profile.backend_id, required_mb)).await? {
            AdmissionDecision::Admitted(permit) => permit,
            AdmissionDecision::Denied(reason) => return Ok(AssistOutcome::Denied(reason)),
        };
        let request = InvokeRequest {
            backend_id: profile.backend_id.clone(),
            prompt,
            max_tokens,
            temperature: self.settings.sampling.strict_temperature,
            timeout: self.settings.timeouts.assist(),
        };
        let text = self.call("assist", permit.node(), &request, cancel).await?;
        Ok(AssistOutcome::Answered(text))
    }

    fn needs_for(&self, roles: &[String], description: &str) -> Vec<Need> {
        roles.iter().map(|role| Need::new(role.as_str(), description)).collect()
    }

    fn dispatch_failure(&self, capsule: &Capsule, error: DispatchError, metrics: &CapsuleMetrics) -> CapsuleResult {
        let kind = if error.is_cancelled() { FailureKind::Cancelled } else { FailureKind::Transport };
        warn!(target: "capsule::executor", capsule_id = %capsule.id, error = %error, "Capsule failed");
        CapsuleResult::failed(&capsule.id, kind, error.to_string(), metrics.clone())
    }

    fn conclude(&self, capsule: &Capsule, mut result: CapsuleResult, started: Instant) -> CapsuleResult {
        result.metrics.elapsed_ms = started.elapsed().as_millis() as u64;
        let (state, event) = if result.ok {
            (ExecutionState::Done, EVENT_COMPLETED)
        } else if result.blocked {
            (ExecutionState::Blocked, EVENT_BLOCKED)
        } else {
            (ExecutionState::Done, EVENT_FAILED)
        };
        self.enter(capsule, state);
        let mut event = TelemetryEvent::new(event, &capsule.id)
            .with("minister", result.output.minister.as_str())
            .with("elapsed_ms", result.metrics.elapsed_ms)
            .with("depth", result.metrics.pass_depth);
        if let Some(reason) = result.reason() {
            event = event.with("reason", reason.as_str());
        }
        if let Some(error) = &result.error {
            event = event.with("error", error.as_str());
        }
        self.emit(event);
        info!(
            target: "capsule::executor",
            capsule_id = %capsule.id,
            ok = result.ok,
            blocked = result.blocked,
            minister = %result.output.minister,
            elapsed_ms = result.metrics.elapsed_ms,
            "Capsule pass finished"
        );
        result
    }
}
