//! PASS broker: resolves blocked results by gathering assists and resuming.
//!
//! Resolution is an explicit loop. Each round resolves the blocked result's needs in
//! order, appends the gathered assists to the original goal, and re-executes. The round
//! counter lives in a request-scoped [`PassContext`]; running out of rounds is a
//! terminal `max_pass_depth_exceeded` failure. Assists are gathered fresh for every
//! capsule and every round.

use crate::capsule::{
    AssistNote, Capsule, CapsuleResult, FailureKind, Need, PassRequest, MAX_PASS_DEPTH_EXCEEDED, ROLE_INTELLIGENCE,
    ROLE_SIMPLIFIER, ROLE_STRATEGY, ROLE_TRUTH,
};
use crate::error::DispatchError;
use crate::executor::{bounded, AssistOutcome, CapsuleExecutor};
use crate::prompts::assist_prompt;
use crate::registry::Profile;
use crate::telemetry::{TelemetryEvent, EVENT_PASS_ASSIST, EVENT_PASS_DEPTH_EXCEEDED, EVENT_PASS_RESUME};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_PASS_DEPTH: u32 = 3;
pub const DEFAULT_ASSIST_TOKENS: u32 = 512;

/// `[pass]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassSettings {
    /// Maximum resumptions per capsule.
    pub max_depth: u32,
    /// Need role -> profile title. Keys match case-insensitively.
    pub resolver_roles: BTreeMap<String, String>,
    pub assist_tokens: u32,
}

impl Default for PassSettings {
    fn default() -> Self {
        let resolver_roles = [
            (ROLE_TRUTH, "Fact Checker"),
            (ROLE_INTELLIGENCE, "Intelligence Analyst"),
            (ROLE_SIMPLIFIER, "Simplifier"),
            (ROLE_STRATEGY, "Chief Strategist"),
        ]
        .into_iter()
        .map(|(role, title)| (role.to_string(), title.to_string()))
        .collect();
        Self {
            max_depth: DEFAULT_MAX_PASS_DEPTH,
            resolver_roles,
            assist_tokens: DEFAULT_ASSIST_TOKENS,
        }
    }
}

/// Round counter for one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassContext {
    pub depth: u32,
    pub max_depth: u32,
}

impl PassContext {
    pub fn new(depth: u32, max_depth: u32) -> Self {
        Self { depth, max_depth }
    }

    pub fn exhausted(&self) -> bool {
        self.depth >= self.max_depth
    }

    /// Advance to the next round and return its depth.
    pub fn advance(&mut self) -> u32 {
        self.depth += 1;
        self.depth
    }
}

pub struct PassBroker {
    executor: Arc<CapsuleExecutor>,
    settings: PassSettings,
}

impl PassBroker {
    pub fn new(executor: Arc<CapsuleExecutor>, settings: PassSettings) -> Self {
        Self { executor, settings }
    }

    pub fn settings(&self) -> &PassSettings {
        &self.settings
    }

    /// Resolve `blocked` for `capsule`. Non-blocked results are returned unchanged.
    pub async fn resolve(&self, capsule: &Capsule, blocked: CapsuleResult, cancel: &CancellationToken) -> CapsuleResult {
        let mut ctx = PassContext::new(capsule.pass_depth(), self.settings.max_depth);
        let mut gathered: Vec<AssistNote> = Vec::new();
        let mut result = blocked;

        loop {
            let request = match (&result.pass_request, result.blocked) {
                (Some(request), true) => request.clone(),
                _ => return result,
            };
            if ctx.exhausted() {
                return self.depth_exceeded(capsule, result, ctx);
            }
            if cancel.is_cancelled() {
                return self.terminal(capsule, result, FailureKind::Cancelled, DispatchError::Cancelled("pass").to_string());
            }

            info!(
                target: "capsule::pass",
                capsule_id = %capsule.id,
                depth = ctx.depth,
                reason = request.reason.as_str(),
                needs = request.needs.len(),
                "Resolving blocked capsule"
            );
            match self.gather(capsule, &request, cancel).await {
                Ok(notes) => gathered.extend(notes),
                Err(e) => {
                    let kind = if e.is_cancelled() { FailureKind::Cancelled } else { FailureKind::Transport };
                    warn!(target: "capsule::pass", capsule_id = %capsule.id, error = %e, "Assist failed");
                    return self.terminal(capsule, result, kind, e.to_string());
                }
            }

            let depth = ctx.advance();
            let resumed = capsule.resumed_with(&gathered, depth);
            self.executor.emit(
                TelemetryEvent::new(EVENT_PASS_RESUME, &capsule.id)
                    .with("depth", depth)
                    .with("assists", gathered.len())
                    .with("goal_len", resumed.goal.len()),
            );
            result = self.executor.execute(&resumed, cancel).await;
        }
    }

    async fn gather(
        &self,
        capsule: &Capsule,
        request: &PassRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<AssistNote>, DispatchError> {
        let context = match &request.critique {
            Some(critique) if !critique.trim().is_empty() => {
                format!("{}\n\nCRITIQUE:\n{}", request.original, critique.trim())
            }
            _ => request.original.clone(),
        };
        let mut notes = Vec::with_capacity(request.needs.len());
        for need in &request.needs {
            let resolver = self.resolver_for(need, cancel).await?;
            let prompt = assist_prompt(&need.role, &need.description, &context);
            match self.executor.assist(&resolver, prompt, self.settings.assist_tokens, cancel).await? {
                AssistOutcome::Answered(text) => {
                    self.executor.emit(
                        TelemetryEvent::new(EVENT_PASS_ASSIST, &capsule.id)
                            .with("role", need.role.as_str())
                            .with("minister", resolver.title.as_str())
                            .with("assist_len", text.len()),
                    );
                    notes.push(AssistNote {
                        role: need.role.clone(),
                        minister: resolver.title.clone(),
                        text,
                    });
                }
                AssistOutcome::Denied(reason) => {
                    warn!(
                        target: "capsule::pass",
                        capsule_id = %capsule.id,
                        role = %need.role,
                        minister = %resolver.title,
                        reason = reason.as_str(),
                        "Assist not admitted; skipping need"
                    );
                }
            }
        }
        Ok(notes)
    }

    /// Fixed role map, then capability tag, then the cabinet's best match, then the
    /// President. Only cancellation is an error.
    pub async fn resolver_for(&self, need: &Need, cancel: &CancellationToken) -> Result<Arc<Profile>, DispatchError> {
        let registry = self.executor.registry();
        let mapped = self
            .settings
            .resolver_roles
            .iter()
            .find(|(role, _)| role.eq_ignore_ascii_case(need.role.trim()))
            .map(|(_, title)| title);
        if let Some(title) = mapped {
            match registry.get_profile(title) {
                Ok(profile) => return Ok(profile),
                Err(e) => warn!(target: "capsule::pass", role = %need.role, error = %e, "Resolver map names an unknown profile"),
            }
        }
        if let Some(profile) = registry.profiles_by_capability(need.role.trim()).into_iter().next() {
            return Ok(profile);
        }
        let issue = format!("{}: {}", need.role, need.description);
        let limit = self.executor.settings().timeouts.embed();
        match bounded("resolver", limit, cancel, self.executor.cabinet().convene(&issue)).await {
            Ok(Ok((profile, confidence))) => {
                debug!(target: "capsule::pass", role = %need.role, minister = %profile.title, confidence, "Resolver chosen by cabinet");
                Ok(profile)
            }
            Ok(Err(e)) => {
                warn!(target: "capsule::pass", role = %need.role, error = %e, "Cabinet unavailable; President resolves the need");
                Ok(registry.default_profile())
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(target: "capsule::pass", role = %need.role, error = %e, "Cabinet timed out; President resolves the need");
                Ok(registry.default_profile())
            }
        }
    }

    fn depth_exceeded(&self, capsule: &Capsule, last: CapsuleResult, ctx: PassContext) -> CapsuleResult {
        warn!(
            target: "capsule::pass",
            capsule_id = %capsule.id,
            depth = ctx.depth,
            max_depth = ctx.max_depth,
            "PASS depth exhausted"
        );
        self.executor.emit(
            TelemetryEvent::new(EVENT_PASS_DEPTH_EXCEEDED, &capsule.id)
                .with("depth", ctx.depth)
                .with("max_depth", ctx.max_depth),
        );
        self.terminal(capsule, last, FailureKind::DepthExceeded, MAX_PASS_DEPTH_EXCEEDED.to_string())
    }

    /// Terminal result keeping the last output and metrics for diagnosis.
    fn terminal(&self, capsule: &Capsule, last: CapsuleResult, kind: FailureKind, error: String) -> CapsuleResult {
        let mut result = CapsuleResult::failed(&capsule.id, kind, error, last.metrics);
        result.output = last.output;
        result
    }
}
