//! Collaborator seams: inference backend, embedder, resource telemetry, skill registry,
//! and telemetry sink.
//!
//! Optional collaborators have a null-object implementation here so the engine never
//! branches on "is this subsystem present".

use crate::error::BackendError;
use crate::load_balancer::NodeRef;
use crate::telemetry::TelemetryEvent;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One prompt round-trip handed to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequest {
    pub backend_id: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Upper bound the caller enforces; transports may use it for their own deadline.
    pub timeout: Duration,
}

/// Executes prompts on a physical node.
#[async_trait::async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn invoke(&self, node: &NodeRef, request: &InvokeRequest) -> Result<String, BackendError>;

    /// Liveness probe. Callers bound it with their own timeout.
    async fn health(&self, node: &NodeRef) -> bool;
}

/// Computes fixed-length, unit-normalized text embeddings.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Model/version tag. Vectors from different versions are never compared.
    fn version(&self) -> String;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError>;
}

/// System-wide resource verdict from the hardware governor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub free_resource_mb: u64,
    pub is_safe: bool,
    /// 1.0 = unthrottled; lower values shrink usable headroom.
    pub throttle_factor: f32,
}

impl ResourceSnapshot {
    pub fn new(free_resource_mb: u64, is_safe: bool, throttle_factor: f32) -> Self {
        Self {
            free_resource_mb,
            is_safe,
            throttle_factor,
        }
    }

    pub fn safe(free_resource_mb: u64) -> Self {
        Self::new(free_resource_mb, true, 1.0)
    }

    /// Free memory scaled by the throttle factor (clamped to [0, 1]).
    pub fn usable_mb(&self) -> u64 {
        let factor = if self.throttle_factor.is_finite() {
            self.throttle_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };
        (self.free_resource_mb as f64 * factor as f64).floor() as u64
    }
}

#[async_trait::async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn snapshot(&self) -> ResourceSnapshot;
}

/// Provider returning a constant snapshot. Used when no hardware governor is wired in.
#[derive(Debug, Clone, Copy)]
pub struct FixedResourceProvider(pub ResourceSnapshot);

#[async_trait::async_trait]
impl ResourceProvider for FixedResourceProvider {
    async fn snapshot(&self) -> ResourceSnapshot {
        self.0
    }
}

/// Result of a skill execution on the reflex path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillOutcome {
    pub success: bool,
    pub output: serde_json::Value,
}

impl SkillOutcome {
    pub fn ok(output: serde_json::Value) -> Self {
        Self { success: true, output }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::json!({ "error": reason.into() }),
        }
    }
}

/// Capability/skill execution registry consulted before model dispatch.
#[async_trait::async_trait]
pub trait SkillRegistry: Send + Sync {
    fn has(&self, id: &str) -> bool;

    /// Cheap semantic lookup of a skill id for free-text goals.
    fn lookup(&self, _goal: &str) -> Option<String> {
        None
    }

    async fn execute(&self, id: &str, payload: Option<&serde_json::Value>) -> SkillOutcome;
}

/// Registry with no skills: the reflex path never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSkillRegistry;

#[async_trait::async_trait]
impl SkillRegistry for NullSkillRegistry {
    fn has(&self, _id: &str) -> bool {
        false
    }

    async fn execute(&self, id: &str, _payload: Option<&serde_json::Value>) -> SkillOutcome {
        SkillOutcome::failed(format!("no skill registry: {}", id))
    }
}

/// Append-only observability sink. Must never block or fail the caller.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn emit(&self, _event: TelemetryEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_mb_applies_throttle() {
        assert_eq!(ResourceSnapshot::new(10_000, true, 0.5).usable_mb(), 5_000);
        assert_eq!(ResourceSnapshot::new(10_000, true, 3.0).usable_mb(), 10_000);
        assert_eq!(ResourceSnapshot::new(10_000, true, f32::NAN).usable_mb(), 0);
    }

    #[tokio::test]
    async fn null_skill_registry_never_matches() {
        let reg = NullSkillRegistry;
        assert!(!reg.has("anything"));
        assert_eq!(reg.lookup("what time is it"), None);
        assert!(!reg.execute("anything", None).await.success);
    }
}
