//! Dynamic Token Budgeter.
//!
//! Pure and deterministic: the same prompt, request, snapshot, and hint always yield
//! the same budget. The effective ceiling never exceeds the request unless upscaling is
//! explicitly enabled. Clamping down never goes below the configured minimum, or below
//! the request when the request itself is smaller.

use crate::registry::{CostTable, MetabolicCost};
use crate::traits::ResourceSnapshot;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MIN_TOKENS: u32 = 64;
pub const DEFAULT_CONTEXT_WINDOW: u32 = 8_192;

/// Counts prompt tokens.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> u32;
}

/// `ceil(chars / 4)`, used when no tokenizer is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str) -> u32 {
        let chars = text.chars().count() as u64;
        chars.div_ceil(4).min(u32::MAX as u64) as u32
    }
}

/// Budget knobs, loaded from the `[budget]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetPolicy {
    #[serde(default = "default_min_tokens")]
    pub min_tokens: u32,
    /// Prompt plus output must fit here.
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default)]
    pub allow_upscale: bool,
    /// Multiplier applied to the request when upscaling under abundant resources.
    #[serde(default = "default_upscale_factor")]
    pub upscale_factor: f32,
    /// Resources count as abundant at `floor * abundance_ratio`.
    #[serde(default = "default_abundance_ratio")]
    pub abundance_ratio: f32,
}

fn default_min_tokens() -> u32 {
    DEFAULT_MIN_TOKENS
}
fn default_context_window() -> u32 {
    DEFAULT_CONTEXT_WINDOW
}
fn default_upscale_factor() -> f32 {
    1.5
}
fn default_abundance_ratio() -> f32 {
    2.0
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            min_tokens: DEFAULT_MIN_TOKENS,
            context_window: DEFAULT_CONTEXT_WINDOW,
            allow_upscale: false,
            upscale_factor: default_upscale_factor(),
            abundance_ratio: default_abundance_ratio(),
        }
    }
}

/// Why the budget landed where it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDecision {
    /// Request granted unchanged.
    Granted,
    /// Scaled down because free resource is below the profile floor.
    ClampedByResource,
    /// Scaled down to fit the context window.
    ClampedByContext,
    /// Raised above the request (upscale enabled, resources abundant).
    Upscaled,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetDetails {
    pub prompt_tokens: u32,
    pub requested_tokens: u32,
    pub effective_tokens: u32,
    pub free_resource_mb: u64,
    pub floor_mb: u64,
    pub decision: BudgetDecision,
}

/// Compute the effective output-token ceiling for one call.
pub fn compute_budget(
    prompt: &str,
    requested_tokens: u32,
    snapshot: &ResourceSnapshot,
    profile_hint: MetabolicCost,
    costs: &CostTable,
    policy: &BudgetPolicy,
    counter: &dyn TokenCounter,
) -> (u32, BudgetDetails) {
    let prompt_tokens = counter.count(prompt);
    let free = snapshot.usable_mb();
    let floor = costs.required_mb(profile_hint);
    let min = policy.min_tokens;

    // Floor for any downward clamp; a request below the minimum stays as requested.
    let clamp_floor = min.min(requested_tokens);

    let (mut effective, mut decision) = if free < floor {
        let ratio = if floor == 0 { 1.0 } else { free as f64 / floor as f64 };
        let scaled = (requested_tokens as f64 * ratio).floor() as u32;
        (scaled.clamp(clamp_floor, requested_tokens), BudgetDecision::ClampedByResource)
    } else {
        let abundant = free as f64 >= floor as f64 * policy.abundance_ratio.max(1.0) as f64;
        if policy.allow_upscale && abundant && policy.upscale_factor > 1.0 {
            let raised = (requested_tokens as f64 * policy.upscale_factor as f64).floor();
            (raised.min(u32::MAX as f64) as u32, BudgetDecision::Upscaled)
        } else {
            (requested_tokens, BudgetDecision::Granted)
        }
    };

    let room = policy.context_window.saturating_sub(prompt_tokens);
    if effective > room {
        effective = room.max(clamp_floor).min(effective);
        decision = BudgetDecision::ClampedByContext;
    }

    tracing::debug!(
        target: "capsule::budget",
        prompt_tokens,
        requested_tokens,
        effective,
        free_mb = free,
        floor_mb = floor,
        ?decision,
        "Token budget computed"
    );

    (
        effective,
        BudgetDetails {
            prompt_tokens,
            requested_tokens,
            effective_tokens: effective,
            free_resource_mb: free,
            floor_mb: floor,
            decision,
        },
    )
}
