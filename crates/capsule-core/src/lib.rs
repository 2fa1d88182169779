//! Capsule dispatch and governance engine.
//!
//! A capsule is routed by the [`Cabinet`] to a Minister profile, admitted by the
//! [`LoadBalancer`] against live resource headroom, dispatched with a
//! [`compute_budget`]-sized token ceiling, and audited for confidence and
//! contradictions by the [`CapsuleExecutor`]. Blocked results are resolved by the
//! [`PassBroker`], which gathers assists from other profiles and resumes the capsule
//! within a bounded number of rounds.

pub mod budget;
pub mod cabinet;
pub mod capsule;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod load_balancer;
pub mod pass_broker;
pub mod prompts;
pub mod registry;
pub mod telemetry;
pub mod traits;

pub use budget::{
    compute_budget, BudgetDecision, BudgetDetails, BudgetPolicy, HeuristicTokenCounter, TokenCounter,
    DEFAULT_CONTEXT_WINDOW, DEFAULT_MIN_TOKENS,
};
pub use cabinet::{Cabinet, CabinetSettings, TaggedEmbedding, DEFAULT_DELEGATION_THRESHOLD};
pub use capsule::{
    AssistNote, Capsule, CapsuleKind, CapsuleMetrics, CapsuleOutput, CapsuleResult, FailureKind, Need, PassReason,
    PassRequest, ASSIST_CONTEXT_HEADER, MAX_PASS_DEPTH_EXCEEDED, PAYLOAD_SKILL_ID, ROLE_INTELLIGENCE,
    ROLE_SIMPLIFIER, ROLE_STRATEGY, ROLE_TRUTH, TRACE_ARBITER, TRACE_PASS_DEPTH,
};
pub use config::{EngineConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
pub use engine::Engine;
pub use error::{BackendError, CabinetError, ConfigError, ConfigResult, DispatchError, EngineError, RegistryError};
pub use executor::{
    critique_is_clear, parse_confidence, AssistOutcome, AuditSettings, CapsuleExecutor, Collaborators,
    ExecutionState, ExecutorSettings, SamplingSettings, TimeoutSettings, DEFAULT_CONFIDENCE_ON_PARSE_FAILURE,
    DEFAULT_OUTPUT_CONFIDENCE_THRESHOLD,
};
pub use load_balancer::{
    AdmissionDecision, AdmissionPermit, DenialReason, LoadBalancer, NodeLoad, NodeRef, NodeRole, NodeSpec,
};
pub use pass_broker::{PassBroker, PassContext, PassSettings, DEFAULT_MAX_PASS_DEPTH};
pub use registry::{BackendRegistry, CostTable, MetabolicCost, Profile};
pub use telemetry::TelemetryEvent;
pub use traits::{
    Embedder, FixedResourceProvider, InferenceBackend, InvokeRequest, NullSkillRegistry, NullTelemetry,
    ResourceProvider, ResourceSnapshot, SkillOutcome, SkillRegistry, TelemetrySink,
};
