//! Concrete collaborators for `capsule-core`.
//!
//! - [`OpenAiBackend`]: OpenAI-compatible chat completions, or a deterministic mock
//! - [`HashEmbedder`] / [`OpenAiEmbedder`]: cabinet embeddings
//! - [`SysinfoResourceProvider`]: host memory and CPU governor
//! - [`StaticSkillRegistry`]: reflex skills
//! - [`TracingTelemetry`] / [`LedgerTelemetry`]: telemetry sinks

pub mod embeddings;
pub mod ledger;
pub mod openai_backend;
pub mod resources;
pub mod skills;

pub use embeddings::{HashEmbedder, OpenAiEmbedder, DEFAULT_HASH_DIMS};
pub use ledger::{LedgerTelemetry, TracingTelemetry, DEFAULT_LEDGER_CAPACITY};
pub use openai_backend::{LlmMode, OpenAiBackend, ENV_LLM_API_KEY, ENV_LLM_MODE};
pub use resources::{governor_verdict, GovernorSettings, SysinfoResourceProvider};
pub use skills::{ClockSkill, ReflexSkill, StaticSkillRegistry, UuidSkill};
