//! Engine configuration: TOML file + `CAPSULE__*` environment overrides.
//!
//! Precedence: environment > file named by `CAPSULE_CONFIG` (default
//! `config/capsule.toml`, skipped when absent) > built-in defaults. A `.env` file is
//! read first when present.

use crate::budget::BudgetPolicy;
use crate::cabinet::CabinetSettings;
use crate::error::{ConfigError, ConfigResult};
use crate::executor::{AuditSettings, ExecutorSettings, SamplingSettings, TimeoutSettings};
use crate::load_balancer::NodeSpec;
use crate::pass_broker::PassSettings;
use crate::registry::{BackendRegistry, CostTable, MetabolicCost, Profile};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

pub const CONFIG_PATH_ENV: &str = "CAPSULE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/capsule.toml";
pub const ENV_PREFIX: &str = "CAPSULE";

const LOCAL_ENDPOINT: &str = "http://localhost:11434/v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cabinet: CabinetSettings,
    pub audit: AuditSettings,
    pub pass: PassSettings,
    pub budget: BudgetPolicy,
    pub timeouts: TimeoutSettings,
    pub sampling: SamplingSettings,
    pub cost_table: CostTable,
    pub profiles: Vec<Profile>,
    pub nodes: Vec<NodeSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let profiles = default_government();
        let nodes = profiles
            .iter()
            .map(|p| NodeSpec::new(format!("local-{}", p.backend_id), p.backend_id.as_str(), LOCAL_ENDPOINT, 48_000))
            .collect();
        Self {
            cabinet: CabinetSettings::default(),
            audit: AuditSettings::default(),
            pass: PassSettings::default(),
            budget: BudgetPolicy::default(),
            timeouts: TimeoutSettings::default(),
            sampling: SamplingSettings::default(),
            cost_table: CostTable::default(),
            profiles,
            nodes,
        }
    }
}

/// President plus the standard Ministers.
fn default_government() -> Vec<Profile> {
    vec![
        Profile::new("President", "llama3.1:8b", MetabolicCost::Low)
            .with_description("Generalist head of government; final arbiter and fallback for every issue")
            .with_capabilities(["general", "arbiter"])
            .as_president(),
        Profile::new("Chief Strategist", "qwen2.5:32b", MetabolicCost::High)
            .with_description("Long-horizon planning, trade-offs, and decision strategy")
            .with_capabilities(["strategy", "planning", "decision"]),
        Profile::new("Fact Checker", "mistral:7b", MetabolicCost::Low)
            .with_description("Verifies claims, arithmetic, and factual consistency")
            .with_capabilities(["truth", "verification", "fact-check"]),
        Profile::new("Intelligence Analyst", "qwen2.5:14b", MetabolicCost::Medium)
            .with_description("Research, evidence gathering, and analysis of missing context")
            .with_capabilities(["intelligence", "research", "analysis"]),
        Profile::new("Minister of Code", "qwen2.5-coder:14b", MetabolicCost::Medium)
            .with_description("Writes, reviews, and debugs source code")
            .with_capabilities(["code", "programming", "debugging"]),
        Profile::new("Minister of Culture", "mistral-nemo:12b", MetabolicCost::Medium)
            .with_description("Creative writing, poetry, and storytelling")
            .with_capabilities(["creative", "writing", "poetry"]),
        Profile::new("Simplifier", "phi3:mini", MetabolicCost::Micro)
            .with_description("Restates requests and answers in simpler, shorter form")
            .with_capabilities(["simplification", "summary"]),
    ]
}

impl EngineConfig {
    /// Load `.env`, the config file, and `CAPSULE__SECTION__KEY` overrides, then validate.
    pub fn load() -> ConfigResult<Self> {
        let _ = dotenvy::dotenv();
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let builder = config::Config::builder();

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            tracing::debug!(target: "capsule::config", path = %config_path, "No config file; using defaults");
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: EngineConfig = built.try_deserialize()?;
        cfg.validate()?;
        tracing::info!(
            target: "capsule::config",
            profiles = cfg.profiles.len(),
            nodes = cfg.nodes.len(),
            max_depth = cfg.pass.max_depth,
            "Engine config loaded"
        );
        Ok(cfg)
    }

    /// Parse and validate a TOML document. Missing sections take their defaults.
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        let cfg: EngineConfig = toml::from_str(source)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// The Backend Registry described by `profiles`.
    pub fn registry(&self) -> ConfigResult<BackendRegistry> {
        Ok(BackendRegistry::new(self.profiles.clone())?)
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            audit: self.audit.clone(),
            sampling: self.sampling,
            timeouts: self.timeouts,
            budget: self.budget,
            cost_table: self.cost_table,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let registry = self.registry()?;

        unit_interval("cabinet.confidence_threshold", self.cabinet.confidence_threshold)?;
        unit_interval("audit.output_confidence_threshold", self.audit.output_confidence_threshold)?;
        if self.audit.clear_marker.trim().is_empty() {
            return Err(invalid("audit.clear_marker must not be empty"));
        }
        if let Some(scorer) = &self.audit.scorer {
            registry.get_profile(scorer)?;
        }
        if self.pass.max_depth == 0 {
            return Err(invalid("pass.max_depth must be at least 1"));
        }
        for (role, title) in &self.pass.resolver_roles {
            if registry.get_profile(title).is_err() {
                tracing::warn!(
                    target: "capsule::config",
                    role = %role,
                    profile = %title,
                    "Resolver role names an unknown profile; capability and cabinet matching will be used"
                );
            }
        }
        if self.budget.min_tokens > self.budget.context_window {
            return Err(invalid(format!(
                "budget.min_tokens ({}) exceeds budget.context_window ({})",
                self.budget.min_tokens, self.budget.context_window
            )));
        }
        for (name, t) in [
            ("sampling.strict_temperature", self.sampling.strict_temperature),
            ("sampling.relaxed_temperature", self.sampling.relaxed_temperature),
        ] {
            if !t.is_finite() || t < 0.0 {
                return Err(invalid(format!("{} must be a non-negative number", name)));
            }
        }

        let backends: HashSet<String> = registry.backend_ids().into_iter().collect();
        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(node.node_id.as_str()) {
                return Err(invalid(format!("duplicate node id {}", node.node_id)));
            }
            if !backends.contains(&node.backend_id) {
                return Err(invalid(format!(
                    "node {} serves unknown backend {}",
                    node.node_id, node.backend_id
                )));
            }
        }
        for backend in &backends {
            if !self.nodes.iter().any(|n| &n.backend_id == backend) {
                return Err(invalid(format!("backend {} has no nodes", backend)));
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

fn unit_interval(name: &str, value: f32) -> ConfigResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{} must be within [0, 1], got {}", name, value)))
    }
}
