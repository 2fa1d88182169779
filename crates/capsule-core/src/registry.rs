//! Backend Registry: static catalog of callable model profiles.
//!
//! Built once from the configured table and never mutated. Exactly one profile is the
//! President; every other profile is a Minister.

use crate::error::RegistryError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Discrete resource-cost class of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetabolicCost {
    Micro,
    Low,
    Medium,
    High,
    Extreme,
}

impl MetabolicCost {
    pub const ALL: [MetabolicCost; 5] = [Self::Micro, Self::Low, Self::Medium, Self::High, Self::Extreme];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Micro => "micro",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Extreme => "extreme",
        }
    }
}

/// Fixed lookup table from cost class to an approximate memory footprint (MB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostTable {
    #[serde(default = "default_micro_mb")]
    pub micro_mb: u64,
    #[serde(default = "default_low_mb")]
    pub low_mb: u64,
    #[serde(default = "default_medium_mb")]
    pub medium_mb: u64,
    #[serde(default = "default_high_mb")]
    pub high_mb: u64,
    #[serde(default = "default_extreme_mb")]
    pub extreme_mb: u64,
}

fn default_micro_mb() -> u64 {
    1_500
}
fn default_low_mb() -> u64 {
    4_700
}
fn default_medium_mb() -> u64 {
    8_000
}
fn default_high_mb() -> u64 {
    16_000
}
fn default_extreme_mb() -> u64 {
    40_000
}

impl Default for CostTable {
    fn default() -> Self {
        Self {
            micro_mb: default_micro_mb(),
            low_mb: default_low_mb(),
            medium_mb: default_medium_mb(),
            high_mb: default_high_mb(),
            extreme_mb: default_extreme_mb(),
        }
    }
}

impl CostTable {
    pub fn required_mb(&self, cost: MetabolicCost) -> u64 {
        match cost {
            MetabolicCost::Micro => self.micro_mb,
            MetabolicCost::Low => self.low_mb,
            MetabolicCost::Medium => self.medium_mb,
            MetabolicCost::High => self.high_mb,
            MetabolicCost::Extreme => self.extreme_mb,
        }
    }
}

/// One callable model endpoint ("Minister", or the President).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Human-readable role name, the only identity surfaced to callers.
    pub title: String,
    /// Opaque identifier handed to the backend call.
    pub backend_id: String,
    #[serde(default)]
    pub role_description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub metabolic_cost: MetabolicCost,
    #[serde(default)]
    pub president: bool,
}

impl Profile {
    pub fn new(
        title: impl Into<String>,
        backend_id: impl Into<String>,
        metabolic_cost: MetabolicCost,
    ) -> Self {
        Self {
            title: title.into(),
            backend_id: backend_id.into(),
            role_description: String::new(),
            capabilities: Vec::new(),
            metabolic_cost,
            president: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.role_description = description.into();
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn as_president(mut self) -> Self {
        self.president = true;
        self
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(tag))
    }

    /// Text the cabinet embeds: title + description + capabilities.
    pub fn embedding_text(&self) -> String {
        format!(
            "{}. {}. Capabilities: {}",
            self.title,
            self.role_description,
            self.capabilities.join(", ")
        )
    }
}

/// Read-only profile catalog. Iteration order is registration order.
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    profiles: Vec<Arc<Profile>>,
    president: usize,
}

impl BackendRegistry {
    /// Build from a static table. Titles must be unique and exactly one profile must be
    /// flagged `president`.
    pub fn new(profiles: Vec<Profile>) -> Result<Self, RegistryError> {
        let mut president: Option<usize> = None;
        for (i, p) in profiles.iter().enumerate() {
            if profiles[..i].iter().any(|q| q.title.eq_ignore_ascii_case(&p.title)) {
                return Err(RegistryError::Duplicate(p.title.clone()));
            }
            if p.president {
                if let Some(prev) = president {
                    return Err(RegistryError::MultiplePresidents(
                        profiles[prev].title.clone(),
                        p.title.clone(),
                    ));
                }
                president = Some(i);
            }
        }
        let president = president.ok_or(RegistryError::MissingPresident)?;
        Ok(Self {
            profiles: profiles.into_iter().map(Arc::new).collect(),
            president,
        })
    }

    /// Lookup by title (case-insensitive). Never substitutes a fallback.
    pub fn get_profile(&self, name: &str) -> Result<Arc<Profile>, RegistryError> {
        self.profiles
            .iter()
            .find(|p| p.title.eq_ignore_ascii_case(name.trim()))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// All profiles carrying `tag`, in registration order.
    pub fn profiles_by_capability(&self, tag: &str) -> Vec<Arc<Profile>> {
        self.profiles
            .iter()
            .filter(|p| p.has_capability(tag))
            .cloned()
            .collect()
    }

    /// The President.
    pub fn default_profile(&self) -> Arc<Profile> {
        Arc::clone(&self.profiles[self.president])
    }

    /// Every non-President profile, in registration order.
    pub fn ministers(&self) -> impl Iterator<Item = &Arc<Profile>> {
        self.profiles.iter().filter(|p| !p.president)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Profile>> {
        self.profiles.iter()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Distinct backend ids, in first-seen order.
    pub fn backend_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for p in &self.profiles {
            if !ids.contains(&p.backend_id) {
                ids.push(p.backend_id.clone());
            }
        }
        ids
    }
}
