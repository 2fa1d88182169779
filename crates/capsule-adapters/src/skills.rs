//! Reflex skills: cheap deterministic handlers consulted before any model dispatch.

use capsule_core::{SkillOutcome, SkillRegistry};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

#[async_trait::async_trait]
pub trait ReflexSkill: Send + Sync {
    /// Unique skill identifier
    fn name(&self) -> &str;

    /// Human-readable description
    fn description(&self) -> &str;

    /// Words that route a free-text goal to this skill. Defaults to the longer words of
    /// the description.
    fn keywords(&self) -> Vec<String> {
        words(self.description()).into_iter().filter(|w| w.len() >= 4).collect()
    }

    async fn execute(&self, params: Value) -> Result<Value, String>;
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Current UTC time.
pub struct ClockSkill;

#[async_trait::async_trait]
impl ReflexSkill for ClockSkill {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Current date and time in UTC"
    }

    fn keywords(&self) -> Vec<String> {
        ["time", "clock", "date", "today"].into_iter().map(String::from).collect()
    }

    async fn execute(&self, _params: Value) -> Result<Value, String> {
        let now = chrono::Utc::now();
        Ok(json!({
            "utc": now.to_rfc3339(),
            "unix_ms": now.timestamp_millis(),
        }))
    }
}

/// Fresh v4 identifiers; `count` in the payload asks for several (max 32).
pub struct UuidSkill;

#[async_trait::async_trait]
impl ReflexSkill for UuidSkill {
    fn name(&self) -> &str {
        "uuid"
    }

    fn description(&self) -> &str {
        "Generate random UUID identifiers"
    }

    fn keywords(&self) -> Vec<String> {
        ["uuid", "uuids", "guid", "identifier"].into_iter().map(String::from).collect()
    }

    async fn execute(&self, params: Value) -> Result<Value, String> {
        let count = match params.get("count") {
            None => 1,
            Some(v) => v
                .as_u64()
                .filter(|n| (1..=32).contains(n))
                .ok_or("'count' must be an integer between 1 and 32")?,
        };
        let ids: Vec<String> = (0..count).map(|_| uuid::Uuid::new_v4().to_string()).collect();
        Ok(json!({ "uuids": ids }))
    }
}

/// Named reflex skills with keyword lookup for free-text goals.
pub struct StaticSkillRegistry {
    skills: Vec<Arc<dyn ReflexSkill>>,
    min_overlap: usize,
}

impl StaticSkillRegistry {
    pub fn new() -> Self {
        Self {
            skills: Vec::new(),
            min_overlap: 1,
        }
    }

    /// Minimum number of shared keywords before a goal routes to a skill.
    pub fn with_min_overlap(mut self, min_overlap: usize) -> Self {
        self.min_overlap = min_overlap.max(1);
        self
    }

    pub fn register(&mut self, skill: Arc<dyn ReflexSkill>) {
        if self.get(skill.name()).is_some() {
            tracing::warn!(target: "capsule::adapters::skills", skill = skill.name(), "Replacing registered skill");
            self.skills.retain(|s| s.name() != skill.name());
        }
        self.skills.push(skill);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ReflexSkill>> {
        self.skills.iter().find(|s| s.name() == name).cloned()
    }

    pub fn list_skills(&self) -> Vec<(String, String)> {
        self.skills
            .iter()
            .map(|s| (s.name().to_string(), s.description().to_string()))
            .collect()
    }
}

impl Default for StaticSkillRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ClockSkill));
        registry.register(Arc::new(UuidSkill));
        registry
    }
}

#[async_trait::async_trait]
impl SkillRegistry for StaticSkillRegistry {
    fn has(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    fn lookup(&self, goal: &str) -> Option<String> {
        let goal_words: HashSet<String> = words(goal).into_iter().collect();
        let mut best: Option<(usize, &Arc<dyn ReflexSkill>)> = None;
        for skill in &self.skills {
            let overlap = skill.keywords().iter().filter(|k| goal_words.contains(k.as_str())).count();
            if overlap >= self.min_overlap && best.map_or(true, |(n, _)| overlap > n) {
                best = Some((overlap, skill));
            }
        }
        best.map(|(_, skill)| skill.name().to_string())
    }

    async fn execute(&self, id: &str, payload: Option<&Value>) -> SkillOutcome {
        let Some(skill) = self.get(id) else {
            return SkillOutcome::failed(format!("unknown skill: {}", id));
        };
        let params = payload.cloned().unwrap_or(Value::Null);
        match skill.execute(params).await {
            Ok(output) => SkillOutcome::ok(output),
            Err(e) => {
                tracing::warn!(target: "capsule::adapters::skills", skill = id, error = %e, "Skill failed");
                SkillOutcome::failed(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_matches_keywords() {
        let reg = StaticSkillRegistry::default();
        assert_eq!(reg.lookup("What time is it?").as_deref(), Some("clock"));
        assert_eq!(reg.lookup("give me a UUID").as_deref(), Some("uuid"));
        assert_eq!(reg.lookup("write a poem about rivers"), None);
    }

    #[test]
    fn min_overlap_tightens_lookup() {
        let reg = StaticSkillRegistry::default().with_min_overlap(2);
        assert_eq!(reg.lookup("what time is it"), None);
        assert_eq!(reg.lookup("today's date and time").as_deref(), Some("clock"));
    }

    #[tokio::test]
    async fn uuid_skill_validates_count() {
        let reg = StaticSkillRegistry::default();
        let ok = reg.execute("uuid", Some(&json!({ "count": 3 }))).await;
        assert!(ok.success);
        assert_eq!(ok.output["uuids"].as_array().unwrap().len(), 3);

        let bad = reg.execute("uuid", Some(&json!({ "count": 0 }))).await;
        assert!(!bad.success);
        assert!(!reg.execute("missing", None).await.success);
    }

    #[test]
    fn default_keywords_come_from_description() {
        struct Echo;
        #[async_trait::async_trait]
        impl ReflexSkill for Echo {
            fn name(&self) -> &str {
                "echo"
            }
            fn description(&self) -> &str {
                "Repeat the given text back"
            }
            async fn execute(&self, params: Value) -> Result<Value, String> {
                Ok(params)
            }
        }
        assert_eq!(Echo.keywords(), vec!["repeat", "given", "text", "back"]);
    }
}
