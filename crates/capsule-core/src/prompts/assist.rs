//! Assist requests the PASS broker sends to resolver profiles.

/// Placeholders: `{role}`, `{need}`, `{context}`.
pub const ASSIST_TEMPLATE: &str = r#"You are assisting as {role}. Another minister's work was blocked and needs your help.

WHAT IS NEEDED:
{need}

CONTEXT (the text that was blocked):
---
{context}
---

Provide only the information requested, concisely. Do not restate the context."#;

pub fn assist_prompt(role: &str, need: &str, context: &str) -> String {
    super::fill(ASSIST_TEMPLATE, &[("role", role), ("need", need), ("context", context)])
}

/// Need description attached to a `resource_downgrade` block.
pub fn simplify_need_description() -> &'static str {
    "Restate the goal as a simpler, smaller request that a lightweight model can answer, keeping its essential intent."
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::{arbiter_prompt, scoring_prompt, ARBITER_CLEAR_MARKER};

    #[test]
    fn templates_fill_every_placeholder() {
        for p in [
            assist_prompt("Truth", "verify", "2+2=5"),
            scoring_prompt("2+2", "4"),
            arbiter_prompt("2+2", "4"),
        ] {
            assert!(!p.contains('{'), "unfilled placeholder in: {}", p);
        }
        assert!(arbiter_prompt("q", "a").contains(ARBITER_CLEAR_MARKER));
    }
}
