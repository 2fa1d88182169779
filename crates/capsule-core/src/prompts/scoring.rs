//! Output-confidence scoring: asks a cheap scorer how well a reply satisfies the goal.

/// Placeholders: `{goal}`, `{reply}`.
pub const SCORING_TEMPLATE: &str = r#"You are a strict grader. Rate how correctly and completely the REPLY satisfies the GOAL.

GOAL:
---
{goal}
---

REPLY:
---
{reply}
---

Respond with a single decimal number between 0 and 1 (for example 0.85) and nothing else."#;

pub fn scoring_prompt(goal: &str, reply: &str) -> String {
    super::fill(SCORING_TEMPLATE, &[("goal", goal), ("reply", reply)])
}
