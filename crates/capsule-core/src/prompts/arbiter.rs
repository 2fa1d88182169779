//! Arbiter contradiction audit run by the President over a candidate answer.

/// Marker the arbiter must emit when it finds nothing wrong.
pub const ARBITER_CLEAR_MARKER: &str = "CLEAR";

/// Placeholders: `{goal}`, `{reply}`, `{marker}`.
pub const ARBITER_TEMPLATE: &str = r#"You are the final arbiter. Examine the ANSWER for internal contradictions, factual impossibilities, or claims that do not follow from the QUESTION.

QUESTION:
---
{goal}
---

ANSWER:
---
{reply}
---

If the answer is sound, reply with exactly: {marker}
Otherwise list each contradiction or impossibility on its own line."#;

pub fn arbiter_prompt(goal: &str, reply: &str) -> String {
    super::fill(
        ARBITER_TEMPLATE,
        &[("goal", goal), ("reply", reply), ("marker", ARBITER_CLEAR_MARKER)],
    )
}
