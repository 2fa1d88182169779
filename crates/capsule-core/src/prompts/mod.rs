//! Prompt templates for the audit and assist calls.

pub mod arbiter;
pub mod assist;
pub mod scoring;

pub use arbiter::{arbiter_prompt, ARBITER_CLEAR_MARKER, ARBITER_TEMPLATE};
pub use assist::{assist_prompt, simplify_need_description, ASSIST_TEMPLATE};
pub use scoring::{scoring_prompt, SCORING_TEMPLATE};

/// Substitute `{name}` placeholders in a single left-to-right pass. Inserted values are
/// never rescanned, so caller text containing `{reply}` or similar stays literal.
pub(crate) fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let extra: usize = values.iter().map(|(_, v)| v.len()).sum();
    let mut out = String::with_capacity(template.len() + extra);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let hit = after.find('}').and_then(|close| {
            let name = &after[..close];
            values.iter().find(|(key, _)| *key == name).map(|(_, value)| (close, *value))
        });
        match hit {
            Some((close, value)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_text_is_never_treated_as_a_placeholder() {
        let p = scoring_prompt("echo {reply} back", "4");
        assert!(p.contains("echo {reply} back"));
        assert_eq!(p.matches("\n4\n").count(), 1);

        let p = arbiter_prompt("{marker}?", "say {goal}");
        assert!(p.contains("---\n{marker}?\n---"));
        assert!(p.contains("---\nsay {goal}\n---"));

        let p = assist_prompt("Truth", "check {context}", "2+2=5");
        assert!(p.contains("check {context}"));
    }

    #[test]
    fn unknown_braces_pass_through() {
        assert_eq!(fill("{a} {b} {", &[("a", "1")]), "1 {b} {");
    }
}
