use crate::tools::scan_markers;

/// Post-response action tags the model can attach to its final text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionTag {
    /// Pin a fact worth keeping; lands in the exchange tags.
    Remember { note: String },
    /// Flag a topic for offline reflection.
    Reflect { topic: String },
    /// Escalate to a human operator; marks the exchange action-required.
    Escalate { reason: String },
}

/// Extract `[REMEMBER ...]`, `[REFLECT ...]` and `[ESCALATE ...]` tags.
/// Unlike tool markers, every occurrence counts.
pub fn parse_action_tags(text: &str) -> Vec<ActionTag> {
    scan_markers(text)
        .into_iter()
        .filter_map(|marker| match marker.name.as_str() {
            "REMEMBER" => marker.arg("note").map(|note| ActionTag::Remember {
                note: note.to_string(),
            }),
            "REFLECT" => marker.arg("topic").map(|topic| ActionTag::Reflect {
                topic: topic.to_string(),
            }),
            "ESCALATE" => marker.arg("reason").map(|reason| ActionTag::Escalate {
                reason: reason.to_string(),
            }),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_three_kinds() {
        let text = r#"Done. [REMEMBER note="prefers indigo"] [REFLECT topic="color prefs"]
            [ESCALATE reason="billing dispute"]"#;
        let tags = parse_action_tags(text);
        assert_eq!(tags.len(), 3);
        assert_eq!(
            tags[0],
            ActionTag::Remember {
                note: "prefers indigo".into()
            }
        );
        assert_eq!(
            tags[2],
            ActionTag::Escalate {
                reason: "billing dispute".into()
            }
        );
    }

    #[test]
    fn repeated_tags_all_count() {
        let text = r#"[REMEMBER note="a"] and [REMEMBER note="b"]"#;
        assert_eq!(parse_action_tags(text).len(), 2);
    }

    #[test]
    fn tool_markers_are_not_actions() {
        let text = r#"[GREP term="x"] [REMEMBER note="keep"]"#;
        let tags = parse_action_tags(text);
        assert_eq!(tags.len(), 1);
        assert!(matches!(tags[0], ActionTag::Remember { .. }));
    }

    #[test]
    fn tags_with_wrong_arguments_are_ignored() {
        assert!(parse_action_tags(r#"[REMEMBER reason="wrong key"]"#).is_empty());
    }
}
