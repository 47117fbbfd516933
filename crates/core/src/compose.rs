//! Outbound reply composition. Pure: no I/O, no side effects.

/// Channel constraints for outbound replies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComposePolicy {
    /// Maximum reply length in characters (not bytes).
    pub max_chars: usize,
    /// Appended when the reply had to be cut.
    pub truncation_marker: &'static str,
}

impl Default for ComposePolicy {
    fn default() -> Self {
        Self { max_chars: 2000, truncation_marker: "…" }
    }
}

/// Normalize a reply for the outbound channel: drop characters the channel
/// cannot carry (control characters other than newline), normalize CRLF,
/// and truncate on a character boundary.
pub fn compose(text: &str, policy: &ComposePolicy) -> String {
    let mut cleaned = String::with_capacity(text.len());
    for c in text.replace("\r\n", "\n").chars() {
        if c == '\n' || !c.is_control() {
            cleaned.push(c);
        }
    }
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= policy.max_chars {
        return cleaned.to_owned();
    }

    let marker_len = policy.truncation_marker.chars().count();
    let keep = policy.max_chars.saturating_sub(marker_len);
    let mut out: String = cleaned.chars().take(keep).collect();
    out.push_str(policy.truncation_marker);
    out
}

#[cfg(test)]
mod tests {
    use super::{compose, ComposePolicy};

    #[test]
    fn short_replies_pass_through_trimmed() {
        let policy = ComposePolicy::default();
        assert_eq!(compose("  查询结果：42  ", &policy), "查询结果：42");
    }

    #[test]
    fn control_characters_are_stripped_but_newlines_survive() {
        let policy = ComposePolicy::default();
        assert_eq!(compose("第一行\r\n第二行\u{0007}!", &policy), "第一行\n第二行!");
    }

    #[test]
    fn truncation_lands_on_a_char_boundary_and_appends_marker() {
        let policy = ComposePolicy { max_chars: 5, truncation_marker: "…" };
        let out = compose("一二三四五六七八", &policy);
        assert_eq!(out, "一二三四…");
        assert_eq!(out.chars().count(), 5);
    }

    #[test]
    fn exact_fit_is_not_truncated() {
        let policy = ComposePolicy { max_chars: 4, truncation_marker: "…" };
        assert_eq!(compose("一二三四", &policy), "一二三四");
    }
}
