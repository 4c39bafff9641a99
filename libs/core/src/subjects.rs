//! Canonical NATS subject helpers for realtime delivery.

use std::borrow::Cow;

pub const TOKEN_SUBJECT_PREFIX: &str = "careline.rt.tokens";
pub const EVENT_SUBJECT_PREFIX: &str = "careline.rt.events";

fn norm<S: AsRef<str>>(s: S) -> Cow<'static, str> {
    let mut value = s
        .as_ref()
        .trim()
        .replace([' ', '\t', '\n', '\r', '*', '>', '/'], "-");
    if value.is_empty() {
        value = "unknown".into();
    }
    Cow::Owned(value)
}

pub fn token_subject(env: &str, conversation_id: &str) -> String {
    token_subject_with_prefix(TOKEN_SUBJECT_PREFIX, env, conversation_id)
}

pub fn token_subject_with_prefix(prefix: &str, env: &str, conversation_id: &str) -> String {
    format!("{prefix}.{}.{}", norm(env), norm(conversation_id))
}

pub fn event_subject(env: &str, conversation_id: &str) -> String {
    event_subject_with_prefix(EVENT_SUBJECT_PREFIX, env, conversation_id)
}

pub fn event_subject_with_prefix(prefix: &str, env: &str, conversation_id: &str) -> String {
    format!("{prefix}.{}.{}", norm(env), norm(conversation_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_are_deterministic_and_sanitized() {
        assert_eq!(
            token_subject("dev", "conv-42"),
            "careline.rt.tokens.dev.conv-42"
        );
        assert_eq!(
            event_subject(" dev ", "conv 42"),
            "careline.rt.events.dev.conv-42"
        );
        assert_eq!(
            event_subject("dev", "conv.*>"),
            "careline.rt.events.dev.conv.--"
        );
    }
}
