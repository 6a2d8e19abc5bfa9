use serde_json::Value;

/// Bare completion sentinel some backends emit instead of `{"done": true}`.
pub const DONE_SENTINEL: &str = "[DONE]";

const PAYLOAD_PREVIEW_CHARS: usize = 100;

/// Meaning of one frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpreted {
    Delta(String),
    Completion,
    Failure(String),
    /// Well-formed, but carries nothing for the message.
    Ignored,
    Unparseable,
}

/// Interprets a `data:` payload. `error` wins over `done`, which wins over `content`.
pub fn interpret(payload: &str) -> Interpreted {
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return Interpreted::Completion;
    }

    let value = match serde_json::from_str::<Value>(payload) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(
                error = %error,
                payload = %preview(payload),
                "dropping unparseable stream payload"
            );
            return Interpreted::Unparseable;
        }
    };

    let Value::Object(fields) = value else {
        tracing::warn!(payload = %preview(payload), "stream payload is not a JSON object");
        return Interpreted::Unparseable;
    };

    if let Some(error) = fields.get("error").filter(|error| !error.is_null()) {
        let message = match error {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        return Interpreted::Failure(message);
    }

    if fields.get("done").and_then(Value::as_bool) == Some(true) {
        return Interpreted::Completion;
    }

    match fields.get("content").and_then(Value::as_str) {
        Some(text) if !text.is_empty() => Interpreted::Delta(text.to_string()),
        _ => Interpreted::Ignored,
    }
}

pub(crate) fn preview(payload: &str) -> String {
    payload.chars().take(PAYLOAD_PREVIEW_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_becomes_delta() {
        assert_eq!(
            interpret(r#"{"content":"Hel"}"#),
            Interpreted::Delta("Hel".to_string())
        );
        assert_eq!(
            interpret(r#"{"content":"lo","done":false}"#),
            Interpreted::Delta("lo".to_string())
        );
    }

    #[test]
    fn completion_markers() {
        assert_eq!(interpret(r#"{"done":true}"#), Interpreted::Completion);
        assert_eq!(interpret("[DONE]"), Interpreted::Completion);
        assert_eq!(interpret("  [DONE] "), Interpreted::Completion);
    }

    #[test]
    fn error_outranks_done_and_content() {
        assert_eq!(
            interpret(r#"{"error":"quota exceeded","done":true,"content":"x"}"#),
            Interpreted::Failure("quota exceeded".to_string())
        );
        assert_eq!(
            interpret(r#"{"done":true,"content":"x"}"#),
            Interpreted::Completion
        );
    }

    #[test]
    fn structured_error_is_rendered_as_json() {
        assert_eq!(
            interpret(r#"{"error":{"code":500}}"#),
            Interpreted::Failure(r#"{"code":500}"#.to_string())
        );
        assert_eq!(interpret(r#"{"error":null,"content":"a"}"#), Interpreted::Delta("a".to_string()));
    }

    #[test]
    fn empty_or_unknown_objects_are_ignored() {
        assert_eq!(interpret(r#"{"content":""}"#), Interpreted::Ignored);
        assert_eq!(interpret(r#"{"done":false}"#), Interpreted::Ignored);
        assert_eq!(interpret(r#"{"usage":{"tokens":3}}"#), Interpreted::Ignored);
    }

    #[test]
    fn malformed_payloads_are_unparseable() {
        assert_eq!(interpret(r#"{"content":"He"#), Interpreted::Unparseable);
        assert_eq!(interpret("hello"), Interpreted::Unparseable);
        assert_eq!(interpret("[1,2]"), Interpreted::Unparseable);
    }
}
