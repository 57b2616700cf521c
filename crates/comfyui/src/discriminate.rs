//! Two-schema response decoding for write endpoints.
//!
//! The server answers a submission with either a success payload or a
//! structured rejection, sometimes with a non-2xx status and sometimes
//! without. [`discriminate`] decides by whole-payload decode: schema A
//! first, then schema B, and if neither fits the body is malformed.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

/// Outcome of [`discriminate`].
#[derive(Debug)]
pub enum Discriminated<T, E> {
    /// The body decoded as the success schema.
    Accepted(T),
    /// The body decoded as the rejection schema.
    Rejected(E),
    /// Neither schema fit. Carries the success-schema error and raw body.
    Malformed {
        source: serde_json::Error,
        body: String,
    },
}

/// Decode `body` as `T`, falling back to `E`.
pub fn discriminate<T, E>(body: &[u8]) -> Discriminated<T, E>
where
    T: DeserializeOwned,
    E: DeserializeOwned,
{
    match serde_json::from_slice::<T>(body) {
        Ok(accepted) => Discriminated::Accepted(accepted),
        Err(source) => match serde_json::from_slice::<E>(body) {
            Ok(rejected) => Discriminated::Rejected(rejected),
            Err(_) => Discriminated::Malformed {
                source,
                body: String::from_utf8_lossy(body).into_owned(),
            },
        },
    }
}

// ---------------------------------------------------------------------------
// POST /prompt schemas
// ---------------------------------------------------------------------------

/// Success payload of `POST /prompt`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    #[serde(deserialize_with = "non_empty")]
    pub prompt_id: String,
    /// Position in the execution queue.
    pub number: i64,
    /// Per-node validation warnings the server accepted the prompt with.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// Rejection payload of `POST /prompt`.
///
/// ```json
/// {"error": {"type": "prompt_no_outputs", "message": "Prompt has no outputs",
///            "details": "", "extra_info": {}},
///  "node_errors": []}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct PromptError {
    pub error: RejectionReason,
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// The `error` member of a rejection. Older servers send a bare string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RejectionReason {
    Structured(PromptErrorDetail),
    Plain(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub extra_info: serde_json::Value,
}

impl PromptError {
    pub fn kind(&self) -> &str {
        match &self.error {
            RejectionReason::Structured(detail) => &detail.kind,
            RejectionReason::Plain(_) => "",
        }
    }

    pub fn message(&self) -> &str {
        match &self.error {
            RejectionReason::Structured(detail) => &detail.message,
            RejectionReason::Plain(message) => message,
        }
    }
}

fn non_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    if value.is_empty() {
        return Err(serde::de::Error::custom("prompt_id must not be empty"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    type Submit = Discriminated<SubmitResponse, PromptError>;

    #[test]
    fn accepts_success_payload() {
        let body = br#"{"prompt_id":"abc","number":4,"node_errors":{}}"#;
        let decided: Submit = discriminate(body);
        assert_matches!(decided, Discriminated::Accepted(r) if r.prompt_id == "abc" && r.number == 4);
    }

    #[test]
    fn rejects_structured_error() {
        let body = br#"{"error":{"type":"prompt_no_outputs","message":"Prompt has no outputs"}}"#;
        let decided: Submit = discriminate(body);
        let rejection = assert_matches!(decided, Discriminated::Rejected(e) => e);
        assert_eq!(rejection.kind(), "prompt_no_outputs");
        assert_eq!(rejection.message(), "Prompt has no outputs");
        assert!(rejection.node_errors.is_null());
    }

    #[test]
    fn rejects_plain_string_error() {
        let body = br#"{"error":"no prompt","node_errors":[]}"#;
        let decided: Submit = discriminate(body);
        let rejection = assert_matches!(decided, Discriminated::Rejected(e) => e);
        assert_eq!(rejection.message(), "no prompt");
        assert_eq!(rejection.kind(), "");
    }

    #[test]
    fn keeps_node_errors() {
        let body = br#"{"error":{"type":"prompt_outputs_failed_validation","message":"Prompt outputs failed validation","details":"","extra_info":{}},"node_errors":{"3":{"errors":[],"class_type":"KSampler"}}}"#;
        let decided: Submit = discriminate(body);
        let rejection = assert_matches!(decided, Discriminated::Rejected(e) => e);
        assert_eq!(rejection.node_errors["3"]["class_type"], "KSampler");
    }

    #[test]
    fn malformed_when_neither_schema_fits() {
        let decided: Submit = discriminate(b"not json");
        let body = assert_matches!(decided, Discriminated::Malformed { body, .. } => body);
        assert_eq!(body, "not json");

        let decided: Submit = discriminate(br#"{"unexpected": true}"#);
        assert_matches!(decided, Discriminated::Malformed { .. });
    }

    #[test]
    fn empty_prompt_id_is_not_success() {
        let decided: Submit = discriminate(br#"{"prompt_id":"","number":1}"#);
        assert_matches!(decided, Discriminated::Malformed { .. });
    }
}
