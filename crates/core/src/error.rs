#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("History entry {prompt_id} is malformed: {reason}")]
    HistoryDecode { prompt_id: String, reason: String },

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub(crate) fn history(prompt_id: &str, reason: impl Into<String>) -> Self {
        Self::HistoryDecode {
            prompt_id: prompt_id.to_string(),
            reason: reason.into(),
        }
    }
}
