/// Failures surfaced by the webhook client and the story flow.
///
/// The enum is `Clone` so a result can be shared with every caller waiting on
/// the same de-duplicated request.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoryError {
    #[error("{message}")]
    Transport { status: Option<u16>, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("Empty response")]
    EmptyResponse,

    #[error("unparseable response: {0}")]
    UnparseableResponse(String),

    #[error(
        "The model declined to create an outline. We'll fictionalize sensitive content and avoid real names. Please retry."
    )]
    Refusal,

    #[error("chapter {requested} cannot be generated before chapter {next}")]
    OutOfOrder { requested: u32, next: u32 },

    #[error("no outline yet; seed the story first")]
    NoOutline,
}

impl StoryError {
    pub fn transport(status: Option<u16>, body: &str) -> Self {
        let message = if body.trim().is_empty() {
            match status {
                Some(status) => format!("Endpoint error {status}"),
                None => "Endpoint error".to_owned(),
            }
        } else {
            body.to_owned()
        };
        Self::Transport { status, message }
    }

    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::Refusal)
    }
}

impl From<reqwest::Error> for StoryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        Self::Transport {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_uses_body_text_when_present() {
        let err = StoryError::transport(Some(502), "upstream workflow crashed");
        assert_eq!(err.to_string(), "upstream workflow crashed");
    }

    #[test]
    fn transport_falls_back_to_status_line() {
        let err = StoryError::transport(Some(500), "  ");
        assert_eq!(err.to_string(), "Endpoint error 500");
    }

    #[test]
    fn refusal_message_mentions_retry() {
        let err = StoryError::Refusal;
        assert!(err.is_refusal());
        assert!(err.to_string().contains("Please retry"));
    }
}
