use thiserror::Error;

/// An error with user-facing messaging, separate from the technical cause.
///
/// Background workers wrap their business failures in this before calling
/// `Operation::complete`, so the UI can show a short actionable message while
/// the full error chain stays available for logging.
///
/// Tone guideline for summaries: "Couldn't install Firefox", not
/// "Error: install failed".
#[derive(Debug, Error)]
#[error("{summary}")]
pub struct UserError {
    summary: String,
    hint: Option<String>,
    #[source]
    technical: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl UserError {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            hint: None,
            technical: None,
        }
    }

    /// Attaches an action suggestion, e.g. "Check your internet connection".
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attaches the underlying technical error for logging and debugging.
    pub fn with_source(mut self, err: anyhow::Error) -> Self {
        self.technical = Some(err.into());
        self
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// Returns the display message without technical details:
    /// "Summary: Hint" when a hint is set, otherwise just the summary.
    pub fn format_for_user(&self) -> String {
        match &self.hint {
            Some(hint) => format!("{}: {}", self.summary, hint),
            None => self.summary.clone(),
        }
    }
}
