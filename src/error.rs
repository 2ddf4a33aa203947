use thiserror::Error;

/// A plan document that cannot be executed. Raised before any browser work.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("plan target is empty")]
    EmptyTarget,

    #[error("field #{index} has an empty {what}")]
    EmptyField { index: usize, what: &'static str },

    #[error("duplicate field name: {0}")]
    DuplicateField(String),

    #[error("pagination max_pages must be at least 1")]
    ZeroPages,

    #[error("click pagination requires a selector")]
    MissingPaginationSelector,
}

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha solving requested but no provider is configured")]
    NotConfigured,

    #[error("captcha provider rejected the task: {0}")]
    Rejected(String),

    #[error("captcha not solved after {attempts} polls")]
    Timeout { attempts: u32 },

    #[error("captcha provider request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{action} did not settle within {timeout_ms}ms")]
    StepTimeout { action: &'static str, timeout_ms: u64 },

    #[error("challenge detected but it carries no {0}")]
    IncompleteChallenge(&'static str),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("run {0} not found")]
    RunNotFound(u32),

    #[error("ledger I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}
