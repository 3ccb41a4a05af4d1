use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Reasons a string cannot be turned into a [`crate::title::Title`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TitleError {
    #[error("title is empty")]
    Empty,
    #[error("title contains illegal character {0:?}")]
    IllegalCharacter(char),
    #[error("title has no page name after prefix {0:?}")]
    MissingPageName(String),
    #[error("title is {0} bytes long (limit 255)")]
    TooLong(usize),
}

/// Fatal errors raised while a job is being assembled, before any page is touched.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("duplicate source {from}: already mapped to {existing}, cannot also map to {requested}")]
    DuplicateSource {
        from: String,
        existing: String,
        requested: String,
    },
    #[error("malformed title {input:?}: {source}")]
    MalformedTitle {
        input: String,
        #[source]
        source: TitleError,
    },
    #[error("template {template}: parameter {parameter:?} is claimed by both {first} and {second}")]
    HandlerCollision {
        template: String,
        parameter: String,
        first: String,
        second: String,
    },
    #[error("unknown job kind {0:?}")]
    UnknownJob(String),
    #[error("invalid job definition: {0}")]
    InvalidJob(String),
}

impl ConfigurationError {
    pub fn malformed_title(input: &str, source: TitleError) -> Self {
        Self::MalformedTitle {
            input: input.to_string(),
            source,
        }
    }
}

/// Failures reported by a site collaborator.
#[derive(Debug, Error)]
pub enum SiteError {
    #[error("edit conflict on {title}")]
    EditConflict { title: String },
    #[error("missing revision for {title}")]
    MissingRevision { title: String },
    #[error("page {title} does not exist")]
    MissingPage { title: String },
    #[error("MediaWiki API error [{code}]: {info}")]
    Api { code: String, info: String },
    #[error("MediaWiki API request failed with HTTP {status}")]
    Http { status: u16 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SiteError {
    /// Transient failures are worth another attempt after a short wait.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::EditConflict { .. } => true,
            Self::Http { status } => matches!(status, 408 | 429 | 502 | 503 | 504),
            Self::Api { code, .. } => matches!(code.as_str(), "ratelimited" | "maxlag" | "readonly"),
            Self::MissingRevision { .. } | Self::MissingPage { .. } | Self::Other(_) => false,
        }
    }
}

pub type SiteResult<T> = Result<T, SiteError>;

/// Returned from a checkpoint once the cancellation signal has been raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("run cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    CycleDetected,
    FragmentConflict,
    StructuralMismatch,
    CollaboratorError,
    LinksRemaining,
}

impl IssueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CycleDetected => "cycle_detected",
            Self::FragmentConflict => "fragment_conflict",
            Self::StructuralMismatch => "structural_mismatch",
            Self::CollaboratorError => "collaborator_error",
            Self::LinksRemaining => "links_remaining",
        }
    }
}

/// A non-fatal problem accumulated into the run report for human review.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub subject: String,
    pub detail: String,
}

impl Issue {
    pub fn new(kind: IssueKind, subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind.as_str(), self.subject, self.detail)
    }
}
