use thiserror::Error;

/// Which side of a copy an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOrigin {
    Source,
    Destination,
}

impl std::fmt::Display for CopyOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Destination => write!(f, "destination"),
        }
    }
}

/// A3S Relay error types
#[derive(Error, Debug)]
pub enum RelayError {
    /// Malformed repository or artifact reference
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Tag does not match the distribution-spec tag grammar
    #[error("Invalid tag {tag:?} in reference {reference:?}: tag must match ^[\\w][\\w.-]{{0,127}}$")]
    InvalidTag { tag: String, reference: String },

    /// Digest reference supplied where a tag is required
    #[error("Digest references are not supported: {0:?}")]
    DigestNotSupported(String),

    /// Missing or invalid command input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Reference does not resolve to existing content
    #[error("{reference}: not found")]
    NotFound { reference: String },

    /// Transfer failure tagged with the side that produced it
    #[error("Failed to {operation}: {source}")]
    Copy {
        origin: CopyOrigin,
        operation: String,
        #[source]
        source: Box<RelayError>,
    },

    /// Referrer closure of an index could not be computed
    #[error("Failed to compute referrers of {root}: {source}")]
    Closure {
        root: String,
        #[source]
        source: Box<RelayError>,
    },

    /// Repository has no tags to back up
    #[error("No tags found in repository {repository}, please specify at least one tag to back up")]
    NoTags { repository: String },

    /// An extra destination tag could not be applied after the copy
    #[error("Failed to tag {digest} as {tag}: {source}")]
    TagFailed {
        tag: String,
        digest: String,
        #[source]
        source: Box<RelayError>,
    },

    /// Archive serialization error
    #[error("Archive error: {0}")]
    Archive(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Content store error
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation context attached to a lower-level error
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<RelayError>,
    },

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Wrap an error as a transfer failure from the given side.
    pub fn copy(origin: CopyOrigin, operation: impl Into<String>, source: RelayError) -> Self {
        Self::Copy {
            origin,
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Attach operation context to this error.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Origin of this error, only when the error itself is a transfer failure.
    ///
    /// A transfer failure wrapped in context does not report an origin, so
    /// callers only prefix messages they can attribute unambiguously.
    pub fn origin(&self) -> Option<CopyOrigin> {
        match self {
            Self::Copy { origin, .. } => Some(*origin),
            _ => None,
        }
    }

    /// Replace a transfer failure found anywhere in the context chain with
    /// its inner error. Other errors are returned unchanged.
    pub fn unwrap_copy(self) -> Self {
        if !self.contains_copy() {
            return self;
        }
        match self {
            Self::Copy { source, .. } => *source,
            Self::Context { source, .. } => (*source).unwrap_copy(),
            other => other,
        }
    }

    fn contains_copy(&self) -> bool {
        match self {
            Self::Copy { .. } => true,
            Self::Context { source, .. } => source.contains_copy(),
            _ => false,
        }
    }

    /// Whether the root cause is missing content.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Copy { source, .. }
            | Self::Closure { source, .. }
            | Self::TagFailed { source, .. }
            | Self::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Suggested follow-up for the user, if any.
    pub fn recommendation(&self) -> Option<String> {
        match self {
            Self::NoTags { repository } => Some(format!(
                "If you want to list available tags in {}, use \"a3s-relay repo tags\"",
                repository
            )),
            Self::Context { source, .. } => source.recommendation(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for RelayError {
    fn from(err: serde_yaml::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

/// Result type alias for A3S Relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
