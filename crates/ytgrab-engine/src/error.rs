use reqwest::StatusCode;

/// Coarse classification attached to every engine error.
///
/// The kind decides retry behavior, strategy advancement, and the process
/// exit code, independently of the human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidUrl,
    Unsupported,
    Restricted,
    Network,
    Filesystem,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Stable lowercase name for logs and wire payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid-url",
            Self::Unsupported => "unsupported",
            Self::Restricted => "restricted",
            Self::Network => "network",
            Self::Filesystem => "filesystem",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }

    /// Process exit code for a failure of this kind.
    ///
    /// Cancellation is reported with the network exit code; it is a
    /// network-adjacent condition rather than a distinct failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidUrl => 2,
            Self::Unsupported => 3,
            Self::Restricted => 4,
            Self::Network | Self::Cancelled => 5,
            Self::Filesystem => 6,
            Self::Internal => 1,
        }
    }

    /// Rank used to pick the exit code when several items failed for
    /// different reasons. Higher rank wins; the ordering surfaces the most
    /// actionable kind to the operator.
    pub fn severity(&self) -> u8 {
        match self {
            Self::Restricted => 6,
            Self::Network | Self::Cancelled => 5,
            Self::Filesystem => 4,
            Self::Unsupported => 3,
            Self::InvalidUrl => 2,
            Self::Internal => 1,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type shared by all engine components.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("unsupported: {reason}")]
    Unsupported { reason: String },

    #[error("restricted content: {reason}")]
    Restricted { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("segment fetch failed: {reason}")]
    SegmentFetch { reason: String, retryable: bool },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("output path escapes the output root: `{path}`")]
    PathEscape { path: String },

    #[error("destination already exists, item skipped: `{path}`")]
    DuplicateSkipped { path: String },

    #[error("duplicate requires operator resolution: `{path}`")]
    PromptRequired { path: String },

    #[error("unknown prompt id `{prompt_id}`")]
    UnknownPrompt { prompt_id: String },

    #[error("external helper failed: {reason}")]
    ExternalHelper { reason: String },

    #[error("all acquisition strategies failed: {reason}")]
    StrategiesExhausted { reason: String },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("catalog error: {source}")]
    Catalog {
        #[from]
        source: sqlx::Error,
    },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }

    pub fn restricted(reason: impl Into<String>) -> Self {
        Self::Restricted {
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>, operation: &'static str) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn external_helper(reason: impl Into<String>) -> Self {
        Self::ExternalHelper {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Classify into the coarse taxonomy used for exit codes and reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidUrl { .. } => ErrorKind::InvalidUrl,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Restricted { .. } => ErrorKind::Restricted,
            Self::Network { .. } | Self::Timeout { .. } | Self::SegmentFetch { .. } => {
                ErrorKind::Network
            }
            Self::HttpStatus { status, .. } => match *status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::Restricted,
                StatusCode::NOT_FOUND | StatusCode::GONE => ErrorKind::InvalidUrl,
                _ => ErrorKind::Network,
            },
            Self::Io { .. } | Self::PathEscape { .. } | Self::DuplicateSkipped { .. } => {
                ErrorKind::Filesystem
            }
            Self::StrategiesExhausted { .. } => ErrorKind::Network,
            Self::ExternalHelper { .. } => ErrorKind::Unsupported,
            Self::PromptRequired { .. }
            | Self::UnknownPrompt { .. }
            | Self::Catalog { .. }
            | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the same strategy may be retried after backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::Unsupported { .. }
            | Self::Restricted { .. }
            | Self::PathEscape { .. }
            | Self::DuplicateSkipped { .. }
            | Self::PromptRequired { .. }
            | Self::UnknownPrompt { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::SegmentFetch { retryable, .. } => *retryable,
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Io { .. }
            | Self::ExternalHelper { .. }
            | Self::StrategiesExhausted { .. }
            | Self::Catalog { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Whether the failure should advance the chain to the next strategy.
    ///
    /// Cancellation and plainly permanent failures never advance; the rest
    /// of the taxonomy treats the strategy (not the item) as defeated.
    pub fn advances_strategy(&self, audio_only: bool) -> bool {
        match self {
            Self::Cancelled
            | Self::DuplicateSkipped { .. }
            | Self::PathEscape { .. }
            | Self::PromptRequired { .. } => false,
            Self::HttpStatus { status, .. } => match *status {
                StatusCode::FORBIDDEN => true,
                StatusCode::NOT_FOUND => audio_only,
                StatusCode::RANGE_NOT_SATISFIABLE => true,
                StatusCode::TOO_MANY_REQUESTS => true,
                s if s.is_server_error() => true,
                _ => false,
            },
            // Transient exhaustion inside a strategy is the chain's cue to
            // try the next acquisition path.
            Self::Network { .. } | Self::Timeout { .. } | Self::SegmentFetch { .. } => true,
            Self::ExternalHelper { .. } => false,
            _ => false,
        }
    }
}

/// Pick the exit code for a set of per-item failure kinds.
///
/// Returns 0 for an empty set. Ties are broken by `ErrorKind::severity`,
/// so the operator sees the most actionable failure class.
pub fn dominant_exit_code<I: IntoIterator<Item = ErrorKind>>(kinds: I) -> i32 {
    kinds
        .into_iter()
        .max_by_key(|k| k.severity())
        .map(|k| k.exit_code())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(ErrorKind::InvalidUrl.exit_code(), 2);
        assert_eq!(ErrorKind::Unsupported.exit_code(), 3);
        assert_eq!(ErrorKind::Restricted.exit_code(), 4);
        assert_eq!(ErrorKind::Network.exit_code(), 5);
        assert_eq!(ErrorKind::Cancelled.exit_code(), 5);
        assert_eq!(ErrorKind::Filesystem.exit_code(), 6);
        assert_eq!(ErrorKind::Internal.exit_code(), 1);
    }

    #[test]
    fn dominant_kind_prefers_most_actionable() {
        let code = dominant_exit_code([
            ErrorKind::Internal,
            ErrorKind::Network,
            ErrorKind::Restricted,
        ]);
        assert_eq!(code, 4);

        let code = dominant_exit_code([ErrorKind::InvalidUrl, ErrorKind::Filesystem]);
        assert_eq!(code, 6);

        assert_eq!(dominant_exit_code([]), 0);
    }

    #[test]
    fn forbidden_is_restricted_and_advances() {
        let err = DownloadError::http_status(StatusCode::FORBIDDEN, "https://x", "GET");
        assert_eq!(err.kind(), ErrorKind::Restricted);
        assert!(err.advances_strategy(false));
    }

    #[test]
    fn not_found_advances_only_for_audio() {
        let err = DownloadError::http_status(StatusCode::NOT_FOUND, "https://x", "GET");
        assert!(err.advances_strategy(true));
        assert!(!err.advances_strategy(false));
    }

    #[test]
    fn cancellation_never_advances() {
        assert!(!DownloadError::Cancelled.advances_strategy(true));
        assert!(!DownloadError::Cancelled.is_retryable());
        assert_eq!(DownloadError::Cancelled.kind(), ErrorKind::Cancelled);
    }
}
