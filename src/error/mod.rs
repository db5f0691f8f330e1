//! Error types for the engine.
//!
//! Every failure the engine surfaces carries a stable machine-readable
//! [`ErrorKind`] tag alongside the human description, so collaborators
//! (CLI, agents, bridges) can branch on the kind without parsing text.

use std::path::PathBuf;
use thiserror::Error;

/// Stable error classification. `as_str` values are a public contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Lookup of an absent entity.
    NotFound,
    /// Partial-ID resolution matched more than one issue.
    AmbiguousId,
    /// Field or relation validation failed; the operation was aborted.
    Validation,
    /// A prospective blocking edge would create a cycle.
    CycleDetected,
    /// An import collision that cannot be resolved under the active policy,
    /// or a safety refusal that requires an explicit override.
    Conflict,
    /// Incoming records fall outside the allowed prefixes.
    PrefixMismatch,
    /// Merge markers, invalid JSON, or duplicate IDs in an import batch.
    CorruptInput,
    /// A mirror path escapes the workspace allowlist.
    PathUnsafe,
    /// The database stayed busy beyond the backoff budget. Retryable.
    Locked,
    /// File read/write/fsync/rename failure.
    Io,
    /// The store is missing tables or columns; a migration is required.
    Schema,
    /// Unexpected internal failure (wrapped database or foreign errors).
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AmbiguousId => "ambiguous_id",
            Self::Validation => "validation",
            Self::CycleDetected => "cycle_detected",
            Self::Conflict => "conflict",
            Self::PrefixMismatch => "prefix_mismatch",
            Self::CorruptInput => "corrupt_input",
            Self::PathUnsafe => "path_unsafe",
            Self::Locked => "locked",
            Self::Io => "io",
            Self::Schema => "schema",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine error type.
#[derive(Error, Debug)]
pub enum BeadsError {
    #[error("Issue not found: {id}")]
    IssueNotFound { id: String },

    #[error("Dependency not found: {issue_id} -> {depends_on_id}")]
    DependencyNotFound {
        issue_id: String,
        depends_on_id: String,
    },

    #[error("Ambiguous ID '{partial}': matches {matches:?}")]
    AmbiguousId {
        partial: String,
        matches: Vec<String>,
    },

    #[error("Validation failed: {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Validation errors: {errors:?}")]
    ValidationErrors { errors: Vec<ValidationError> },

    #[error("Invalid issue ID format: {id}")]
    InvalidId { id: String },

    #[error("Issue cannot depend on itself: {id}")]
    SelfDependency { id: String },

    #[error("Label namespace is reserved: {label}")]
    ReservedLabel { label: String },

    #[error("Cycle detected in dependencies: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    #[error("Duplicate external_ref in import batch: {external_ref}")]
    DuplicateExternalRef { external_ref: String },

    #[error("Prefix mismatch: expected '{expected}', found: {}", found.join(", "))]
    PrefixMismatch {
        expected: String,
        found: Vec<String>,
    },

    #[error("Corrupt input in {}{}: {reason}", path.display(), line.map(|l| format!(" at line {l}")).unwrap_or_default())]
    CorruptInput {
        path: PathBuf,
        line: Option<usize>,
        reason: String,
    },

    #[error("Unsafe path '{}': {reason}", path.display())]
    PathUnsafe { path: PathBuf, reason: String },

    #[error("Store is locked: {context}")]
    Locked { context: String },

    #[error("Schema error: {detail}")]
    Schema { detail: String },

    #[error("ID space exhausted for prefix '{prefix}'")]
    IdExhausted { prefix: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A single field validation failure; operations collect these before
/// reporting so callers see every problem at once.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

impl BeadsError {
    /// The stable kind tag for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IssueNotFound { .. } | Self::DependencyNotFound { .. } => ErrorKind::NotFound,
            Self::AmbiguousId { .. } => ErrorKind::AmbiguousId,
            Self::Validation { .. }
            | Self::ValidationErrors { .. }
            | Self::InvalidId { .. }
            | Self::SelfDependency { .. }
            | Self::ReservedLabel { .. } => ErrorKind::Validation,
            Self::DependencyCycle { .. } => ErrorKind::CycleDetected,
            Self::Conflict { .. } | Self::DuplicateExternalRef { .. } => ErrorKind::Conflict,
            Self::PrefixMismatch { .. } => ErrorKind::PrefixMismatch,
            Self::CorruptInput { .. } => ErrorKind::CorruptInput,
            Self::PathUnsafe { .. } => ErrorKind::PathUnsafe,
            Self::Locked { .. } => ErrorKind::Locked,
            Self::Schema { .. } => ErrorKind::Schema,
            Self::Io(_) => ErrorKind::Io,
            Self::Database(err) => classify_sqlite(err),
            Self::Json(_) | Self::IdExhausted { .. } | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may usefully retry the same operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Locked
    }

    #[must_use]
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn corrupt_input(
        path: impl Into<PathBuf>,
        line: Option<usize>,
        reason: impl Into<String>,
    ) -> Self {
        Self::CorruptInput {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn path_unsafe(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::PathUnsafe {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Collapse a batch of validation failures into one error value.
    #[must_use]
    pub fn from_validation_errors(errors: Vec<ValidationError>) -> Self {
        if errors.len() == 1 {
            let err = &errors[0];
            Self::Validation {
                field: err.field.clone(),
                reason: err.message.clone(),
            }
        } else {
            Self::ValidationErrors { errors }
        }
    }
}

fn classify_sqlite(err: &rusqlite::Error) -> ErrorKind {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => match code.code {
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                ErrorKind::Locked
            }
            _ => ErrorKind::Internal,
        },
        _ => ErrorKind::Internal,
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BeadsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_have_stable_tags() {
        let err = BeadsError::IssueNotFound {
            id: "bd-1".to_string(),
        };
        assert_eq!(err.kind().as_str(), "not_found");

        let err = BeadsError::DependencyCycle {
            path: vec!["bd-a".to_string(), "bd-b".to_string(), "bd-a".to_string()],
        };
        assert_eq!(err.kind().as_str(), "cycle_detected");
        assert_eq!(err.to_string(), "Cycle detected in dependencies: bd-a -> bd-b -> bd-a");
    }

    #[test]
    fn corrupt_input_names_file_and_line() {
        let err = BeadsError::corrupt_input("/tmp/issues.jsonl", Some(3), "merge conflict marker");
        assert_eq!(err.kind(), ErrorKind::CorruptInput);
        let text = err.to_string();
        assert!(text.contains("issues.jsonl"));
        assert!(text.contains("line 3"));
    }

    #[test]
    fn only_locked_is_retryable() {
        assert!(
            BeadsError::Locked {
                context: "busy timeout exceeded".to_string()
            }
            .is_retryable()
        );
        assert!(!BeadsError::validation("title", "empty").is_retryable());
    }

    #[test]
    fn busy_sqlite_errors_classify_as_locked() {
        let err = BeadsError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert_eq!(err.kind(), ErrorKind::Locked);
    }

    #[test]
    fn single_validation_error_flattens() {
        let err =
            BeadsError::from_validation_errors(vec![ValidationError::new("title", "too long")]);
        assert_eq!(err.to_string(), "Validation failed: title: too long");
    }
}
