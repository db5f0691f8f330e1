//! Field and relation validators.
//!
//! Validators never touch storage directly; storage-dependent checks go
//! through the [`DependencyStore`] seam so they can be exercised against
//! fakes. Every mutating operation runs the relevant validator before any
//! row is written.

use crate::error::{BeadsError, Result, ValidationError};
use crate::model::{Comment, Dependency, Issue, Priority, Status};

/// Labels in this namespace are managed by a dedicated capability-
/// registration operation; the ordinary label path refuses them.
pub const RESERVED_LABEL_NAMESPACE: &str = "provides:";

/// Maximum label length in bytes.
pub const MAX_LABEL_LEN: usize = 100;

/// Title bounds after trimming.
pub const MAX_TITLE_LEN: usize = 500;

/// Split an external dependency sentinel `external:<project>:<capability>`
/// into its project and capability parts.
#[must_use]
pub fn parse_external_sentinel(target: &str) -> Option<(&str, &str)> {
    let rest = target.strip_prefix("external:")?;
    let (project, capability) = rest.split_once(':')?;
    if project.is_empty() || capability.is_empty() {
        return None;
    }
    Some((project, capability))
}

/// True when the dependency target is an external sentinel (well-formed or
/// not); used to decide whether referential integrity applies.
#[must_use]
pub fn is_external_target(target: &str) -> bool {
    target.starts_with("external:")
}

/// Validates issue-level invariants.
pub struct IssueValidator;

impl IssueValidator {
    /// Check every issue invariant, collecting all violations.
    ///
    /// # Errors
    ///
    /// Returns the full list of violations when any rule fails.
    pub fn validate(issue: &Issue) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if issue.id.trim().is_empty() {
            errors.push(ValidationError::new("id", "cannot be empty"));
        }

        let title = issue.title.trim();
        if title.is_empty() {
            errors.push(ValidationError::new("title", "cannot be empty"));
        } else if title.len() > MAX_TITLE_LEN {
            errors.push(ValidationError::new(
                "title",
                format!("exceeds {MAX_TITLE_LEN} characters"),
            ));
        }

        if !issue.priority.in_range() {
            errors.push(ValidationError::new(
                "priority",
                format!("must be {}-{}", Priority::MIN, Priority::MAX),
            ));
        }

        // closed_at tracks the closed status exactly; tombstones may carry
        // whatever closed_at they died with.
        match &issue.status {
            Status::Closed => {
                if issue.closed_at.is_none() {
                    errors.push(ValidationError::new(
                        "closed_at",
                        "required when status is closed",
                    ));
                }
            }
            Status::Tombstone => {
                if issue.deleted_at.is_none() {
                    errors.push(ValidationError::new(
                        "deleted_at",
                        "required when status is tombstone",
                    ));
                }
            }
            status if status.forbids_closed_at() => {
                if issue.closed_at.is_some() {
                    errors.push(ValidationError::new(
                        "closed_at",
                        format!("must be unset while status is {status}"),
                    ));
                }
            }
            _ => {}
        }

        if let Some(minutes) = issue.estimated_minutes {
            if minutes < 0 {
                errors.push(ValidationError::new(
                    "estimated_minutes",
                    "cannot be negative",
                ));
            }
        }

        if let Some(external_ref) = issue.external_ref.as_deref() {
            if external_ref.chars().any(char::is_whitespace) {
                errors.push(ValidationError::new(
                    "external_ref",
                    "cannot contain whitespace",
                ));
            }
        }

        if issue.updated_at < issue.created_at {
            errors.push(ValidationError::new(
                "updated_at",
                "cannot be before created_at",
            ));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Storage lookups a dependency validator needs.
pub trait DependencyStore {
    /// Whether the issue exists (tombstones included).
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn issue_exists(&self, id: &str) -> Result<bool>;

    /// Whether an edge already links the ordered pair.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn edge_exists(&self, issue_id: &str, depends_on_id: &str) -> Result<bool>;

    /// Whether a prospective blocking edge would close a cycle.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn would_create_cycle(&self, issue_id: &str, depends_on_id: &str) -> Result<bool>;
}

/// Validates a prospective dependency edge.
pub struct DependencyValidator;

impl DependencyValidator {
    /// Check a new edge: self-reference, endpoint existence, sentinel
    /// shape, duplicate edges, and (for blocking types) acyclicity.
    ///
    /// # Errors
    ///
    /// `SelfDependency`, `DependencyCycle`, `Validation`, or `NotFound`
    /// variants depending on the failure; store errors propagate.
    pub fn validate(dep: &Dependency, store: &impl DependencyStore) -> Result<()> {
        if dep.issue_id == dep.depends_on_id {
            return Err(BeadsError::SelfDependency {
                id: dep.issue_id.clone(),
            });
        }

        if !store.issue_exists(&dep.issue_id)? {
            return Err(BeadsError::IssueNotFound {
                id: dep.issue_id.clone(),
            });
        }

        if is_external_target(&dep.depends_on_id) {
            // No referential integrity for sentinels, but the shape must
            // be right or traversal could never resolve it.
            if parse_external_sentinel(&dep.depends_on_id).is_none() {
                return Err(BeadsError::validation(
                    "depends_on_id",
                    format!(
                        "malformed external sentinel '{}' (expected external:<project>:<capability>)",
                        dep.depends_on_id
                    ),
                ));
            }
        } else if !store.issue_exists(&dep.depends_on_id)? {
            return Err(BeadsError::IssueNotFound {
                id: dep.depends_on_id.clone(),
            });
        }

        if store.edge_exists(&dep.issue_id, &dep.depends_on_id)? {
            return Err(BeadsError::validation(
                "depends_on_id",
                format!(
                    "dependency already exists: {} -> {}",
                    dep.issue_id, dep.depends_on_id
                ),
            ));
        }

        if dep.dep_type.is_blocking()
            && !is_external_target(&dep.depends_on_id)
            && store.would_create_cycle(&dep.issue_id, &dep.depends_on_id)?
        {
            return Err(BeadsError::DependencyCycle {
                path: vec![dep.issue_id.clone(), dep.depends_on_id.clone()],
            });
        }

        Ok(())
    }
}

/// Validates label values on the ordinary (non-capability) write path.
pub struct LabelValidator;

impl LabelValidator {
    /// Labels are case-sensitive strings up to 100 bytes; the `provides:`
    /// namespace is reserved.
    ///
    /// # Errors
    ///
    /// `ReservedLabel` or `Validation`.
    pub fn validate(label: &str) -> Result<()> {
        if label.is_empty() {
            return Err(BeadsError::validation("label", "cannot be empty"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(BeadsError::validation(
                "label",
                format!("exceeds {MAX_LABEL_LEN} characters"),
            ));
        }
        if label.starts_with(RESERVED_LABEL_NAMESPACE) {
            return Err(BeadsError::ReservedLabel {
                label: label.to_string(),
            });
        }
        Ok(())
    }
}

/// Validates comments before append.
pub struct CommentValidator;

impl CommentValidator {
    /// Author and body are required; there is no length cap on the body.
    ///
    /// # Errors
    ///
    /// `Validation` when either is blank.
    pub fn validate_parts(author: &str, body: &str) -> Result<()> {
        if author.trim().is_empty() {
            return Err(BeadsError::validation("author", "cannot be empty"));
        }
        if body.trim().is_empty() {
            return Err(BeadsError::validation("text", "cannot be empty"));
        }
        Ok(())
    }

    /// Validate a full comment record (import path).
    ///
    /// # Errors
    ///
    /// `Validation` when a required field is blank.
    pub fn validate(comment: &Comment) -> Result<()> {
        if comment.issue_id.trim().is_empty() {
            return Err(BeadsError::validation("issue_id", "cannot be empty"));
        }
        Self::validate_parts(&comment.author, &comment.body)
    }
}
