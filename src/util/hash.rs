//! Canonical content hashing.
//!
//! The content hash is the engine's change-detection and collision-matching
//! fingerprint: SHA-256 over the substantive fields of an issue in a fixed
//! order, each field's UTF-8 bytes followed by a NUL separator. Identity
//! (`id`), the hash itself, and all timestamps are excluded, so two issues
//! that say the same thing hash equal no matter when they were written.
//!
//! The field walk must stay byte-stable across releases; mirrors written by
//! one build are matched by another.

use sha2::{Digest, Sha256};

use crate::model::Issue;

/// Compute the canonical content hash of an issue.
///
/// Hashed, in order: title, description, design, acceptance criteria,
/// notes, status, priority, kind, assignee, owner, creator, external ref,
/// source system, close reason, closing session, deleter, delete reason,
/// original kind, the pinned/template/ephemeral markers, then sorted
/// labels, then sorted `depends_on_id|type|metadata` dependency triples.
///
/// The relation vectors on `issue` must be populated; the store loads them
/// before recomputing.
#[must_use]
pub fn content_hash(issue: &Issue) -> String {
    let mut hasher = Sha256::new();

    let mut field = |value: &str| {
        // Embedded NULs would collide with the separator.
        if value.contains('\0') {
            hasher.update(value.replace('\0', " ").as_bytes());
        } else {
            hasher.update(value.as_bytes());
        }
        hasher.update(b"\x00");
    };

    field(&issue.title);
    field(issue.description.as_deref().unwrap_or(""));
    field(issue.design.as_deref().unwrap_or(""));
    field(issue.acceptance_criteria.as_deref().unwrap_or(""));
    field(issue.notes.as_deref().unwrap_or(""));
    field(issue.status.as_str());
    field(&issue.priority.0.to_string());
    field(issue.issue_type.as_str());
    field(issue.assignee.as_deref().unwrap_or(""));
    field(issue.owner.as_deref().unwrap_or(""));
    field(issue.created_by.as_deref().unwrap_or(""));
    field(issue.external_ref.as_deref().unwrap_or(""));
    field(issue.source_system.as_deref().unwrap_or(""));
    field(issue.close_reason.as_deref().unwrap_or(""));
    field(issue.closed_by_session.as_deref().unwrap_or(""));
    field(issue.deleted_by.as_deref().unwrap_or(""));
    field(issue.delete_reason.as_deref().unwrap_or(""));
    field(issue.original_type.as_deref().unwrap_or(""));
    field(if issue.pinned { "1" } else { "0" });
    field(if issue.is_template { "1" } else { "0" });
    field(if issue.ephemeral { "1" } else { "0" });

    let mut labels: Vec<&str> = issue.labels.iter().map(String::as_str).collect();
    labels.sort_unstable();
    for label in labels {
        field(label);
    }

    let mut triples: Vec<String> = issue
        .dependencies
        .iter()
        .map(|dep| {
            format!(
                "{}|{}|{}",
                dep.depends_on_id,
                dep.dep_type.as_str(),
                dep.metadata.as_deref().unwrap_or("")
            )
        })
        .collect();
    triples.sort_unstable();
    for triple in triples {
        field(&triple);
    }

    format!("{:x}", hasher.finalize())
}

/// Recompute and store the content hash on the issue.
pub fn refresh_content_hash(issue: &mut Issue) {
    issue.content_hash = Some(content_hash(issue));
}
