//! Collision resolution for incoming mirror records.
//!
//! Every record entering the store from a mirror passes through a fixed
//! phase ladder:
//!
//! | phase | key | action |
//! |---|---|---|
//! | 0 | `external_ref` | update in place when incoming is newer |
//! | 1a | content hash, same ID | no-op |
//! | 1b | content hash, other ID | rename when prefixes agree, else skip |
//! | 2 | ID | last-writer-wins on `updated_at` |
//! | 3 | nothing | create |
//!
//! Two protections precede every phase: a stored tombstone is
//! authoritative and silently wins, and a caller-supplied
//! `{id -> protect_since}` map fends off replayed echoes of local
//! exports.

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

use crate::config::OrphanMode;
use crate::error::{BeadsError, Result};
use crate::model::{Issue, Status};
use crate::storage::sqlite::{get_issue_row_tx, id_exists_tx};
use crate::util::hash::content_hash;
use crate::util::id::{IdGenerator, id_depth, parse_id};
use crate::validation::{IssueValidator, is_external_target};

/// Policy knobs for one import run.
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// The workspace's prefix; incoming records outside it (and outside
    /// `allowed_prefixes`) are rejected, dropped, or renamed.
    pub expected_prefix: Option<String>,
    pub allowed_prefixes: Vec<String>,
    /// Rewrite foreign-prefix records to the workspace prefix, including
    /// every textual reference to the old IDs.
    pub rename_on_import: bool,
    pub orphan_handling: OrphanMode,
    /// Keep the first record for a duplicated `external_ref` and null the
    /// rest, instead of failing the batch.
    pub clear_duplicate_external_refs: bool,
    /// `{id -> protect_since}`: incoming records not strictly newer than
    /// their entry are skipped. Guards the export/import round trip
    /// against stale echoes.
    pub protect_local_exports: HashMap<String, DateTime<Utc>>,
}

/// Counters describing what an import did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped_stale: usize,
    pub skipped_tombstone: usize,
    pub skipped_protected: usize,
    pub skipped_ephemeral: usize,
    pub dropped_foreign_tombstones: usize,
    pub dropped_orphans: usize,
    /// Old ID -> new ID, for rename-on-import and content-hash renames.
    pub renamed: HashMap<String, String>,
}

/// What to do with one incoming record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    Create,
    Update { merged: Issue },
    Noop { target_id: String },
    Skip { reason: SkipReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SkipReason {
    Tombstone,
    Stale,
    Protected,
    CrossProjectDuplicate,
}

/// Normalize a parsed mirror record before resolution: trim the title,
/// repair the closed-at and tombstone invariants, recompute the hash.
pub(crate) fn normalize_record(issue: &mut Issue) {
    issue.title = issue.title.trim().to_string();

    match issue.status {
        Status::Closed => {
            if issue.closed_at.is_none() {
                issue.closed_at = Some(issue.updated_at);
            }
        }
        Status::Tombstone => {
            if issue.deleted_at.is_none() {
                issue.deleted_at = Some(issue.updated_at);
            }
            if issue.original_type.is_none() {
                issue.original_type = Some(issue.issue_type.as_str().to_string());
            }
        }
        _ => {
            issue.closed_at = None;
        }
    }

    issue.content_hash = Some(content_hash(issue));
}

/// Batch-level preparation: normalize, validate, reject duplicate IDs,
/// settle duplicate external refs, apply the prefix policy (drop foreign
/// tombstones, rename, or reject), and order parents before children.
///
/// # Errors
///
/// `CorruptInput` for duplicate IDs, `DuplicateExternalRef`,
/// `PrefixMismatch`, or validation failures.
pub(crate) fn prepare_batch(
    mut records: Vec<Issue>,
    opts: &ImportOptions,
    mirror_path: &Path,
    id_taken: impl Fn(&str) -> bool,
    outcome: &mut ImportOutcome,
) -> Result<Vec<Issue>> {
    for record in &mut records {
        normalize_record(record);
    }
    for record in &records {
        IssueValidator::validate(record).map_err(|errors| {
            BeadsError::validation(
                "import",
                format!(
                    "record {} is invalid: {}",
                    record.id,
                    errors
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )
        })?;
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for record in &records {
        if !seen_ids.insert(record.id.as_str()) {
            return Err(BeadsError::corrupt_input(
                mirror_path,
                None,
                format!("duplicate ID in batch: {}", record.id),
            ));
        }
    }

    let mut seen_refs: HashSet<String> = HashSet::new();
    for record in &mut records {
        let Some(ext) = record.external_ref.clone() else {
            continue;
        };
        if ext.is_empty() {
            continue;
        }
        if seen_refs.insert(ext.clone()) {
            continue;
        }
        if opts.clear_duplicate_external_refs {
            record.external_ref = None;
            record.content_hash = Some(content_hash(record));
        } else {
            return Err(BeadsError::DuplicateExternalRef { external_ref: ext });
        }
    }

    if let Some(expected) = &opts.expected_prefix {
        records = apply_prefix_policy(records, expected, opts, id_taken, outcome)?;
    }

    // Parents before children, stable within a depth tier.
    records.sort_by(|a, b| id_depth(&a.id).cmp(&id_depth(&b.id)).then(a.id.cmp(&b.id)));
    Ok(records)
}

fn apply_prefix_policy(
    mut records: Vec<Issue>,
    expected: &str,
    opts: &ImportOptions,
    id_taken: impl Fn(&str) -> bool,
    outcome: &mut ImportOutcome,
) -> Result<Vec<Issue>> {
    let matches_workspace = |id: &str| {
        parse_id(id).is_ok_and(|parsed| {
            parsed.prefix == expected || opts.allowed_prefixes.contains(&parsed.prefix)
        })
    };

    let mismatched: Vec<String> = records
        .iter()
        .filter(|record| !matches_workspace(&record.id))
        .map(|record| record.id.clone())
        .collect();
    if mismatched.is_empty() {
        return Ok(records);
    }

    if opts.rename_on_import {
        let generator = IdGenerator::new(crate::util::id::IdConfig::with_prefix(expected));
        let mut renames: HashMap<String, String> = HashMap::new();
        let batch_count = records.len();
        for record in &records {
            if matches_workspace(&record.id) {
                continue;
            }
            // First choice: keep the hash portion, swap the prefix. Fall
            // back to a fresh hash on collision.
            let swapped = parse_id(&record.id).ok().map(|parsed| {
                let mut id = format!("{expected}-{}", parsed.hash);
                for seg in parsed.child_path {
                    id.push('.');
                    id.push_str(&seg.to_string());
                }
                id
            });
            let collides = |candidate: &str| {
                id_taken(candidate)
                    || records.iter().any(|r| r.id == candidate)
                    || renames.values().any(|v| v == candidate)
            };
            let new_id = match swapped {
                Some(candidate) if !collides(&candidate) => candidate,
                _ => generator.generate(
                    &record.title,
                    record.description.as_deref(),
                    record.created_by.as_deref(),
                    record.created_at,
                    batch_count,
                    collides,
                )?,
            };
            renames.insert(record.id.clone(), new_id);
        }

        for record in &mut records {
            if let Some(new_id) = renames.get(&record.id) {
                if record.external_ref.is_none() {
                    // Keep provenance: the foreign ID survives as the
                    // external ref.
                    record.external_ref = Some(record.id.clone());
                }
                record.id = new_id.clone();
            }
        }
        rewrite_references(&mut records, &renames);
        for record in &mut records {
            record.content_hash = Some(content_hash(record));
        }
        debug!(renamed = renames.len(), "Renamed foreign-prefix records on import");
        outcome.renamed.extend(renames);
        return Ok(records);
    }

    // Foreign tombstones are clone noise; anything live is an error.
    let live: Vec<String> = records
        .iter()
        .filter(|record| !matches_workspace(&record.id) && !record.is_tombstone())
        .map(|record| record.id.clone())
        .collect();
    if !live.is_empty() {
        return Err(BeadsError::PrefixMismatch {
            expected: expected.to_string(),
            found: live,
        });
    }

    let before = records.len();
    records.retain(|record| matches_workspace(&record.id));
    outcome.dropped_foreign_tombstones += before - records.len();
    Ok(records)
}

/// Rewrite every reference to renamed IDs: dependency endpoints exactly,
/// free-text fields and comment bodies with token-boundary matching so
/// `bd-1` never rewrites inside `bd-10`.
pub(crate) fn rewrite_references(records: &mut [Issue], renames: &HashMap<String, String>) {
    if renames.is_empty() {
        return;
    }

    let patterns: Vec<(Regex, &str)> = renames
        .iter()
        .filter_map(|(old, new)| {
            Regex::new(&format!(r"\b{}\b", regex::escape(old)))
                .ok()
                .map(|re| (re, new.as_str()))
        })
        .collect();

    let rewrite = |text: &mut String| {
        for (re, new) in &patterns {
            if re.is_match(text) {
                *text = re.replace_all(text, *new).into_owned();
            }
        }
    };

    for record in records {
        rewrite(&mut record.title);
        for field in [
            &mut record.description,
            &mut record.design,
            &mut record.acceptance_criteria,
            &mut record.notes,
        ] {
            if let Some(text) = field.as_mut() {
                rewrite(text);
            }
        }
        for comment in &mut record.comments {
            rewrite(&mut comment.body);
            if let Some(new_id) = renames.get(&comment.issue_id) {
                comment.issue_id = new_id.clone();
            }
        }
        for dep in &mut record.dependencies {
            if let Some(new_id) = renames.get(&dep.issue_id) {
                dep.issue_id = new_id.clone();
            }
            if let Some(new_id) = renames.get(&dep.depends_on_id) {
                dep.depends_on_id = new_id.clone();
            }
        }
    }
}

/// Run the phase ladder for one prepared record against the store.
///
/// # Errors
///
/// Propagates database failures.
pub(crate) fn resolve_record(
    conn: &Connection,
    incoming: &Issue,
    opts: &ImportOptions,
) -> Result<Resolution> {
    if let Some(protect_since) = opts.protect_local_exports.get(&incoming.id) {
        if incoming.updated_at <= *protect_since {
            return Ok(Resolution::Skip {
                reason: SkipReason::Protected,
            });
        }
    }

    // Phase 0: external-ref identity.
    if let Some(ext) = incoming.external_ref.as_deref().filter(|e| !e.is_empty()) {
        if let Some(existing) = find_by_external_ref_tx(conn, ext)? {
            if existing.is_tombstone() {
                return Ok(Resolution::Skip {
                    reason: SkipReason::Tombstone,
                });
            }
            if incoming.updated_at > existing.updated_at {
                let mut merged = incoming.clone();
                merged.id = existing.id;
                // An incoming false never unpins; everything else,
                // including empty assignee/external_ref, overwrites.
                merged.pinned = merged.pinned || existing.pinned;
                merged.content_hash = Some(content_hash(&merged));
                return Ok(Resolution::Update { merged });
            }
            return Ok(Resolution::Skip {
                reason: SkipReason::Stale,
            });
        }
    }

    // Phase 1: content-hash identity.
    let hash = incoming
        .content_hash
        .clone()
        .unwrap_or_else(|| content_hash(incoming));
    if let Some(existing) = find_by_content_hash_tx(conn, &hash)? {
        if existing.is_tombstone() {
            return Ok(Resolution::Skip {
                reason: SkipReason::Tombstone,
            });
        }
        if existing.id == incoming.id {
            return Ok(Resolution::Noop {
                target_id: existing.id,
            });
        }
        let same_prefix = match (parse_id(&existing.id), parse_id(&incoming.id)) {
            (Ok(a), Ok(b)) => a.prefix == b.prefix,
            _ => false,
        };
        if same_prefix {
            // Same content, same project, different ID: the record moved.
            let mut merged = incoming.clone();
            merged.id = existing.id;
            merged.content_hash = Some(content_hash(&merged));
            return Ok(Resolution::Update { merged });
        }
        return Ok(Resolution::Skip {
            reason: SkipReason::CrossProjectDuplicate,
        });
    }

    // Phase 2: ID identity, last-writer-wins.
    if let Some(existing) = get_issue_row_tx(conn, &incoming.id)? {
        if existing.is_tombstone() {
            return Ok(Resolution::Skip {
                reason: SkipReason::Tombstone,
            });
        }
        if incoming.updated_at > existing.updated_at {
            return Ok(Resolution::Update {
                merged: incoming.clone(),
            });
        }
        return Ok(Resolution::Skip {
            reason: SkipReason::Stale,
        });
    }

    // Phase 3: new record.
    Ok(Resolution::Create)
}

/// Enforce the orphan policy over the prepared batch: every
/// `parent-child` edge must point at a parent that exists in the store or
/// the batch. Returns placeholder parents to create (resurrect mode).
///
/// # Errors
///
/// `Conflict` in strict mode; database failures.
pub(crate) fn handle_orphans(
    conn: &Connection,
    records: &mut Vec<Issue>,
    mode: OrphanMode,
    outcome: &mut ImportOutcome,
) -> Result<Vec<Issue>> {
    if mode == OrphanMode::Allow {
        return Ok(Vec::new());
    }

    let batch_ids: HashSet<String> = records.iter().map(|record| record.id.clone()).collect();
    let mut missing_parents: Vec<(String, String)> = Vec::new();
    for record in records.iter() {
        for dep in &record.dependencies {
            if dep.dep_type != crate::model::DependencyType::ParentChild {
                continue;
            }
            let parent = &dep.depends_on_id;
            if is_external_target(parent)
                || batch_ids.contains(parent)
                || id_exists_tx(conn, parent)?
            {
                continue;
            }
            missing_parents.push((record.id.clone(), parent.clone()));
        }
    }
    if missing_parents.is_empty() {
        return Ok(Vec::new());
    }

    match mode {
        OrphanMode::Strict => {
            let (child, parent) = &missing_parents[0];
            Err(BeadsError::conflict(format!(
                "orphaned record {child}: parent {parent} does not exist (orphan_handling=strict)"
            )))
        }
        OrphanMode::Skip => {
            let orphan_ids: HashSet<String> = missing_parents
                .iter()
                .map(|(child, _)| child.clone())
                .collect();
            for (child, parent) in &missing_parents {
                warn!(child = %child, parent = %parent, "Dropping orphaned record");
            }
            let before = records.len();
            records.retain(|record| !orphan_ids.contains(&record.id));
            outcome.dropped_orphans += before - records.len();
            Ok(Vec::new())
        }
        OrphanMode::Resurrect => {
            let mut placeholders: Vec<Issue> = Vec::new();
            let mut known: HashSet<String> = batch_ids;
            for (_, parent) in missing_parents {
                // Walk the dotted ancestry so a resurrected child never
                // dangles off a still-missing grandparent.
                let mut chain = vec![parent.clone()];
                let mut cursor = parent;
                while let Some((ancestor, _)) = crate::util::id::parent_and_child_number(&cursor) {
                    let ancestor = ancestor.to_string();
                    chain.push(ancestor.clone());
                    cursor = ancestor;
                }
                for ancestor in chain.into_iter().rev() {
                    if known.contains(&ancestor) || id_exists_tx(conn, &ancestor)? {
                        continue;
                    }
                    placeholders.push(placeholder_parent(&ancestor));
                    known.insert(ancestor);
                }
            }
            Ok(placeholders)
        }
        OrphanMode::Allow => Ok(Vec::new()),
    }
}

/// A minimal closed stand-in for a parent the mirror no longer carries.
fn placeholder_parent(parent_id: &str) -> Issue {
    let mut issue = Issue::new(parent_id, format!("{parent_id} (resurrected placeholder)"));
    issue.status = Status::Closed;
    issue.closed_at = Some(Utc::now());
    issue.close_reason = Some("resurrected placeholder for orphaned children".to_string());
    issue.created_by = Some("import".to_string());
    issue.content_hash = Some(content_hash(&issue));
    issue
}

fn find_by_external_ref_tx(conn: &Connection, external_ref: &str) -> Result<Option<Issue>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM issues WHERE external_ref = ?",
            [external_ref],
            |row| row.get(0),
        )
        .optional()?;
    match id {
        Some(id) => get_issue_row_tx(conn, &id),
        None => Ok(None),
    }
}

fn find_by_content_hash_tx(conn: &Connection, hash: &str) -> Result<Option<Issue>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM issues WHERE content_hash = ? LIMIT 1",
            [hash],
            |row| row.get(0),
        )
        .optional()?;
    match id {
        Some(id) => get_issue_row_tx(conn, &id),
        None => Ok(None),
    }
}
