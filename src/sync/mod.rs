//! The textual mirror: atomic export and staleness-checked import.
//!
//! The mirror is one JSON object per line, UTF-8, sorted by ID, with a
//! newline after every record. It is the representation the user's
//! version-control workflow tracks; this module keeps it convergent with
//! the relational store without ever invoking a version-control tool.
//!
//! Export never touches the live mirror until the new snapshot is fully
//! on disk: temp sibling, flush, fsync, atomic rename. Import parses and
//! resolves the whole file before the single transaction that applies it;
//! any failure leaves the store byte-for-byte unchanged.

pub mod collision;
pub mod freshness;
pub mod lock;
pub mod path;

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{BeadsError, Result};
use crate::model::Issue;
use crate::storage::sqlite::{
    SqliteStorage, merge_comments_tx, replace_dependencies_tx, replace_labels_tx,
    set_metadata_tx, upsert_issue_row_tx,
};
use crate::util::hash::content_hash;
use collision::{Resolution, SkipReason};
use freshness::{
    META_JSONL_CONTENT_HASH, META_JSONL_FILE_HASH, META_LAST_EXPORT_TIME, META_LAST_IMPORT_TIME,
};
use lock::SyncLock;

pub use collision::{ImportOptions, ImportOutcome};
pub use lock::SyncLock as WorkspaceSyncLock;

/// Line prefixes that mark an unresolved merge in the mirror.
const MERGE_MARKERS: &[&str] = &["<<<<<<<", "=======", ">>>>>>>"];

/// Parse buffer: mirrors are line-oriented and can be large.
const READ_BUFFER: usize = 2 * 1024 * 1024;

/// Export policy knobs.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Workspace root; the path allowlist and the sync lock live here.
    pub workspace_dir: PathBuf,
    /// Override the empty-store and stale-store refusals.
    pub force: bool,
    /// Write the mirror 0644 for shared workspaces instead of 0600.
    pub shared_workspace: bool,
}

impl ExportOptions {
    #[must_use]
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            force: false,
            shared_workspace: false,
        }
    }
}

/// What an export run did.
#[derive(Debug, Clone, Default)]
pub struct ExportSummary {
    /// IDs written to the mirror, in file order.
    pub written_ids: Vec<String>,
    /// Dirty IDs skipped because their content hash matched the last
    /// export (their dirty bits are cleared anyway).
    pub skipped_unchanged: Vec<String>,
    /// Hash of the mirror after the write; `None` when nothing was
    /// written.
    pub mirror_hash: Option<String>,
    pub wrote_file: bool,
}

/// Reject any mirror containing unresolved merge markers, naming the file
/// and first offending line.
///
/// # Errors
///
/// `CorruptInput` on the first marker; `Io` on read failure.
pub fn ensure_no_merge_markers(mirror_path: &Path) -> Result<()> {
    let file = File::open(mirror_path)?;
    let reader = BufReader::with_capacity(READ_BUFFER, file);
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if let Some(marker) = MERGE_MARKERS.iter().find(|m| line.starts_with(**m)) {
            return Err(BeadsError::corrupt_input(
                mirror_path,
                Some(index + 1),
                format!("unresolved merge marker '{marker}'"),
            ));
        }
    }
    Ok(())
}

/// Parse every record in the mirror. Blank lines are tolerated; anything
/// else malformed fails the whole read.
///
/// # Errors
///
/// `CorruptInput` with the offending line number; `Io` on read failure.
pub fn read_mirror_records(mirror_path: &Path) -> Result<Vec<Issue>> {
    let file = File::open(mirror_path)?;
    let reader = BufReader::with_capacity(READ_BUFFER, file);
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let issue: Issue = serde_json::from_str(&line).map_err(|err| {
            BeadsError::corrupt_input(mirror_path, Some(index + 1), format!("invalid JSON: {err}"))
        })?;
        records.push(issue);
    }
    Ok(records)
}

/// Best-effort ID extraction for the stale-store guard; unparseable lines
/// are skipped rather than fatal.
///
/// # Errors
///
/// `Io` on read failure. A missing file reads as empty.
pub fn mirror_issue_ids(mirror_path: &Path) -> Result<HashSet<String>> {
    if !mirror_path.exists() {
        return Ok(HashSet::new());
    }
    let file = File::open(mirror_path)?;
    let reader = BufReader::with_capacity(READ_BUFFER, file);
    let mut ids = HashSet::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
            if let Some(id) = value.get("id").and_then(|v| v.as_str()) {
                ids.insert(id.to_string());
            }
        }
    }
    Ok(ids)
}

fn count_mirror_records(mirror_path: &Path) -> Result<usize> {
    if !mirror_path.exists() {
        return Ok(0);
    }
    let file = File::open(mirror_path)?;
    let reader = BufReader::with_capacity(READ_BUFFER, file);
    let mut count = 0;
    for line in reader.lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Full export: the complete exportable set (ephemerals out, tombstones
/// in, sorted by ID) replaces the mirror atomically.
///
/// Refusals without `force`: an empty store over a non-empty mirror, and
/// a store that would silently drop IDs the mirror still carries.
///
/// # Errors
///
/// `PathUnsafe`, `Conflict` (refusals), `Io`, or database failures. On
/// any write failure the temp file is removed and the mirror untouched.
pub fn export_full(
    storage: &mut SqliteStorage,
    mirror_path: &Path,
    opts: &ExportOptions,
) -> Result<ExportSummary> {
    let resolved = path::resolve_mirror_path(mirror_path, &opts.workspace_dir)?;
    let _lock = SyncLock::acquire(&opts.workspace_dir)?;

    let mut issues = storage.issues_for_export()?;

    if issues.is_empty() && !opts.force {
        let existing = count_mirror_records(&resolved)?;
        if existing > 0 {
            return Err(BeadsError::conflict(format!(
                "refusing to overwrite mirror holding {existing} record(s) from an empty store; \
                 pass force to override"
            )));
        }
    }

    if !opts.force && resolved.exists() {
        let mirror_ids = mirror_issue_ids(&resolved)?;
        let store_ids: HashSet<String> = issues.iter().map(|issue| issue.id.clone()).collect();
        let mut missing: Vec<&String> = mirror_ids.difference(&store_ids).collect();
        if !missing.is_empty() {
            missing.sort();
            let preview: Vec<&str> = missing.iter().take(10).map(|s| s.as_str()).collect();
            return Err(BeadsError::conflict(format!(
                "refusing stale export: {} mirror record(s) absent from the store ({}{}); \
                 import first or pass force",
                missing.len(),
                preview.join(", "),
                if missing.len() > 10 { ", ..." } else { "" }
            )));
        }
    }

    // Stored hashes are advisory; the mirror gets freshly computed ones.
    for issue in &mut issues {
        issue.content_hash = Some(content_hash(issue));
    }

    let mirror_hash = write_snapshot(&issues, &resolved, opts)?;

    let written_ids: Vec<String> = issues.iter().map(|issue| issue.id.clone()).collect();
    let hash_entries: Vec<(String, String)> = issues
        .iter()
        .map(|issue| {
            (
                issue.id.clone(),
                issue.content_hash.clone().unwrap_or_default(),
            )
        })
        .collect();
    finish_export(storage, &written_ids, &hash_entries, &mirror_hash)?;

    debug!(count = written_ids.len(), path = %resolved.display(), "Full export complete");
    Ok(ExportSummary {
        written_ids,
        skipped_unchanged: Vec::new(),
        mirror_hash: Some(mirror_hash),
        wrote_file: true,
    })
}

/// Incremental export: consult the dirty set, skip entries whose content
/// hash matches the last export (clearing their dirty bits), and rewrite
/// the mirror only when something real changed.
///
/// When the mirror has been modified out-of-band since the last sync the
/// integrity guard clears the export hashes and a full export runs
/// instead.
///
/// # Errors
///
/// As [`export_full`].
pub fn export_incremental(
    storage: &mut SqliteStorage,
    mirror_path: &Path,
    opts: &ExportOptions,
) -> Result<ExportSummary> {
    let resolved = path::resolve_mirror_path(mirror_path, &opts.workspace_dir)?;

    if freshness::require_full_export(storage, &resolved)? {
        return export_full(storage, mirror_path, opts);
    }

    let dirty = storage.dirty_issue_ids()?;
    if dirty.is_empty() {
        return Ok(ExportSummary::default());
    }

    let mut changed: Vec<String> = Vec::new();
    let mut skipped_unchanged: Vec<String> = Vec::new();
    for issue_id in &dirty {
        let Some(mut issue) = storage.get_issue_any(issue_id)? else {
            // Hard-deleted since marking; nothing to export.
            skipped_unchanged.push(issue_id.clone());
            continue;
        };
        if issue.ephemeral {
            skipped_unchanged.push(issue_id.clone());
            continue;
        }
        issue.content_hash = Some(content_hash(&issue));
        if storage.export_hash(issue_id)? == issue.content_hash {
            skipped_unchanged.push(issue_id.clone());
        } else {
            changed.push(issue_id.clone());
        }
    }

    if changed.is_empty() {
        storage.clear_dirty(&skipped_unchanged)?;
        debug!("Incremental export: nothing changed");
        return Ok(ExportSummary {
            skipped_unchanged,
            ..Default::default()
        });
    }

    let _lock = SyncLock::acquire(&opts.workspace_dir)?;

    let mut issues = storage.issues_for_export()?;
    for issue in &mut issues {
        issue.content_hash = Some(content_hash(issue));
    }
    let mirror_hash = write_snapshot(&issues, &resolved, opts)?;

    let written_ids: Vec<String> = issues.iter().map(|issue| issue.id.clone()).collect();
    let hash_entries: Vec<(String, String)> = issues
        .iter()
        .map(|issue| {
            (
                issue.id.clone(),
                issue.content_hash.clone().unwrap_or_default(),
            )
        })
        .collect();
    finish_export(storage, &written_ids, &hash_entries, &mirror_hash)?;
    storage.clear_dirty(&skipped_unchanged)?;

    debug!(
        written = written_ids.len(),
        skipped = skipped_unchanged.len(),
        "Incremental export complete"
    );
    Ok(ExportSummary {
        written_ids,
        skipped_unchanged,
        mirror_hash: Some(mirror_hash),
        wrote_file: true,
    })
}

/// Serialize the snapshot to a temp sibling, fsync, and rename into
/// place. Returns the line-normalized hash of the written content.
fn write_snapshot(issues: &[Issue], target: &Path, opts: &ExportOptions) -> Result<String> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path::temp_sibling(target)?;

    let result = (|| -> Result<String> {
        let mut open_options = OpenOptions::new();
        open_options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open_options.mode(if opts.shared_workspace { 0o644 } else { 0o600 });
        }
        let file = open_options.open(&temp_path)?;
        let mut writer = BufWriter::new(file);
        let mut hasher = Sha256::new();

        for issue in issues {
            let json = serde_json::to_string(issue)?;
            writeln!(writer, "{json}")?;
            hasher.update(json.as_bytes());
            hasher.update(b"\n");
        }

        writer.flush()?;
        writer
            .into_inner()
            .map_err(|err| BeadsError::Io(err.into_error()))?
            .sync_all()?;

        fs::rename(&temp_path, target)?;

        // Verify the rename landed what we wrote.
        let on_disk = count_mirror_records(target)?;
        if on_disk != issues.len() {
            return Err(BeadsError::Io(std::io::Error::other(format!(
                "export verification failed: wrote {} record(s), mirror has {on_disk}",
                issues.len()
            ))));
        }
        Ok(format!("{:x}", hasher.finalize()))
    })();

    if result.is_err() {
        if let Err(cleanup) = fs::remove_file(&temp_path) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %temp_path.display(), error = %cleanup, "Temp file cleanup failed");
            }
        }
    }
    result
}

/// Post-write bookkeeping: export hashes for everything written, sync
/// metadata, and dirty bits for exactly the written IDs.
fn finish_export(
    storage: &mut SqliteStorage,
    written_ids: &[String],
    hash_entries: &[(String, String)],
    mirror_hash: &str,
) -> Result<()> {
    storage.set_export_hashes(hash_entries)?;
    storage.set_metadata(META_JSONL_CONTENT_HASH, mirror_hash)?;
    storage.set_metadata(META_JSONL_FILE_HASH, mirror_hash)?;
    storage.set_metadata(META_LAST_EXPORT_TIME, &Utc::now().to_rfc3339())?;
    storage.clear_dirty(written_ids)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

/// Import the mirror into the store.
///
/// Pipeline: path check, sync lock, merge-marker scan, strict parse,
/// batch preparation (normalize, duplicate and prefix policy, orphan
/// policy), then one transaction that clears the export hashes, runs the
/// collision ladder per record, applies the survivors, rebuilds the
/// blocked cache, and stamps the sync metadata. Any error rolls the
/// store back untouched.
///
/// # Errors
///
/// `PathUnsafe`, `CorruptInput`, `PrefixMismatch`, `Conflict`,
/// validation, or database failures.
pub fn import_mirror(
    storage: &mut SqliteStorage,
    mirror_path: &Path,
    workspace_dir: &Path,
    opts: &ImportOptions,
) -> Result<ImportOutcome> {
    let resolved = path::resolve_mirror_path(mirror_path, workspace_dir)?;
    let _lock = SyncLock::acquire(workspace_dir)?;

    ensure_no_merge_markers(&resolved)?;
    let mut records = read_mirror_records(&resolved)?;

    let mut outcome = ImportOutcome::default();

    // Ephemerals have no business in a mirror; drop them if present.
    let before = records.len();
    records.retain(|record| !record.ephemeral);
    outcome.skipped_ephemeral = before - records.len();

    let mut prepared = collision::prepare_batch(
        records,
        opts,
        &resolved,
        |id| storage.id_exists(id).unwrap_or(false),
        &mut outcome,
    )?;

    let placeholders = collision::handle_orphans(
        storage.conn(),
        &mut prepared,
        opts.orphan_handling,
        &mut outcome,
    )?;
    // Placeholder parents go first so children never apply before them.
    let batch: Vec<Issue> = placeholders.into_iter().chain(prepared).collect();

    let file_hash = freshness::mirror_hash(&resolved)?;

    let run = storage.mutate("import", |tx, ctx| {
        let mut run = ImportOutcome::default();

        tx.execute("DELETE FROM export_hashes", [])?;

        // Pass 1: resolve every record and learn the in-batch renames
        // (phase-1b content matches under other IDs).
        let mut plans: Vec<(Issue, Resolution)> = Vec::with_capacity(batch.len());
        let mut renames: HashMap<String, String> = HashMap::new();
        for record in &batch {
            let resolution = collision::resolve_record(tx, record, opts)?;
            if let Resolution::Update { merged } = &resolution {
                if merged.id != record.id {
                    renames.insert(record.id.clone(), merged.id.clone());
                }
            }
            plans.push((record.clone(), resolution));
        }

        // Pass 2: point dependency edges at the surviving IDs.
        if !renames.is_empty() {
            for (record, _) in &mut plans {
                for dep in &mut record.dependencies {
                    if let Some(new_id) = renames.get(&dep.depends_on_id) {
                        dep.depends_on_id = new_id.clone();
                    }
                    if let Some(new_id) = renames.get(&dep.issue_id) {
                        dep.issue_id = new_id.clone();
                    }
                }
            }
        }

        // Pass 3: apply.
        for (record, resolution) in plans {
            match resolution {
                Resolution::Create => {
                    upsert_issue_row_tx(tx, &record)?;
                    replace_labels_tx(tx, &record.id, &record.labels)?;
                    replace_dependencies_tx(tx, &record.id, &record.dependencies)?;
                    merge_comments_tx(tx, &record.id, &record.comments)?;
                    run.created += 1;
                }
                Resolution::Update { mut merged } => {
                    merged.dependencies = record.dependencies.clone();
                    for dep in &mut merged.dependencies {
                        dep.issue_id = merged.id.clone();
                    }
                    upsert_issue_row_tx(tx, &merged)?;
                    replace_labels_tx(tx, &merged.id, &merged.labels)?;
                    replace_dependencies_tx(tx, &merged.id, &merged.dependencies)?;
                    merge_comments_tx(tx, &merged.id, &merged.comments)?;
                    run.updated += 1;
                }
                Resolution::Noop { target_id } => {
                    // Content is identical; comments are not hashed, so
                    // still merge any the record carries.
                    merge_comments_tx(tx, &target_id, &record.comments)?;
                    run.unchanged += 1;
                }
                Resolution::Skip { reason } => match reason {
                    SkipReason::Tombstone => run.skipped_tombstone += 1,
                    SkipReason::Stale | SkipReason::CrossProjectDuplicate => {
                        run.skipped_stale += 1;
                    }
                    SkipReason::Protected => run.skipped_protected += 1,
                },
            }
        }
        run.renamed = renames;

        set_metadata_tx(tx, META_LAST_IMPORT_TIME, &Utc::now().to_rfc3339())?;
        set_metadata_tx(tx, META_JSONL_CONTENT_HASH, &file_hash)?;
        set_metadata_tx(tx, META_JSONL_FILE_HASH, &file_hash)?;

        ctx.refresh_blocked_cache();
        Ok(run)
    })?;

    outcome.created = run.created;
    outcome.updated = run.updated;
    outcome.unchanged = run.unchanged;
    outcome.skipped_stale = run.skipped_stale;
    outcome.skipped_tombstone = run.skipped_tombstone;
    outcome.skipped_protected = run.skipped_protected;
    outcome.renamed.extend(run.renamed);

    debug!(
        created = outcome.created,
        updated = outcome.updated,
        unchanged = outcome.unchanged,
        "Import complete"
    );
    Ok(outcome)
}
