//! Mirror freshness detection and sync bookkeeping.
//!
//! The metadata table tracks the mirror as last seen by a successful sync.
//! Staleness detection (should we import?) compares the file against
//! `jsonl_content_hash`, gated by a cheap mtime check; the integrity
//! guard (did something else rewrite the mirror?) compares against
//! `jsonl_file_hash` before an incremental export and demotes it to a
//! full one when they disagree.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::debug;

use crate::config::workspace_dir_name;
use crate::error::Result;
use crate::storage::sqlite::SqliteStorage;

/// Hash of the mirror at the last successful import or export.
pub const META_JSONL_CONTENT_HASH: &str = "jsonl_content_hash";
/// Hash of the mirror at the last known good point; guards incremental
/// export against out-of-band edits.
pub const META_JSONL_FILE_HASH: &str = "jsonl_file_hash";
pub const META_LAST_IMPORT_TIME: &str = "last_import_time";
pub const META_LAST_EXPORT_TIME: &str = "last_export_time";
pub const META_SCHEMA_VERSION: &str = "schema_version";
pub const META_WORKSPACE_ID: &str = "workspace_id";
/// Config-table key for the workspace's issue prefix.
pub const CONFIG_ISSUE_PREFIX: &str = "issue_prefix";

/// SHA-256 of the mirror, line-normalized (each line contributes its
/// bytes plus one `\n`) so a missing final newline does not change the
/// fingerprint.
///
/// # Errors
///
/// `Io` when the file cannot be read.
pub fn mirror_hash(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    for line in reader.lines() {
        hasher.update(line?.as_bytes());
        hasher.update(b"\n");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Should an auto-import run? True when the mirror exists and its content
/// hash differs from `jsonl_content_hash`.
///
/// The hash is only computed when the file's own mtime (symlinks read as
/// symlinks, not their targets) is newer than `last_import_time`; an
/// untouched file short-circuits to false.
///
/// # Errors
///
/// Propagates store and filesystem failures.
pub fn import_needed(storage: &SqliteStorage, mirror_path: &Path) -> Result<bool> {
    if !mirror_path.exists() {
        return Ok(false);
    }

    if let (Some(last_import), Ok(meta)) = (
        storage.get_metadata(META_LAST_IMPORT_TIME)?,
        std::fs::symlink_metadata(mirror_path),
    ) {
        if let (Ok(last_import), Ok(mtime)) =
            (DateTime::parse_from_rfc3339(&last_import), meta.modified())
        {
            let mtime: DateTime<Utc> = mtime.into();
            if mtime <= last_import.with_timezone(&Utc) {
                debug!(path = %mirror_path.display(), "Mirror untouched since last import");
                return Ok(false);
            }
        }
    }

    let current = mirror_hash(mirror_path)?;
    let known = storage.get_metadata(META_JSONL_CONTENT_HASH)?;
    Ok(known.as_deref() != Some(current.as_str()))
}

/// Integrity guard before an incremental export.
///
/// When `jsonl_file_hash` no longer matches the mirror (or the mirror is
/// gone), something outside the engine rewrote it: the export-hash table
/// and the stale key are cleared and the caller must run a full export.
/// Returns true when a full export is required.
///
/// # Errors
///
/// Propagates store and filesystem failures.
pub fn require_full_export(storage: &mut SqliteStorage, mirror_path: &Path) -> Result<bool> {
    let known = storage.get_metadata(META_JSONL_FILE_HASH)?;

    let diverged = if mirror_path.exists() {
        match &known {
            Some(known_hash) => mirror_hash(mirror_path)? != *known_hash,
            None => true,
        }
    } else {
        true
    };

    if diverged {
        debug!(path = %mirror_path.display(), "Mirror diverged out-of-band, forcing full export");
        storage.clear_all_export_hashes()?;
        storage.delete_metadata(META_JSONL_FILE_HASH)?;
    }
    Ok(diverged)
}

/// Infer the issue prefix on cold start.
///
/// Order: the stored `issue_prefix` config; the unique common prefix of
/// every ID in the mirror; the workspace directory's name.
///
/// # Errors
///
/// Propagates store and filesystem failures; a malformed mirror line is
/// skipped rather than fatal (inference is best-effort).
pub fn infer_issue_prefix(
    storage: &SqliteStorage,
    mirror_path: &Path,
    workspace_dir: &Path,
) -> Result<String> {
    if let Some(prefix) = storage.get_config(CONFIG_ISSUE_PREFIX)? {
        if !prefix.is_empty() {
            return Ok(prefix);
        }
    }

    if mirror_path.exists() {
        let mut prefixes: HashSet<String> = HashSet::new();
        let reader = BufReader::new(File::open(mirror_path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(record) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            if let Some(id) = record.get("id").and_then(|v| v.as_str()) {
                if let Ok(parsed) = crate::util::id::parse_id(id) {
                    prefixes.insert(parsed.prefix);
                }
            }
        }
        if prefixes.len() == 1 {
            if let Some(prefix) = prefixes.into_iter().next() {
                return Ok(prefix);
            }
        }
    }

    Ok(workspace_dir_name(workspace_dir))
}
