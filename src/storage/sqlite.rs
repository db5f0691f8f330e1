//! SQLite entity store.
//!
//! One connection, one writer. Every mutating operation runs through
//! [`SqliteStorage::mutate`]: an IMMEDIATE transaction inside which the
//! operation validates, writes rows, queues audit events, queues dirty
//! marks, and optionally requests a blocked-cache rebuild. The queued side
//! effects are flushed inside the same transaction, so observers see all
//! of an operation or none of it.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{BeadsError, ErrorKind, Result};
use crate::model::{Comment, Dependency, DependencyType, Event, EventType, Issue, IssueType, Priority, Status};
use crate::storage::events::insert_event;
use crate::storage::graph;
use crate::storage::schema;
use crate::util::hash::content_hash;
use crate::util::id;
use crate::util::id::{IdConfig, IdGenerator, hash_portion};
use crate::validation::{
    CommentValidator, DependencyStore, DependencyValidator, IssueValidator, LabelValidator,
    is_external_target,
};

/// Bounded retries for write-lock contention, on top of SQLite's own busy
/// timeout. Delays double from 10 ms and cap at 5 s.
const MAX_WRITE_ATTEMPTS: u32 = 12;
const BACKOFF_START: Duration = Duration::from_millis(10);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

pub(crate) const ISSUE_COLUMNS: &str = "id, content_hash, title, description, design, acceptance_criteria, notes, \
     status, priority, issue_type, assignee, owner, estimated_minutes, \
     created_at, created_by, updated_at, closed_at, close_reason, closed_by_session, \
     due_at, defer_until, external_ref, source_system, \
     deleted_at, deleted_by, delete_reason, original_type, \
     ephemeral, pinned, is_template";

/// The SQLite-backed store.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
}

/// Side effects queued by a mutation, flushed atomically at commit.
pub struct MutationContext {
    actor: String,
    events: Vec<Event>,
    dirty: BTreeSet<String>,
    refresh_blocked_cache: bool,
}

impl MutationContext {
    fn new(actor: &str) -> Self {
        Self {
            actor: actor.to_string(),
            events: Vec::new(),
            dirty: BTreeSet::new(),
            refresh_blocked_cache: false,
        }
    }

    /// Queue an audit event for `issue_id`.
    pub fn record(
        &mut self,
        event_type: EventType,
        issue_id: &str,
        old_value: Option<String>,
        new_value: Option<String>,
        comment: Option<String>,
    ) {
        self.events.push(Event {
            id: 0,
            issue_id: issue_id.to_string(),
            event_type,
            actor: self.actor.clone(),
            old_value,
            new_value,
            comment,
            created_at: Utc::now(),
        });
    }

    /// Queue a dirty mark (pending export) for `issue_id`.
    pub fn mark_dirty(&mut self, issue_id: &str) {
        self.dirty.insert(issue_id.to_string());
    }

    /// Request a blocked-cache rebuild before commit.
    pub fn refresh_blocked_cache(&mut self) {
        self.refresh_blocked_cache = true;
    }
}

impl SqliteStorage {
    /// Open (creating if needed) the store at `path`, applying pragmas and
    /// outstanding migrations.
    ///
    /// # Errors
    ///
    /// Connection, pragma, or migration failures.
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        schema::apply_pragmas(&conn)?;
        schema::migrate(&mut conn)?;
        stamp_identity(&conn, &path.display().to_string())?;
        Ok(Self { conn })
    }

    /// In-memory store for tests. WAL is unavailable there; the journal
    /// fallback covers it.
    ///
    /// # Errors
    ///
    /// Connection or migration failures.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        schema::apply_pragmas(&conn)?;
        schema::migrate(&mut conn)?;
        stamp_identity(&conn, ":memory:")?;
        Ok(Self { conn })
    }

    /// Direct connection access for sibling storage modules.
    #[must_use]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Run a mutation inside an IMMEDIATE transaction, retrying the whole
    /// attempt with exponential backoff while the database is locked.
    ///
    /// The closure may run more than once; it must confine its side
    /// effects to the transaction and context it is handed.
    ///
    /// # Errors
    ///
    /// `Locked` once the backoff budget is spent; otherwise whatever the
    /// closure or the flush surfaces. On any error the transaction rolls
    /// back and no queued side effect escapes.
    pub fn mutate<F, R>(&mut self, actor: &str, mut f: F) -> Result<R>
    where
        F: FnMut(&Transaction<'_>, &mut MutationContext) -> Result<R>,
    {
        let mut delay = BACKOFF_START;
        let mut attempt = 0;
        loop {
            match self.mutate_once(actor, &mut f) {
                Err(err) if err.kind() == ErrorKind::Locked && attempt < MAX_WRITE_ATTEMPTS => {
                    attempt += 1;
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "Write lock busy, backing off");
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
                other => return other,
            }
        }
    }

    fn mutate_once<F, R>(&mut self, actor: &str, f: &mut F) -> Result<R>
    where
        F: FnMut(&Transaction<'_>, &mut MutationContext) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut ctx = MutationContext::new(actor);

        let result = f(&tx, &mut ctx)?;

        for event in &ctx.events {
            insert_event(&tx, event)?;
        }
        let now = Utc::now().to_rfc3339();
        for issue_id in &ctx.dirty {
            tx.execute(
                "INSERT INTO dirty_issues (issue_id, marked_at) VALUES (?, ?)
                 ON CONFLICT(issue_id) DO UPDATE SET marked_at = excluded.marked_at",
                rusqlite::params![issue_id, now],
            )?;
        }
        if ctx.refresh_blocked_cache {
            graph::rebuild_blocked_cache_tx(&tx)?;
        }

        tx.commit()?;
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Issue CRUD
    // ------------------------------------------------------------------

    /// Create an issue.
    ///
    /// When `issue.id` is empty an ID is generated: a dotted child ID if
    /// `parent` is given (consuming the parent's child counter), otherwise
    /// an adaptive-length hash ID. Explicit IDs are prefix-validated.
    /// Initial labels and dependencies on the input are validated and
    /// written in the same transaction.
    ///
    /// # Errors
    ///
    /// Validation, prefix, cycle, or database failures.
    pub fn create_issue(
        &mut self,
        mut issue: Issue,
        parent: Option<&str>,
        id_config: &IdConfig,
        allowed_prefixes: &[String],
        actor: &str,
    ) -> Result<Issue> {
        issue.title = issue.title.trim().to_string();

        if issue.id.is_empty() {
            if let Some(parent_id) = parent {
                if !self.id_exists(parent_id)? {
                    return Err(BeadsError::IssueNotFound {
                        id: parent_id.to_string(),
                    });
                }
            } else {
                let generator = IdGenerator::new(id_config.clone());
                let count = self.count_top_level_issues()?;
                issue.id = generator.generate(
                    &issue.title,
                    issue.description.as_deref(),
                    issue.created_by.as_deref(),
                    issue.created_at,
                    count,
                    |candidate| self.id_exists(candidate).unwrap_or(true),
                )?;
            }
        } else {
            id::validate_prefix(&issue.id, &id_config.prefix, allowed_prefixes)?;
        }

        let generator = IdGenerator::new(id_config.clone());
        let initial_labels = std::mem::take(&mut issue.labels);
        let initial_deps = std::mem::take(&mut issue.dependencies);
        for label in &initial_labels {
            LabelValidator::validate(label)?;
        }

        let created = self.mutate(actor, |tx, ctx| {
            let mut issue = issue.clone();

            if issue.id.is_empty() {
                let parent_id = parent.unwrap_or_default();
                let next = next_child_number_tx(tx, parent_id)?;
                issue.id = generator.child_of(parent_id, next)?;
            }

            if id_exists_tx(tx, &issue.id)? {
                return Err(BeadsError::validation(
                    "id",
                    format!("issue ID already exists: {}", issue.id),
                ));
            }

            issue.labels = initial_labels.clone();
            issue.dependencies = initial_deps
                .iter()
                .cloned()
                .map(|mut dep| {
                    dep.issue_id = issue.id.clone();
                    dep
                })
                .collect();
            issue.content_hash = Some(content_hash(&issue));

            IssueValidator::validate(&issue).map_err(BeadsError::from_validation_errors)?;

            insert_issue_row_tx(tx, &issue)?;
            for label in &issue.labels {
                tx.execute(
                    "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)",
                    rusqlite::params![issue.id, label],
                )?;
            }

            let view = TxStore { conn: tx };
            let mut any_blocking = false;
            for dep in &issue.dependencies {
                DependencyValidator::validate(dep, &view)?;
                insert_dependency_row_tx(tx, dep)?;
                any_blocking |= dep.dep_type.is_blocking();
                ctx.record(
                    EventType::DependencyAdded,
                    &issue.id,
                    None,
                    Some(format!("{} ({})", dep.depends_on_id, dep.dep_type)),
                    None,
                );
            }

            ctx.record(EventType::Created, &issue.id, None, None, None);
            ctx.mark_dirty(&issue.id);
            if any_blocking {
                ctx.refresh_blocked_cache();
            }
            Ok(issue)
        })?;

        Ok(created)
    }

    /// Fetch an issue with relations loaded. Tombstones are invisible
    /// here; use [`Self::get_issue_any`] to see them.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn get_issue(&self, issue_id: &str) -> Result<Option<Issue>> {
        match self.get_issue_any(issue_id)? {
            Some(issue) if issue.is_tombstone() => Ok(None),
            other => Ok(other),
        }
    }

    /// Fetch an issue including tombstones, relations loaded.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn get_issue_any(&self, issue_id: &str) -> Result<Option<Issue>> {
        let Some(mut issue) = get_issue_row_tx(&self.conn, issue_id)? else {
            return Ok(None);
        };
        load_relations_tx(&self.conn, &mut issue)?;
        Ok(Some(issue))
    }

    /// Resolve a partial ID (exact, prefix-normalized, hash, or
    /// substring) and fetch the issue.
    ///
    /// # Errors
    ///
    /// `AmbiguousId` with candidates, `NotFound`, or database failures.
    pub fn get_by_prefix(&self, partial: &str, default_prefix: &str) -> Result<Issue> {
        let resolved = id::resolve_id(partial, default_prefix, self)?;
        self.get_issue(&resolved)?
            .ok_or(BeadsError::IssueNotFound { id: resolved })
    }

    /// Apply a field patch.
    ///
    /// `closed_at` and `close_reason` are managed automatically when the
    /// status crosses the closed boundary. Setting `status = tombstone`
    /// through this path is rejected; deletion has its own operation.
    /// One event is emitted per observable change.
    ///
    /// # Errors
    ///
    /// `NotFound` for absent or tombstoned issues; validation or database
    /// failures otherwise.
    pub fn update_issue(&mut self, issue_id: &str, patch: &IssuePatch, actor: &str) -> Result<Issue> {
        if patch.status == Some(Status::Tombstone) {
            return Err(BeadsError::validation(
                "status",
                "tombstone is set via delete, not update",
            ));
        }

        let updated = self.mutate(actor, |tx, ctx| {
            let Some(mut issue) = get_issue_row_tx(tx, issue_id)? else {
                return Err(BeadsError::IssueNotFound {
                    id: issue_id.to_string(),
                });
            };
            if issue.is_tombstone() {
                return Err(BeadsError::IssueNotFound {
                    id: issue_id.to_string(),
                });
            }
            load_relations_tx(tx, &mut issue)?;

            let before = issue.clone();
            apply_patch(&mut issue, patch);

            let status_changed = before.status != issue.status;
            if status_changed {
                let was_closed = before.status == Status::Closed;
                let now_closed = issue.status == Status::Closed;
                if now_closed && !was_closed {
                    issue.closed_at = Some(Utc::now());
                } else if !now_closed {
                    issue.closed_at = None;
                    if was_closed {
                        issue.close_reason = None;
                    }
                }
            }

            issue.updated_at = Utc::now();
            issue.title = issue.title.trim().to_string();
            issue.content_hash = Some(content_hash(&issue));

            IssueValidator::validate(&issue).map_err(BeadsError::from_validation_errors)?;
            update_issue_row_tx(tx, &issue)?;

            if status_changed {
                let event_type = match (&before.status, &issue.status) {
                    (_, Status::Closed) => EventType::Closed,
                    (Status::Closed, _) => EventType::Reopened,
                    _ => EventType::StatusChanged,
                };
                ctx.record(
                    event_type,
                    issue_id,
                    Some(before.status.as_str().to_string()),
                    Some(issue.status.as_str().to_string()),
                    issue.close_reason.clone(),
                );
                ctx.refresh_blocked_cache();
            }
            for (field, old, new) in field_diffs(&before, &issue) {
                ctx.record(EventType::Updated, issue_id, old, new, Some(field));
            }

            ctx.mark_dirty(issue_id);
            Ok(issue)
        })?;

        Ok(updated)
    }

    /// Close an issue.
    ///
    /// Unless `force` is set, closing is refused while an open blocker
    /// holds the issue (kind `conflict`); policy on when to force is the
    /// caller's.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Conflict`, or database failures.
    pub fn close_issue(
        &mut self,
        issue_id: &str,
        reason: Option<&str>,
        session: Option<&str>,
        force: bool,
        actor: &str,
    ) -> Result<Issue> {
        let closed = self.mutate(actor, |tx, ctx| {
            let Some(mut issue) = get_issue_row_tx(tx, issue_id)? else {
                return Err(BeadsError::IssueNotFound {
                    id: issue_id.to_string(),
                });
            };
            if issue.is_tombstone() {
                return Err(BeadsError::IssueNotFound {
                    id: issue_id.to_string(),
                });
            }

            if !force {
                let blockers = open_blockers_tx(tx, issue_id)?;
                if !blockers.is_empty() {
                    return Err(BeadsError::conflict(format!(
                        "{issue_id} is blocked by open issues: {}",
                        blockers.join(", ")
                    )));
                }
            }

            load_relations_tx(tx, &mut issue)?;
            let old_status = issue.status.clone();
            issue.status = Status::Closed;
            issue.closed_at = Some(Utc::now());
            issue.close_reason = reason.map(ToString::to_string);
            issue.closed_by_session = session.map(ToString::to_string);
            issue.updated_at = Utc::now();
            issue.content_hash = Some(content_hash(&issue));
            update_issue_row_tx(tx, &issue)?;

            ctx.record(
                EventType::Closed,
                issue_id,
                Some(old_status.as_str().to_string()),
                Some("closed".to_string()),
                reason.map(ToString::to_string),
            );
            ctx.mark_dirty(issue_id);
            ctx.refresh_blocked_cache();
            Ok(issue)
        })?;

        Ok(closed)
    }

    /// Reopen a closed issue: back to `open`, close fields cleared.
    ///
    /// # Errors
    ///
    /// `NotFound` (tombstones included) or database failures.
    pub fn reopen_issue(&mut self, issue_id: &str, actor: &str) -> Result<Issue> {
        let reopened = self.mutate(actor, |tx, ctx| {
            let Some(mut issue) = get_issue_row_tx(tx, issue_id)? else {
                return Err(BeadsError::IssueNotFound {
                    id: issue_id.to_string(),
                });
            };
            if issue.is_tombstone() {
                return Err(BeadsError::IssueNotFound {
                    id: issue_id.to_string(),
                });
            }

            load_relations_tx(tx, &mut issue)?;
            let old_status = issue.status.clone();
            issue.status = Status::Open;
            issue.closed_at = None;
            issue.close_reason = None;
            issue.closed_by_session = None;
            issue.updated_at = Utc::now();
            issue.content_hash = Some(content_hash(&issue));
            update_issue_row_tx(tx, &issue)?;

            ctx.record(
                EventType::Reopened,
                issue_id,
                Some(old_status.as_str().to_string()),
                Some("open".to_string()),
                None,
            );
            ctx.mark_dirty(issue_id);
            ctx.refresh_blocked_cache();
            Ok(issue)
        })?;

        Ok(reopened)
    }

    /// Soft delete: transition to `tombstone`, preserving the original
    /// kind. Tombstones stay in the store and the mirror so the deletion
    /// propagates to clones.
    ///
    /// # Errors
    ///
    /// `NotFound` (also for already-deleted issues) or database failures.
    pub fn delete_issue(
        &mut self,
        issue_id: &str,
        deleted_by: &str,
        reason: Option<&str>,
        actor: &str,
    ) -> Result<Issue> {
        self.mutate(actor, |tx, ctx| {
            let Some(mut issue) = get_issue_row_tx(tx, issue_id)? else {
                return Err(BeadsError::IssueNotFound {
                    id: issue_id.to_string(),
                });
            };
            if issue.is_tombstone() {
                return Err(BeadsError::IssueNotFound {
                    id: issue_id.to_string(),
                });
            }

            load_relations_tx(tx, &mut issue)?;
            issue.original_type = Some(issue.issue_type.as_str().to_string());
            issue.status = Status::Tombstone;
            issue.deleted_at = Some(Utc::now());
            issue.deleted_by = Some(deleted_by.to_string());
            issue.delete_reason = reason.map(ToString::to_string);
            issue.updated_at = Utc::now();
            issue.content_hash = Some(content_hash(&issue));
            update_issue_row_tx(tx, &issue)?;

            ctx.record(
                EventType::Deleted,
                issue_id,
                None,
                None,
                reason.map(ToString::to_string),
            );
            ctx.mark_dirty(issue_id);
            ctx.refresh_blocked_cache();
            Ok(issue)
        })
    }

    /// Hard delete. Permitted only for ephemerals that were never exported
    /// (no row in `export_hashes`); the row and all owned relations go.
    /// Nothing is marked dirty: the mirror never saw this issue.
    ///
    /// # Errors
    ///
    /// `Validation` when the guard fails; `NotFound`; database failures.
    pub fn hard_delete_issue(&mut self, issue_id: &str, actor: &str) -> Result<()> {
        self.mutate(actor, |tx, _ctx| {
            let Some(issue) = get_issue_row_tx(tx, issue_id)? else {
                return Err(BeadsError::IssueNotFound {
                    id: issue_id.to_string(),
                });
            };
            if !issue.ephemeral {
                return Err(BeadsError::validation(
                    "id",
                    "hard delete is restricted to ephemeral issues",
                ));
            }
            let exported: bool = tx
                .prepare("SELECT 1 FROM export_hashes WHERE issue_id = ?")?
                .exists([issue_id])?;
            if exported {
                return Err(BeadsError::validation(
                    "id",
                    "issue has been exported; use soft delete so the removal propagates",
                ));
            }

            tx.execute("DELETE FROM issues WHERE id = ?", [issue_id])?;
            tx.execute("DELETE FROM dirty_issues WHERE issue_id = ?", [issue_id])?;
            Ok(())
        })
    }

    /// Reverse a soft delete while the record is still a tombstone
    /// locally: status back to `open`, deletion fields cleared, kind
    /// restored from `original_type`.
    ///
    /// # Errors
    ///
    /// `NotFound` for absent IDs, `Validation` when the issue is not a
    /// tombstone, or database failures.
    pub fn restore_issue(&mut self, issue_id: &str, actor: &str) -> Result<Issue> {
        let restored = self.mutate(actor, |tx, ctx| {
            let Some(mut issue) = get_issue_row_tx(tx, issue_id)? else {
                return Err(BeadsError::IssueNotFound {
                    id: issue_id.to_string(),
                });
            };
            if !issue.is_tombstone() {
                return Err(BeadsError::validation(
                    "status",
                    format!("{issue_id} is not deleted"),
                ));
            }

            load_relations_tx(tx, &mut issue)?;
            if let Some(original) = issue.original_type.take() {
                issue.issue_type = original
                    .parse::<IssueType>()
                    .unwrap_or(IssueType::Task);
            }
            issue.status = Status::Open;
            issue.closed_at = None;
            issue.deleted_at = None;
            issue.deleted_by = None;
            issue.delete_reason = None;
            issue.updated_at = Utc::now();
            issue.content_hash = Some(content_hash(&issue));
            update_issue_row_tx(tx, &issue)?;

            ctx.record(EventType::Restored, issue_id, None, None, None);
            ctx.mark_dirty(issue_id);
            ctx.refresh_blocked_cache();
            Ok(issue)
        })?;

        Ok(restored)
    }

    // ------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------

    /// Add a dependency edge. Blocking types are cycle-checked; both
    /// internal endpoints are marked dirty; the blocked cache refreshes
    /// when readiness may have changed.
    ///
    /// # Errors
    ///
    /// `SelfDependency`, `CycleDetected`, `NotFound`, validation, or
    /// database failures.
    pub fn add_dependency(&mut self, dep: &Dependency, actor: &str) -> Result<()> {
        self.mutate(actor, |tx, ctx| {
            let view = TxStore { conn: tx };
            DependencyValidator::validate(dep, &view)?;
            insert_dependency_row_tx(tx, dep)?;
            touch_issue_tx(tx, &dep.issue_id)?;

            ctx.record(
                EventType::DependencyAdded,
                &dep.issue_id,
                None,
                Some(format!("{} ({})", dep.depends_on_id, dep.dep_type)),
                None,
            );
            ctx.mark_dirty(&dep.issue_id);
            if !is_external_target(&dep.depends_on_id) && id_exists_tx(tx, &dep.depends_on_id)? {
                ctx.mark_dirty(&dep.depends_on_id);
            }
            if dep.dep_type.is_blocking() {
                ctx.refresh_blocked_cache();
            }
            Ok(())
        })
    }

    /// Remove the edge for an ordered pair.
    ///
    /// # Errors
    ///
    /// `NotFound` when no edge links the pair; database failures.
    pub fn remove_dependency(
        &mut self,
        issue_id: &str,
        depends_on_id: &str,
        actor: &str,
    ) -> Result<()> {
        self.mutate(actor, |tx, ctx| {
            let removed_type: Option<String> = tx
                .query_row(
                    "SELECT type FROM dependencies WHERE issue_id = ? AND depends_on_id = ?",
                    rusqlite::params![issue_id, depends_on_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(removed_type) = removed_type else {
                return Err(BeadsError::DependencyNotFound {
                    issue_id: issue_id.to_string(),
                    depends_on_id: depends_on_id.to_string(),
                });
            };

            tx.execute(
                "DELETE FROM dependencies WHERE issue_id = ? AND depends_on_id = ?",
                rusqlite::params![issue_id, depends_on_id],
            )?;
            touch_issue_tx(tx, issue_id)?;

            ctx.record(
                EventType::DependencyRemoved,
                issue_id,
                Some(format!("{depends_on_id} ({removed_type})")),
                None,
                None,
            );
            ctx.mark_dirty(issue_id);
            if !is_external_target(depends_on_id) && id_exists_tx(tx, depends_on_id)? {
                ctx.mark_dirty(depends_on_id);
            }
            if removed_type
                .parse::<DependencyType>()
                .map(|t| t.is_blocking())
                .unwrap_or(false)
            {
                ctx.refresh_blocked_cache();
            }
            Ok(())
        })
    }

    /// Outgoing edges of an issue.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn dependencies_of(&self, issue_id: &str) -> Result<Vec<Dependency>> {
        dependencies_of_tx(&self.conn, issue_id)
    }

    /// Incoming edges (who depends on this issue).
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn dependents_of(&self, issue_id: &str) -> Result<Vec<Dependency>> {
        let mut stmt = self.conn.prepare(
            "SELECT issue_id, depends_on_id, type, created_at, created_by, metadata, thread_id
             FROM dependencies WHERE depends_on_id = ? ORDER BY issue_id",
        )?;
        let deps = stmt
            .query_map([issue_id], dependency_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(deps)
    }

    // ------------------------------------------------------------------
    // Labels
    // ------------------------------------------------------------------

    /// Attach a label. Idempotent: returns `false` when already present.
    /// The `provides:` namespace is refused on this path.
    ///
    /// # Errors
    ///
    /// `ReservedLabel`, `NotFound`, validation, or database failures.
    pub fn add_label(&mut self, issue_id: &str, label: &str, actor: &str) -> Result<bool> {
        LabelValidator::validate(label)?;
        self.mutate(actor, |tx, ctx| {
            if !id_exists_tx(tx, issue_id)? {
                return Err(BeadsError::IssueNotFound {
                    id: issue_id.to_string(),
                });
            }
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)",
                rusqlite::params![issue_id, label],
            )?;
            if inserted > 0 {
                touch_issue_tx(tx, issue_id)?;
                ctx.record(
                    EventType::LabelAdded,
                    issue_id,
                    None,
                    Some(label.to_string()),
                    None,
                );
                ctx.mark_dirty(issue_id);
            }
            Ok(inserted > 0)
        })
    }

    /// Detach a label. Idempotent: returns `false` when absent.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn remove_label(&mut self, issue_id: &str, label: &str, actor: &str) -> Result<bool> {
        self.mutate(actor, |tx, ctx| {
            let removed = tx.execute(
                "DELETE FROM labels WHERE issue_id = ? AND label = ?",
                rusqlite::params![issue_id, label],
            )?;
            if removed > 0 {
                touch_issue_tx(tx, issue_id)?;
                ctx.record(
                    EventType::LabelRemoved,
                    issue_id,
                    Some(label.to_string()),
                    None,
                    None,
                );
                ctx.mark_dirty(issue_id);
            }
            Ok(removed > 0)
        })
    }

    /// Labels of an issue, sorted.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn labels_of(&self, issue_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT label FROM labels WHERE issue_id = ? ORDER BY label")?;
        let labels = stmt
            .query_map([issue_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(labels)
    }

    // ------------------------------------------------------------------
    // Comments
    // ------------------------------------------------------------------

    /// Append a comment. No dedupe here; dedupe happens only on import.
    ///
    /// # Errors
    ///
    /// Validation, `NotFound`, or database failures.
    pub fn add_comment(
        &mut self,
        issue_id: &str,
        author: &str,
        text: &str,
        actor: &str,
    ) -> Result<Comment> {
        CommentValidator::validate_parts(author, text)?;
        self.mutate(actor, |tx, ctx| {
            if !id_exists_tx(tx, issue_id)? {
                return Err(BeadsError::IssueNotFound {
                    id: issue_id.to_string(),
                });
            }
            let created_at = Utc::now();
            tx.execute(
                "INSERT INTO comments (issue_id, author, text, created_at) VALUES (?, ?, ?, ?)",
                rusqlite::params![issue_id, author, text, created_at.to_rfc3339()],
            )?;
            let comment = Comment {
                id: tx.last_insert_rowid(),
                issue_id: issue_id.to_string(),
                author: author.to_string(),
                body: text.to_string(),
                created_at,
            };
            ctx.record(EventType::Commented, issue_id, None, None, None);
            ctx.mark_dirty(issue_id);
            Ok(comment)
        })
    }

    /// Comments of an issue, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn comments_of(&self, issue_id: &str) -> Result<Vec<Comment>> {
        comments_of_tx(&self.conn, issue_id)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Audit trail of one issue, newest first.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn events_for_issue(&self, issue_id: &str, limit: usize) -> Result<Vec<Event>> {
        crate::storage::events::events_for_issue(&self.conn, issue_id, limit)
    }

    /// Global audit feed after a timestamp, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn events_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Event>> {
        crate::storage::events::events_since(&self.conn, since, limit)
    }

    // ------------------------------------------------------------------
    // Lookup helpers
    // ------------------------------------------------------------------

    /// Whether an ID exists (tombstones included).
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn id_exists(&self, issue_id: &str) -> Result<bool> {
        id_exists_tx(&self.conn, issue_id)
    }

    /// Count of root issues (no dotted child path); the population the ID
    /// length bound is computed against.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn count_top_level_issues(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM issues WHERE id NOT LIKE '%.%'",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Count of all issues, tombstones included.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn count_issues(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM issues", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Every issue ID in the store.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn all_issue_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT id FROM issues ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Non-tombstone issue carrying this external ref, relations loaded.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn find_by_external_ref(&self, external_ref: &str) -> Result<Option<Issue>> {
        let id: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM issues WHERE external_ref = ?",
                [external_ref],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => self.get_issue_any(&id),
            None => Ok(None),
        }
    }

    /// Any issue whose stored content hash equals `hash`.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn find_by_content_hash(&self, hash: &str) -> Result<Option<Issue>> {
        let id: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM issues WHERE content_hash = ? LIMIT 1",
                [hash],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => self.get_issue_any(&id),
            None => Ok(None),
        }
    }

    /// Whether the stored record is a tombstone.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn is_tombstone(&self, issue_id: &str) -> Result<bool> {
        let status: Option<String> = self
            .conn
            .query_row("SELECT status FROM issues WHERE id = ?", [issue_id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(status.as_deref() == Some("tombstone"))
    }

    // ------------------------------------------------------------------
    // Dirty & export-hash tracking
    // ------------------------------------------------------------------

    /// IDs with pending exports, in FIFO order of marking.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn dirty_issue_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT issue_id FROM dirty_issues ORDER BY marked_at, issue_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Clear dirty marks for exactly these IDs.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn clear_dirty(&mut self, issue_ids: &[String]) -> Result<usize> {
        let mut cleared = 0;
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM dirty_issues WHERE issue_id = ?")?;
            for issue_id in issue_ids {
                cleared += stmt.execute([issue_id])?;
            }
        }
        tx.commit()?;
        Ok(cleared)
    }

    /// Stored export hash for an issue, if it was ever exported.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn export_hash(&self, issue_id: &str) -> Result<Option<String>> {
        let hash = self
            .conn
            .query_row(
                "SELECT content_hash FROM export_hashes WHERE issue_id = ?",
                [issue_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    /// Record export hashes after a successful export or import.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn set_export_hashes(&mut self, entries: &[(String, String)]) -> Result<()> {
        let tx = self.conn.transaction()?;
        set_export_hashes_tx(&tx, entries)?;
        tx.commit()?;
        Ok(())
    }

    /// Drop every export hash. Every import starts with this so stale
    /// hashes cannot suppress changed rows on the next export.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn clear_all_export_hashes(&mut self) -> Result<usize> {
        let cleared = self.conn.execute("DELETE FROM export_hashes", [])?;
        Ok(cleared)
    }

    // ------------------------------------------------------------------
    // Config & metadata
    // ------------------------------------------------------------------

    /// Read a workspace config value (e.g. `issue_prefix`).
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM config WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Set a workspace config value.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn set_config(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO config (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    /// Read a sync-bookkeeping metadata value.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM metadata WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Set a sync-bookkeeping metadata value.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    /// Delete a metadata key; returns whether it existed.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn delete_metadata(&mut self, key: &str) -> Result<bool> {
        let removed = self.conn.execute("DELETE FROM metadata WHERE key = ?", [key])?;
        Ok(removed > 0)
    }

    // ------------------------------------------------------------------
    // Export/import surface
    // ------------------------------------------------------------------

    /// Every exportable issue fully loaded: ephemerals excluded,
    /// tombstones included, sorted by ID for deterministic mirror output.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn issues_for_export(&self) -> Result<Vec<Issue>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ISSUE_COLUMNS} FROM issues WHERE ephemeral = 0 ORDER BY id"
        ))?;
        let mut issues = stmt
            .query_map([], issue_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut labels = self.all_labels()?;
        let mut deps = self.all_dependencies()?;
        let mut comments = self.all_comments()?;
        for issue in &mut issues {
            issue.labels = labels.remove(&issue.id).unwrap_or_default();
            issue.dependencies = deps.remove(&issue.id).unwrap_or_default();
            issue.comments = comments.remove(&issue.id).unwrap_or_default();
        }
        Ok(issues)
    }

    fn all_labels(&self) -> Result<HashMap<String, Vec<String>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT issue_id, label FROM labels ORDER BY issue_id, label")?;
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (issue_id, label) = row?;
            map.entry(issue_id).or_default().push(label);
        }
        Ok(map)
    }

    fn all_dependencies(&self) -> Result<HashMap<String, Vec<Dependency>>> {
        let mut stmt = self.conn.prepare(
            "SELECT issue_id, depends_on_id, type, created_at, created_by, metadata, thread_id
             FROM dependencies ORDER BY issue_id, depends_on_id",
        )?;
        let mut map: HashMap<String, Vec<Dependency>> = HashMap::new();
        let rows = stmt.query_map([], dependency_from_row)?;
        for row in rows {
            let dep = row?;
            map.entry(dep.issue_id.clone()).or_default().push(dep);
        }
        Ok(map)
    }

    fn all_comments(&self) -> Result<HashMap<String, Vec<Comment>>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, issue_id, author, text, created_at
             FROM comments ORDER BY issue_id, created_at, id",
        )?;
        let mut map: HashMap<String, Vec<Comment>> = HashMap::new();
        let rows = stmt.query_map([], comment_from_row)?;
        for row in rows {
            let comment = row?;
            map.entry(comment.issue_id.clone()).or_default().push(comment);
        }
        Ok(map)
    }
}

// ---------------------------------------------------------------------------
// Patch type
// ---------------------------------------------------------------------------

/// Field-level patch for [`SqliteStorage::update_issue`]. Outer `None`
/// means "leave alone"; for clearable fields the inner `Option` carries
/// the new value or the explicit clear.
#[derive(Debug, Clone, Default)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub design: Option<Option<String>>,
    pub acceptance_criteria: Option<Option<String>>,
    pub notes: Option<Option<String>>,
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub issue_type: Option<IssueType>,
    pub assignee: Option<Option<String>>,
    pub owner: Option<Option<String>>,
    pub estimated_minutes: Option<Option<i32>>,
    pub due_at: Option<Option<DateTime<Utc>>>,
    pub defer_until: Option<Option<DateTime<Utc>>>,
    pub external_ref: Option<Option<String>>,
    pub source_system: Option<Option<String>>,
    pub close_reason: Option<Option<String>>,
    pub pinned: Option<bool>,
    pub is_template: Option<bool>,
}

fn apply_patch(issue: &mut Issue, patch: &IssuePatch) {
    if let Some(value) = &patch.title {
        issue.title = value.clone();
    }
    if let Some(value) = &patch.description {
        issue.description = value.clone();
    }
    if let Some(value) = &patch.design {
        issue.design = value.clone();
    }
    if let Some(value) = &patch.acceptance_criteria {
        issue.acceptance_criteria = value.clone();
    }
    if let Some(value) = &patch.notes {
        issue.notes = value.clone();
    }
    if let Some(value) = &patch.status {
        issue.status = value.clone();
    }
    if let Some(value) = patch.priority {
        issue.priority = value;
    }
    if let Some(value) = &patch.issue_type {
        issue.issue_type = value.clone();
    }
    if let Some(value) = &patch.assignee {
        issue.assignee = value.clone();
    }
    if let Some(value) = &patch.owner {
        issue.owner = value.clone();
    }
    if let Some(value) = patch.estimated_minutes {
        issue.estimated_minutes = value;
    }
    if let Some(value) = patch.due_at {
        issue.due_at = value;
    }
    if let Some(value) = patch.defer_until {
        issue.defer_until = value;
    }
    if let Some(value) = &patch.external_ref {
        issue.external_ref = value.clone();
    }
    if let Some(value) = &patch.source_system {
        issue.source_system = value.clone();
    }
    if let Some(value) = &patch.close_reason {
        issue.close_reason = value.clone();
    }
    if let Some(value) = patch.pinned {
        issue.pinned = value;
    }
    if let Some(value) = patch.is_template {
        issue.is_template = value;
    }
}

/// Text-field diffs for audit events; status is reported separately.
fn field_diffs(before: &Issue, after: &Issue) -> Vec<(String, Option<String>, Option<String>)> {
    let mut diffs = Vec::new();
    let mut push = |field: &str, old: Option<String>, new: Option<String>| {
        if old != new {
            diffs.push((field.to_string(), old, new));
        }
    };
    push("title", Some(before.title.clone()), Some(after.title.clone()));
    push("description", before.description.clone(), after.description.clone());
    push("design", before.design.clone(), after.design.clone());
    push(
        "acceptance_criteria",
        before.acceptance_criteria.clone(),
        after.acceptance_criteria.clone(),
    );
    push("notes", before.notes.clone(), after.notes.clone());
    push(
        "priority",
        Some(before.priority.0.to_string()),
        Some(after.priority.0.to_string()),
    );
    push(
        "issue_type",
        Some(before.issue_type.as_str().to_string()),
        Some(after.issue_type.as_str().to_string()),
    );
    push("assignee", before.assignee.clone(), after.assignee.clone());
    push("owner", before.owner.clone(), after.owner.clone());
    push(
        "external_ref",
        before.external_ref.clone(),
        after.external_ref.clone(),
    );
    diffs
}

// ---------------------------------------------------------------------------
// Transaction-scoped helpers (shared with the import path)
// ---------------------------------------------------------------------------

pub(crate) fn id_exists_tx(conn: &Connection, issue_id: &str) -> Result<bool> {
    let exists = conn
        .prepare("SELECT 1 FROM issues WHERE id = ?")?
        .exists([issue_id])?;
    Ok(exists)
}

/// Consume and return the next child number for `parent_id`.
pub(crate) fn next_child_number_tx(conn: &Connection, parent_id: &str) -> Result<u32> {
    conn.execute(
        "INSERT INTO child_counters (parent_id, next_child) VALUES (?, 2)
         ON CONFLICT(parent_id) DO UPDATE SET next_child = next_child + 1",
        [parent_id],
    )?;
    let next: i64 = conn.query_row(
        "SELECT next_child FROM child_counters WHERE parent_id = ?",
        [parent_id],
        |row| row.get(0),
    )?;
    Ok(u32::try_from(next - 1).unwrap_or(1))
}

pub(crate) fn get_issue_row_tx(conn: &Connection, issue_id: &str) -> Result<Option<Issue>> {
    let issue = conn
        .query_row(
            &format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?"),
            [issue_id],
            issue_from_row,
        )
        .optional()?;
    Ok(issue)
}

pub(crate) fn load_relations_tx(conn: &Connection, issue: &mut Issue) -> Result<()> {
    let mut stmt =
        conn.prepare("SELECT label FROM labels WHERE issue_id = ? ORDER BY label")?;
    issue.labels = stmt
        .query_map([&issue.id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    issue.dependencies = dependencies_of_tx(conn, &issue.id)?;
    issue.comments = comments_of_tx(conn, &issue.id)?;
    Ok(())
}

pub(crate) fn dependencies_of_tx(conn: &Connection, issue_id: &str) -> Result<Vec<Dependency>> {
    let mut stmt = conn.prepare(
        "SELECT issue_id, depends_on_id, type, created_at, created_by, metadata, thread_id
         FROM dependencies WHERE issue_id = ? ORDER BY depends_on_id",
    )?;
    let deps = stmt
        .query_map([issue_id], dependency_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(deps)
}

pub(crate) fn comments_of_tx(conn: &Connection, issue_id: &str) -> Result<Vec<Comment>> {
    let mut stmt = conn.prepare(
        "SELECT id, issue_id, author, text, created_at
         FROM comments WHERE issue_id = ? ORDER BY created_at, id",
    )?;
    let comments = stmt
        .query_map([issue_id], comment_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(comments)
}

pub(crate) fn insert_issue_row_tx(conn: &Connection, issue: &Issue) -> Result<()> {
    let params = issue_params(issue);
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();
    conn.execute(
        &format!(
            "INSERT INTO issues ({ISSUE_COLUMNS}) VALUES \
             (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ),
        param_refs.as_slice(),
    )?;
    Ok(())
}

pub(crate) fn update_issue_row_tx(conn: &Connection, issue: &Issue) -> Result<()> {
    let params = issue_params(issue);
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();
    let changed = conn.execute(
        "UPDATE issues SET
            content_hash = ?2, title = ?3, description = ?4, design = ?5,
            acceptance_criteria = ?6, notes = ?7, status = ?8, priority = ?9,
            issue_type = ?10, assignee = ?11, owner = ?12, estimated_minutes = ?13,
            created_at = ?14, created_by = ?15, updated_at = ?16, closed_at = ?17,
            close_reason = ?18, closed_by_session = ?19, due_at = ?20, defer_until = ?21,
            external_ref = ?22, source_system = ?23, deleted_at = ?24, deleted_by = ?25,
            delete_reason = ?26, original_type = ?27, ephemeral = ?28, pinned = ?29,
            is_template = ?30
         WHERE id = ?1",
        param_refs.as_slice(),
    )?;
    if changed == 0 {
        return Err(BeadsError::IssueNotFound {
            id: issue.id.clone(),
        });
    }
    Ok(())
}

/// Insert-or-update for the import path. Unlike `INSERT OR REPLACE`, this
/// never deletes the existing row, so cascade relations (events in
/// particular) survive the upsert.
pub(crate) fn upsert_issue_row_tx(conn: &Connection, issue: &Issue) -> Result<()> {
    let params = issue_params(issue);
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();
    conn.execute(
        &format!(
            "INSERT INTO issues ({ISSUE_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)
             ON CONFLICT(id) DO UPDATE SET
                content_hash = ?2, title = ?3, description = ?4, design = ?5,
                acceptance_criteria = ?6, notes = ?7, status = ?8, priority = ?9,
                issue_type = ?10, assignee = ?11, owner = ?12, estimated_minutes = ?13,
                created_at = ?14, created_by = ?15, updated_at = ?16, closed_at = ?17,
                close_reason = ?18, closed_by_session = ?19, due_at = ?20, defer_until = ?21,
                external_ref = ?22, source_system = ?23, deleted_at = ?24, deleted_by = ?25,
                delete_reason = ?26, original_type = ?27, ephemeral = ?28, pinned = ?29,
                is_template = ?30"
        ),
        param_refs.as_slice(),
    )?;
    Ok(())
}

/// Replace an issue's labels with the imported set.
pub(crate) fn replace_labels_tx(conn: &Connection, issue_id: &str, labels: &[String]) -> Result<()> {
    conn.execute("DELETE FROM labels WHERE issue_id = ?", [issue_id])?;
    let mut stmt = conn.prepare("INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)")?;
    for label in labels {
        stmt.execute(rusqlite::params![issue_id, label])?;
    }
    Ok(())
}

/// Replace an issue's outgoing edges with the imported set.
pub(crate) fn replace_dependencies_tx(
    conn: &Connection,
    issue_id: &str,
    deps: &[Dependency],
) -> Result<()> {
    conn.execute("DELETE FROM dependencies WHERE issue_id = ?", [issue_id])?;
    for dep in deps {
        if dep.depends_on_id == issue_id {
            continue;
        }
        let mut owned = dep.clone();
        owned.issue_id = issue_id.to_string();
        insert_dependency_row_tx(conn, &owned)?;
    }
    Ok(())
}

/// Merge imported comments, deduplicating on (author, body, created_at).
pub(crate) fn merge_comments_tx(
    conn: &Connection,
    issue_id: &str,
    comments: &[Comment],
) -> Result<usize> {
    let mut inserted = 0;
    for comment in comments {
        let exists: bool = conn
            .prepare(
                "SELECT 1 FROM comments WHERE issue_id = ? AND author = ? AND text = ? AND created_at = ?",
            )?
            .exists(rusqlite::params![
                issue_id,
                comment.author,
                comment.body,
                comment.created_at.to_rfc3339()
            ])?;
        if exists {
            continue;
        }
        conn.execute(
            "INSERT INTO comments (issue_id, author, text, created_at) VALUES (?, ?, ?, ?)",
            rusqlite::params![
                issue_id,
                comment.author,
                comment.body,
                comment.created_at.to_rfc3339()
            ],
        )?;
        inserted += 1;
    }
    Ok(inserted)
}

pub(crate) fn set_export_hashes_tx(conn: &Connection, entries: &[(String, String)]) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "INSERT INTO export_hashes (issue_id, content_hash, exported_at) VALUES (?, ?, ?)
         ON CONFLICT(issue_id) DO UPDATE SET content_hash = excluded.content_hash,
                                             exported_at = excluded.exported_at",
    )?;
    for (issue_id, hash) in entries {
        stmt.execute(rusqlite::params![issue_id, hash, now])?;
    }
    Ok(())
}

pub(crate) fn set_metadata_tx(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![key, value],
    )?;
    Ok(())
}

/// Relation mutations change hashed content without going through the
/// issue-row write path; this refreshes the stored hash and bumps
/// `updated_at` so the change wins last-writer comparisons on other
/// clones.
pub(crate) fn touch_issue_tx(conn: &Connection, issue_id: &str) -> Result<()> {
    let Some(mut issue) = get_issue_row_tx(conn, issue_id)? else {
        return Ok(());
    };
    load_relations_tx(conn, &mut issue)?;
    issue.updated_at = Utc::now();
    let hash = content_hash(&issue);
    conn.execute(
        "UPDATE issues SET content_hash = ?, updated_at = ? WHERE id = ?",
        rusqlite::params![hash, issue.updated_at.to_rfc3339(), issue_id],
    )?;
    Ok(())
}

/// First-open bookkeeping: record the schema version and mint a stable
/// workspace identity when none exists yet. The identity feeds ID seeds
/// so sibling workspaces diverge even on identical content.
fn stamp_identity(conn: &Connection, origin: &str) -> Result<()> {
    set_metadata_tx(
        conn,
        "schema_version",
        &schema::CURRENT_SCHEMA_VERSION.to_string(),
    )?;
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'workspace_id'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if existing.is_none() {
        let seed = format!(
            "{origin}|{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let workspace_id = crate::util::id::hash_fragment(&seed, 16);
        set_metadata_tx(conn, "workspace_id", &workspace_id)?;
    }
    Ok(())
}

fn insert_dependency_row_tx(conn: &Connection, dep: &Dependency) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO dependencies
            (issue_id, depends_on_id, type, created_at, created_by, metadata, thread_id)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            dep.issue_id,
            dep.depends_on_id,
            dep.dep_type.as_str(),
            dep.created_at.to_rfc3339(),
            dep.created_by,
            dep.metadata,
            dep.thread_id,
        ],
    )?;
    Ok(())
}

/// What currently blocks `issue_id`, per the materialized cache; used by
/// the close guard. The cache was refreshed by whatever mutation last
/// committed, so this reflects the full blocking semantics (conditional
/// releases, gates, transitive parents) rather than raw edge counting.
fn open_blockers_tx(conn: &Connection, issue_id: &str) -> Result<Vec<String>> {
    let blocked_json: Option<String> = conn
        .query_row(
            "SELECT blocked_by_json FROM blocked_issues_cache WHERE issue_id = ?",
            [issue_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(blocked_json
        .map(|json| serde_json::from_str(&json).unwrap_or_default())
        .unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn issue_params(issue: &Issue) -> Vec<Box<dyn rusqlite::ToSql>> {
    vec![
        Box::new(issue.id.clone()),
        Box::new(issue.content_hash.clone()),
        Box::new(issue.title.clone()),
        Box::new(issue.description.clone()),
        Box::new(issue.design.clone()),
        Box::new(issue.acceptance_criteria.clone()),
        Box::new(issue.notes.clone()),
        Box::new(issue.status.as_str().to_string()),
        Box::new(issue.priority.0),
        Box::new(issue.issue_type.as_str().to_string()),
        Box::new(issue.assignee.clone()),
        Box::new(issue.owner.clone()),
        Box::new(issue.estimated_minutes),
        Box::new(issue.created_at.to_rfc3339()),
        Box::new(issue.created_by.clone()),
        Box::new(issue.updated_at.to_rfc3339()),
        Box::new(issue.closed_at.map(|dt| dt.to_rfc3339())),
        Box::new(issue.close_reason.clone()),
        Box::new(issue.closed_by_session.clone()),
        Box::new(issue.due_at.map(|dt| dt.to_rfc3339())),
        Box::new(issue.defer_until.map(|dt| dt.to_rfc3339())),
        Box::new(issue.external_ref.clone()),
        Box::new(issue.source_system.clone()),
        Box::new(issue.deleted_at.map(|dt| dt.to_rfc3339())),
        Box::new(issue.deleted_by.clone()),
        Box::new(issue.delete_reason.clone()),
        Box::new(issue.original_type.clone()),
        Box::new(issue.ephemeral),
        Box::new(issue.pinned),
        Box::new(issue.is_template),
    ]
}

pub(crate) fn issue_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Issue> {
    let status: String = row.get(7)?;
    let issue_type: String = row.get(9)?;
    Ok(Issue {
        id: row.get(0)?,
        content_hash: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        design: row.get(4)?,
        acceptance_criteria: row.get(5)?,
        notes: row.get(6)?,
        status: status.parse().unwrap_or(Status::Open),
        priority: Priority(row.get(8)?),
        issue_type: issue_type.parse().unwrap_or(IssueType::Task),
        assignee: row.get(10)?,
        owner: row.get(11)?,
        estimated_minutes: row.get(12)?,
        created_at: parse_dt(&row.get::<_, String>(13)?),
        created_by: row.get(14)?,
        updated_at: parse_dt(&row.get::<_, String>(15)?),
        closed_at: row.get::<_, Option<String>>(16)?.as_deref().map(parse_dt),
        close_reason: row.get(17)?,
        closed_by_session: row.get(18)?,
        due_at: row.get::<_, Option<String>>(19)?.as_deref().map(parse_dt),
        defer_until: row.get::<_, Option<String>>(20)?.as_deref().map(parse_dt),
        external_ref: row.get(21)?,
        source_system: row.get(22)?,
        deleted_at: row.get::<_, Option<String>>(23)?.as_deref().map(parse_dt),
        deleted_by: row.get(24)?,
        delete_reason: row.get(25)?,
        original_type: row.get(26)?,
        ephemeral: row.get(27)?,
        pinned: row.get(28)?,
        is_template: row.get(29)?,
        labels: Vec::new(),
        dependencies: Vec::new(),
        comments: Vec::new(),
    })
}

fn dependency_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Dependency> {
    let dep_type: String = row.get(2)?;
    Ok(Dependency {
        issue_id: row.get(0)?,
        depends_on_id: row.get(1)?,
        dep_type: dep_type.parse().unwrap_or(DependencyType::Related),
        created_at: parse_dt(&row.get::<_, String>(3)?),
        created_by: row.get(4)?,
        metadata: row.get(5)?,
        thread_id: row.get(6)?,
    })
}

fn comment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        issue_id: row.get(1)?,
        author: row.get(2)?,
        body: row.get(3)?,
        created_at: parse_dt(&row.get::<_, String>(4)?),
    })
}

fn parse_dt(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Trait seams
// ---------------------------------------------------------------------------

/// Transaction-scoped view used while validating inside a mutation.
struct TxStore<'a> {
    conn: &'a Connection,
}

impl DependencyStore for TxStore<'_> {
    fn issue_exists(&self, issue_id: &str) -> Result<bool> {
        id_exists_tx(self.conn, issue_id)
    }

    fn edge_exists(&self, issue_id: &str, depends_on_id: &str) -> Result<bool> {
        let exists = self
            .conn
            .prepare("SELECT 1 FROM dependencies WHERE issue_id = ? AND depends_on_id = ?")?
            .exists(rusqlite::params![issue_id, depends_on_id])?;
        Ok(exists)
    }

    fn would_create_cycle(&self, issue_id: &str, depends_on_id: &str) -> Result<bool> {
        graph::would_create_cycle(self.conn, issue_id, depends_on_id)
    }
}

impl DependencyStore for SqliteStorage {
    fn issue_exists(&self, issue_id: &str) -> Result<bool> {
        self.id_exists(issue_id)
    }

    fn edge_exists(&self, issue_id: &str, depends_on_id: &str) -> Result<bool> {
        let exists = self
            .conn
            .prepare("SELECT 1 FROM dependencies WHERE issue_id = ? AND depends_on_id = ?")?
            .exists(rusqlite::params![issue_id, depends_on_id])?;
        Ok(exists)
    }

    fn would_create_cycle(&self, issue_id: &str, depends_on_id: &str) -> Result<bool> {
        graph::would_create_cycle(&self.conn, issue_id, depends_on_id)
    }
}

impl crate::util::id::IdIndex for SqliteStorage {
    fn id_exists(&self, issue_id: &str) -> Result<bool> {
        Self::id_exists(self, issue_id)
    }

    fn ids_with_hash(&self, hash: &str) -> Result<Vec<String>> {
        let ids = self.all_issue_ids()?;
        Ok(ids
            .into_iter()
            .filter(|candidate| hash_portion(candidate) == hash)
            .collect())
    }

    fn ids_containing(&self, fragment: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM issues WHERE status != 'tombstone' ORDER BY id")?;
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(ids
            .into_iter()
            .filter(|candidate| hash_portion(candidate).contains(fragment))
            .collect())
    }
}
