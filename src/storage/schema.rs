//! Schema and migrations.
//!
//! Migrations are numbered, forward-only, and idempotent at the set level:
//! each runs inside its own transaction, records itself in
//! `schema_migrations`, and is skipped on every later open. No migration
//! rewrites or removes data a prior invariant depends on.

use rusqlite::Connection;
use tracing::debug;

use crate::error::{BeadsError, Result};

/// Version the store is at after applying every known migration.
pub const CURRENT_SCHEMA_VERSION: i32 = 4;

/// Page-cache budget: 64 MiB, expressed negatively per SQLite convention
/// (KiB rather than pages).
const CACHE_SIZE_KIB: i64 = -65_536;

/// Busy timeout for lock acquisition.
pub const BUSY_TIMEOUT_MS: u64 = 30_000;

struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "core tables",
        sql: r"
            CREATE TABLE issues (
                id TEXT PRIMARY KEY,
                content_hash TEXT,
                title TEXT NOT NULL,
                description TEXT,
                design TEXT,
                acceptance_criteria TEXT,
                notes TEXT,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                issue_type TEXT NOT NULL,
                assignee TEXT,
                owner TEXT,
                estimated_minutes INTEGER,
                created_at TEXT NOT NULL,
                created_by TEXT,
                updated_at TEXT NOT NULL,
                closed_at TEXT,
                close_reason TEXT,
                closed_by_session TEXT,
                due_at TEXT,
                defer_until TEXT,
                external_ref TEXT,
                source_system TEXT,
                deleted_at TEXT,
                deleted_by TEXT,
                delete_reason TEXT,
                original_type TEXT,
                ephemeral INTEGER NOT NULL DEFAULT 0,
                pinned INTEGER NOT NULL DEFAULT 0,
                is_template INTEGER NOT NULL DEFAULT 0,
                CHECK (length(trim(title)) >= 1 AND length(title) <= 500),
                CHECK (priority >= 0 AND priority <= 4),
                CHECK (estimated_minutes IS NULL OR estimated_minutes >= 0)
            );

            CREATE INDEX idx_issues_status ON issues(status);
            CREATE INDEX idx_issues_priority ON issues(priority);
            CREATE INDEX idx_issues_issue_type ON issues(issue_type);
            CREATE INDEX idx_issues_assignee ON issues(assignee);
            CREATE INDEX idx_issues_created_at ON issues(created_at);
            CREATE INDEX idx_issues_updated_at ON issues(updated_at);

            -- Edges cascade with their owning issue; the depends_on side is
            -- unconstrained so external sentinels can be targets.
            CREATE TABLE dependencies (
                issue_id TEXT NOT NULL,
                depends_on_id TEXT NOT NULL,
                type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                created_by TEXT,
                metadata TEXT,
                thread_id TEXT,
                PRIMARY KEY (issue_id, depends_on_id),
                FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE,
                CHECK (issue_id <> depends_on_id)
            );
            CREATE INDEX idx_dependencies_depends_on_id ON dependencies(depends_on_id);
            CREATE INDEX idx_dependencies_type ON dependencies(type);

            CREATE TABLE labels (
                issue_id TEXT NOT NULL,
                label TEXT NOT NULL,
                PRIMARY KEY (issue_id, label),
                FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE,
                CHECK (length(label) >= 1 AND length(label) <= 100)
            );
            CREATE INDEX idx_labels_label ON labels(label);

            CREATE TABLE comments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                issue_id TEXT NOT NULL,
                author TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
            );
            CREATE INDEX idx_comments_issue_id ON comments(issue_id);

            CREATE TABLE events (
                id INTEGER PRIMARY KEY,
                issue_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                actor TEXT NOT NULL,
                old_value TEXT,
                new_value TEXT,
                comment TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
            );
            CREATE INDEX idx_events_issue_id ON events(issue_id);
            CREATE INDEX idx_events_created_at ON events(created_at);

            CREATE TABLE config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE dirty_issues (
                issue_id TEXT PRIMARY KEY,
                marked_at TEXT NOT NULL
            );
            CREATE INDEX idx_dirty_issues_marked_at ON dirty_issues(marked_at);

            CREATE TABLE export_hashes (
                issue_id TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL,
                exported_at TEXT NOT NULL
            );
        ",
    },
    Migration {
        version: 2,
        name: "content-hash and partial indexes",
        sql: r"
            CREATE INDEX idx_issues_content_hash ON issues(content_hash);
            CREATE UNIQUE INDEX idx_issues_external_ref ON issues(external_ref)
                WHERE external_ref IS NOT NULL;
            CREATE INDEX idx_issues_ephemeral ON issues(id) WHERE ephemeral = 1;
            CREATE INDEX idx_issues_pinned ON issues(id) WHERE pinned = 1;
            CREATE INDEX idx_issues_tombstone ON issues(id) WHERE status = 'tombstone';
        ",
    },
    Migration {
        version: 3,
        name: "blocked cache and child counters",
        sql: r"
            CREATE TABLE blocked_issues_cache (
                issue_id TEXT PRIMARY KEY,
                blocked_by_json TEXT NOT NULL
            );

            CREATE TABLE child_counters (
                parent_id TEXT PRIMARY KEY,
                next_child INTEGER NOT NULL DEFAULT 1
            );
        ",
    },
    Migration {
        version: 4,
        name: "ready-work composite index",
        sql: r"
            CREATE INDEX idx_issues_ready ON issues(status, priority, created_at)
                WHERE status IN ('open', 'in_progress')
                  AND ephemeral = 0 AND pinned = 0;
        ",
    },
];

/// Apply open-time pragmas.
///
/// WAL is requested but not required: in-memory databases and filesystems
/// without shared-memory support report a different journal mode back, and
/// the store runs with rollback journaling there.
///
/// # Errors
///
/// Returns an error if a pragma cannot be set at all.
pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;

    let journal_mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !journal_mode.eq_ignore_ascii_case("wal") {
        debug!(journal_mode = %journal_mode, "WAL unavailable, using fallback journal mode");
        let _ = conn.pragma_update_and_check(None, "journal_mode", "DELETE", |row| {
            row.get::<_, String>(0)
        });
    }

    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", CACHE_SIZE_KIB)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// Run every unapplied migration, in ascending version order, each in its
/// own transaction.
///
/// # Errors
///
/// `Schema` when the migration bookkeeping table cannot be created or a
/// migration fails mid-flight (that migration's transaction rolls back).
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    for migration in MIGRATIONS {
        let applied: bool = conn
            .prepare("SELECT 1 FROM schema_migrations WHERE version = ?")?
            .exists([migration.version])?;
        if applied {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql).map_err(|err| {
            BeadsError::Schema {
                detail: format!(
                    "migration {} ({}) failed: {err}",
                    migration.version, migration.name
                ),
            }
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)",
            rusqlite::params![migration.version, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        debug!(
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
    }

    Ok(())
}

/// The highest migration version recorded in the store.
///
/// # Errors
///
/// `Schema` when the bookkeeping table is missing entirely.
pub fn schema_version(conn: &Connection) -> Result<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|err| BeadsError::Schema {
        detail: format!("schema_migrations unreadable: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_pragmas(&conn).unwrap();
        migrate(&mut conn).unwrap();
        conn
    }

    #[test]
    fn migrations_create_all_tables() {
        let conn = fresh();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();

        for expected in [
            "issues",
            "dependencies",
            "labels",
            "comments",
            "events",
            "config",
            "metadata",
            "dirty_issues",
            "export_hashes",
            "blocked_issues_cache",
            "child_counters",
            "schema_migrations",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[test]
    fn migrations_are_recorded_and_skipped_on_reapply() {
        let mut conn = fresh();
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
        // A second pass is a no-op rather than a duplicate-table error.
        migrate(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn check_constraints_hold() {
        let conn = fresh();
        let insert = |title: &str, priority: i32| {
            conn.execute(
                "INSERT INTO issues (id, title, status, priority, issue_type, created_at, updated_at)
                 VALUES (?, ?, 'open', ?, 'task', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                rusqlite::params![format!("bd-{title}{priority}"), title, priority],
            )
        };
        assert!(insert("ok", 2).is_ok());
        assert!(insert("  ", 2).is_err());
        assert!(insert("ok2", 5).is_err());
    }

    #[test]
    fn self_dependency_is_rejected_at_schema_level() {
        let conn = fresh();
        conn.execute(
            "INSERT INTO issues (id, title, status, priority, issue_type, created_at, updated_at)
             VALUES ('bd-a', 't', 'open', 2, 'task', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let err = conn.execute(
            "INSERT INTO dependencies (issue_id, depends_on_id, type, created_at)
             VALUES ('bd-a', 'bd-a', 'blocks', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(err.is_err());
    }

    #[test]
    fn external_ref_unique_only_when_present() {
        let conn = fresh();
        let insert = |id: &str, ext: Option<&str>| {
            conn.execute(
                "INSERT INTO issues (id, title, status, priority, issue_type, created_at, updated_at, external_ref)
                 VALUES (?, 't', 'open', 2, 'task', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', ?)",
                rusqlite::params![id, ext],
            )
        };
        assert!(insert("bd-1", None).is_ok());
        assert!(insert("bd-2", None).is_ok());
        assert!(insert("bd-3", Some("JIRA-9")).is_ok());
        assert!(insert("bd-4", Some("JIRA-9")).is_err());
    }

    #[test]
    fn cascade_deletes_owned_relations() {
        let conn = fresh();
        conn.execute_batch(
            "INSERT INTO issues (id, title, status, priority, issue_type, created_at, updated_at)
             VALUES ('bd-a', 't', 'open', 2, 'task', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');
             INSERT INTO labels (issue_id, label) VALUES ('bd-a', 'x');
             INSERT INTO comments (issue_id, author, text, created_at)
             VALUES ('bd-a', 'kim', 'hi', '2026-01-01T00:00:00Z');
             DELETE FROM issues WHERE id = 'bd-a';",
        )
        .unwrap();
        let labels: i64 = conn
            .query_row("SELECT COUNT(*) FROM labels", [], |r| r.get(0))
            .unwrap();
        let comments: i64 = conn
            .query_row("SELECT COUNT(*) FROM comments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(labels + comments, 0);
    }
}
