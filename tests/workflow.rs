//! End-to-end workflows through the public API: a workspace store, its
//! mirror, and a clone converging on the same graph.

use beads_core::storage::graph::NoExternalResolution;
use beads_core::sync::{self, ExportOptions, ImportOptions};
use beads_core::util::hash::content_hash;
use beads_core::util::id::IdConfig;
use beads_core::{
    Dependency, DependencyType, EventType, Issue, IssuePatch, Priority, ReadyFilters,
    ReadySortPolicy, SqliteStorage, Status, TreeDirection, TreeOptions,
};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
    storage: SqliteStorage,
    mirror: PathBuf,
    opts: ExportOptions,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let storage = SqliteStorage::open(&dir.path().join("beads.db")).expect("open store");
        let mirror = dir.path().join("issues.jsonl");
        let opts = ExportOptions::new(dir.path());
        Self {
            dir,
            storage,
            mirror,
            opts,
        }
    }

    fn create(&mut self, title: &str, priority: i32) -> Issue {
        let mut input = Issue::new("", title);
        input.priority = Priority(priority);
        self.storage
            .create_issue(input, None, &IdConfig::default(), &[], "tester")
            .expect("create issue")
    }
}

#[test]
fn create_close_unblock_flow() {
    let mut ws = Workspace::new();
    let a = ws.create("set up schema", 1);
    let b = ws.create("build exporter", 2);
    ws.storage
        .add_dependency(&Dependency::new(&b.id, &a.id, DependencyType::Blocks), "tester")
        .unwrap();

    let ready = ws
        .storage
        .ready_work(&ReadyFilters::default(), ReadySortPolicy::Hybrid)
        .unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, a.id);

    ws.storage
        .close_issue(&a.id, Some("done"), None, false, "tester")
        .unwrap();

    let ready = ws
        .storage
        .ready_work(&ReadyFilters::default(), ReadySortPolicy::Hybrid)
        .unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, b.id);

    // The audit trail saw all of it.
    let events = ws.storage.events_for_issue(&a.id, 0).unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::Created));
    assert!(events.iter().any(|e| e.event_type == EventType::Closed));
}

#[test]
fn closed_at_tracks_status_through_lifecycle() {
    let mut ws = Workspace::new();
    let issue = ws.create("lifecycle", 2);

    let closed = ws
        .storage
        .close_issue(&issue.id, Some("shipped"), Some("sess-9"), false, "tester")
        .unwrap();
    assert_eq!(closed.status, Status::Closed);
    assert!(closed.closed_at.is_some());

    let reopened = ws.storage.reopen_issue(&issue.id, "tester").unwrap();
    assert_eq!(reopened.status, Status::Open);
    assert!(reopened.closed_at.is_none());
    assert!(reopened.close_reason.is_none());

    let tomb = ws
        .storage
        .delete_issue(&issue.id, "tester", Some("obsolete"), "tester")
        .unwrap();
    assert_eq!(tomb.status, Status::Tombstone);
    assert!(tomb.deleted_at.is_some());
    assert_eq!(tomb.original_type.as_deref(), Some("task"));
}

#[test]
fn mirror_round_trip_is_lossless_and_stable() {
    let mut ws = Workspace::new();
    let issue = ws.create("travels well", 1);
    ws.storage.add_label(&issue.id, "x", "tester").unwrap();
    ws.storage.add_label(&issue.id, "y", "tester").unwrap();
    ws.storage
        .add_comment(&issue.id, "kim", "hi there", "tester")
        .unwrap();
    let original = ws.storage.get_issue(&issue.id).unwrap().unwrap();
    let original_hash = content_hash(&original);

    sync::export_full(&mut ws.storage, &ws.mirror, &ws.opts).unwrap();
    let first = fs::read_to_string(ws.mirror.clone()).unwrap();

    // A fresh clone imports the mirror.
    let clone_dir = TempDir::new().unwrap();
    let mut clone = SqliteStorage::open(&clone_dir.path().join("beads.db")).unwrap();
    let clone_mirror = clone_dir.path().join("issues.jsonl");
    fs::write(&clone_mirror, &first).unwrap();
    let outcome = sync::import_mirror(
        &mut clone,
        &clone_mirror,
        clone_dir.path(),
        &ImportOptions::default(),
    )
    .unwrap();
    assert_eq!(outcome.created, 1);

    let imported = clone.get_issue(&issue.id).unwrap().unwrap();
    assert_eq!(content_hash(&imported), original_hash);
    assert_eq!(imported.labels, vec!["x".to_string(), "y".to_string()]);
    assert_eq!(imported.comments.len(), 1);

    // export . import . export is byte-stable.
    sync::export_full(&mut clone, &clone_mirror, &ExportOptions::new(clone_dir.path())).unwrap();
    let second = fs::read_to_string(&clone_mirror).unwrap();
    assert_eq!(first, second);
}

#[test]
fn incremental_export_honors_export_hash_invariants() {
    let mut ws = Workspace::new();
    let issue = ws.create("tracked", 2);
    sync::export_full(&mut ws.storage, &ws.mirror, &ws.opts).unwrap();

    // Invariant: export hash equals the content hash just written, and
    // the dirty set is empty.
    let current = ws.storage.get_issue(&issue.id).unwrap().unwrap();
    assert_eq!(
        ws.storage.export_hash(&issue.id).unwrap().as_deref(),
        Some(content_hash(&current).as_str())
    );
    assert!(ws.storage.dirty_issue_ids().unwrap().is_empty());

    // A no-op touch marks dirty; incremental export skips the write but
    // still clears the bit.
    ws.storage
        .mutate("tester", |_tx, ctx| {
            ctx.mark_dirty(&issue.id);
            Ok(())
        })
        .unwrap();
    let summary = sync::export_incremental(&mut ws.storage, &ws.mirror, &ws.opts).unwrap();
    assert!(!summary.wrote_file);
    assert!(ws.storage.dirty_issue_ids().unwrap().is_empty());

    // Import empties the export-hash table until the next export.
    sync::import_mirror(
        &mut ws.storage,
        &ws.mirror,
        ws.dir.path(),
        &ImportOptions::default(),
    )
    .unwrap();
    assert!(ws.storage.export_hash(&issue.id).unwrap().is_none());
}

#[test]
fn cycle_rejection_leaves_graph_untouched() {
    let mut ws = Workspace::new();
    let a = ws.create("a", 2);
    let b = ws.create("b", 2);
    let c = ws.create("c", 2);
    ws.storage
        .add_dependency(&Dependency::new(&a.id, &b.id, DependencyType::Blocks), "t")
        .unwrap();
    ws.storage
        .add_dependency(&Dependency::new(&b.id, &c.id, DependencyType::Blocks), "t")
        .unwrap();

    let blocked_before = ws.storage.blocked_ids().unwrap();
    let err = ws
        .storage
        .add_dependency(&Dependency::new(&c.id, &a.id, DependencyType::Blocks), "t")
        .unwrap_err();
    assert_eq!(err.kind(), beads_core::ErrorKind::CycleDetected);
    assert!(ws.storage.dependencies_of(&c.id).unwrap().is_empty());
    assert_eq!(ws.storage.blocked_ids().unwrap(), blocked_before);

    // A parent-child path back is a cycle too.
    let err = ws
        .storage
        .add_dependency(
            &Dependency::new(&c.id, &a.id, DependencyType::ParentChild),
            "t",
        )
        .unwrap_err();
    assert_eq!(err.kind(), beads_core::ErrorKind::CycleDetected);
}

#[test]
fn dependency_tree_spans_workspaces_through_sentinels() {
    let mut ws = Workspace::new();
    let epic = ws.create("epic", 1);
    let task = ws.create("task", 2);
    ws.storage
        .add_dependency(
            &Dependency::new(&task.id, &epic.id, DependencyType::ParentChild),
            "t",
        )
        .unwrap();
    ws.storage
        .add_dependency(
            &Dependency::new(&epic.id, "external:auth:session-tokens", DependencyType::Blocks),
            "t",
        )
        .unwrap();

    let nodes = ws
        .storage
        .dependency_tree(
            &task.id,
            &TreeOptions {
                direction: TreeDirection::Down,
                ..Default::default()
            },
            &NoExternalResolution,
        )
        .unwrap();

    assert_eq!(nodes.len(), 3);
    assert_eq!(nodes[0].id, task.id);
    assert_eq!(nodes[1].id, epic.id);
    assert!(nodes[2].external);
    assert_eq!(nodes[2].id, "external:auth:session-tokens");
    assert_eq!(nodes[2].depth, 2);
    assert_eq!(nodes[2].parent_id.as_deref(), Some(epic.id.as_str()));
}

#[test]
fn partial_ids_resolve_with_exact_match_priority() {
    let mut ws = Workspace::new();
    for id in ["bd-1", "bd-10", "bd-100"] {
        ws.storage
            .create_issue(Issue::new(id, id), None, &IdConfig::default(), &[], "t")
            .unwrap();
    }
    let resolved = beads_core::util::id::resolve_id("bd-1", "bd", &ws.storage).unwrap();
    assert_eq!(resolved, "bd-1");

    // A bare fragment normalizes against the workspace prefix first.
    let resolved = beads_core::util::id::resolve_id("10", "bd", &ws.storage).unwrap();
    assert_eq!(resolved, "bd-10");

    // An ambiguous fragment names its candidates.
    let err = beads_core::util::id::resolve_id("0", "bd", &ws.storage).unwrap_err();
    match err {
        beads_core::BeadsError::AmbiguousId { matches, .. } => {
            assert!(matches.contains(&"bd-10".to_string()));
            assert!(matches.contains(&"bd-100".to_string()));
        }
        other => panic!("expected ambiguity, got {other:?}"),
    }
}

#[test]
fn updates_propagate_incrementally_between_clones() {
    let mut ws = Workspace::new();
    let issue = ws.create("shared", 2);
    sync::export_full(&mut ws.storage, &ws.mirror, &ws.opts).unwrap();

    let clone_dir = TempDir::new().unwrap();
    let mut clone = SqliteStorage::open(&clone_dir.path().join("beads.db")).unwrap();
    let clone_mirror = clone_dir.path().join("issues.jsonl");
    fs::copy(ws.mirror.clone(), &clone_mirror).unwrap();
    sync::import_mirror(
        &mut clone,
        &clone_mirror,
        clone_dir.path(),
        &ImportOptions::default(),
    )
    .unwrap();

    // Upstream edits and re-exports; the clone imports the new mirror.
    ws.storage
        .update_issue(
            &issue.id,
            &IssuePatch {
                title: Some("shared, revised".to_string()),
                ..Default::default()
            },
            "tester",
        )
        .unwrap();
    sync::export_incremental(&mut ws.storage, &ws.mirror, &ws.opts).unwrap();
    fs::copy(ws.mirror.clone(), &clone_mirror).unwrap();

    let outcome = sync::import_mirror(
        &mut clone,
        &clone_mirror,
        clone_dir.path(),
        &ImportOptions::default(),
    )
    .unwrap();
    assert_eq!(outcome.updated, 1);
    assert_eq!(
        clone.get_issue(&issue.id).unwrap().unwrap().title,
        "shared, revised"
    );
}

#[test]
fn freshness_detects_mirror_changes() {
    let mut ws = Workspace::new();
    ws.create("a", 2);
    sync::export_full(&mut ws.storage, &ws.mirror, &ws.opts).unwrap();
    assert!(!sync::freshness::import_needed(&ws.storage, &ws.mirror).unwrap());

    // Another clone's edit lands in the mirror (simulated append).
    let mut content = fs::read_to_string(ws.mirror.clone()).unwrap();
    content.push_str("{\"id\":\"bd-zz9\",\"title\":\"from elsewhere\",\"priority\":2,\"created_at\":\"2026-02-01T00:00:00Z\",\"updated_at\":\"2026-02-01T00:00:00Z\"}\n");
    fs::write(ws.mirror.clone(), content).unwrap();

    assert!(sync::freshness::import_needed(&ws.storage, &ws.mirror).unwrap());
    sync::import_mirror(
        &mut ws.storage,
        &ws.mirror,
        ws.dir.path(),
        &ImportOptions::default(),
    )
    .unwrap();
    assert!(ws.storage.get_issue("bd-zz9").unwrap().is_some());
    assert!(!sync::freshness::import_needed(&ws.storage, &ws.mirror).unwrap());
}
