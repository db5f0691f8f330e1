//! Graph engine: the blocked-work materialization, cycle detection,
//! dependency-tree traversal, and the ready-work query.
//!
//! Blocking semantics by edge type:
//!
//! | type | holds the dependent until |
//! |---|---|
//! | `blocks` | the blocker reaches a terminal status |
//! | `conditional-blocks` | the blocker closes without a failure marker in its close reason |
//! | `waits-for` | the spawner's `parent-child` children satisfy the gate (`all-children` default, `any-children` opt-in) |
//! | `parent-child` | the parent is unblocked (transitive only; an idle parent does not hold its children) |
//!
//! Informational types never block and never enter cycle checks.

use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{DependencyType, Issue, Priority, Status};
use crate::storage::sqlite::{SqliteStorage, issue_from_row};
use crate::validation::{is_external_target, parse_external_sentinel};

/// Close-reason markers that make a `conditional-blocks` edge hold
/// forever. Matched as ASCII case-insensitive substrings.
pub const FAILURE_KEYWORDS: &[&str] = &[
    "failed",
    "rejected",
    "wontfix",
    "won't fix",
    "cancelled",
    "canceled",
    "abandoned",
    "blocked",
    "error",
    "timeout",
    "aborted",
];

/// Depth cap for transitive parent-child propagation.
const TRANSITIVE_DEPTH_LIMIT: usize = 50;

/// Depth cap for the reverse reachability search in cycle detection.
const CYCLE_SEARCH_DEPTH_LIMIT: usize = 100;

/// Default depth cap for dependency-tree traversal.
pub const DEFAULT_TREE_DEPTH: usize = 50;

const BLOCKING_TYPES_SQL: &str = "('blocks', 'parent-child', 'conditional-blocks', 'waits-for')";

/// Whether a close reason carries a failure marker.
#[must_use]
pub fn close_reason_indicates_failure(reason: &str) -> bool {
    let lowered = reason.to_ascii_lowercase();
    FAILURE_KEYWORDS.iter().any(|kw| lowered.contains(kw))
}

// ---------------------------------------------------------------------------
// Blocked materialization
// ---------------------------------------------------------------------------

struct BlockerRow {
    issue_id: String,
    depends_on_id: String,
    dep_type: DependencyType,
    metadata: Option<String>,
    blocker_status: Option<Status>,
    blocker_close_reason: Option<String>,
}

/// Rebuild `blocked_issues_cache` from scratch inside the caller's
/// transaction: direct blocking first, then parent-child propagation.
/// Returns the number of blocked issues.
///
/// # Errors
///
/// Propagates database failures; the caller's transaction rolls back.
pub(crate) fn rebuild_blocked_cache_tx(conn: &Connection) -> Result<usize> {
    conn.execute("DELETE FROM blocked_issues_cache", [])?;

    let rows = load_blocking_edges(conn)?;
    let child_closure = waits_for_child_counts(conn)?;

    // Phase 1: direct blocks.
    let mut blocked: HashMap<String, Vec<String>> = HashMap::new();
    for row in &rows {
        if is_external_target(&row.depends_on_id) {
            // Sentinels resolve only through the traversal's resolver; the
            // cache never blocks on them.
            continue;
        }
        let holds = match row.dep_type {
            DependencyType::Blocks => row
                .blocker_status
                .as_ref()
                .is_none_or(|status| !status.is_terminal()),
            DependencyType::ConditionalBlocks => match &row.blocker_status {
                // A deleted blocker releases; a closed blocker releases
                // only when it did not close as a failure.
                Some(Status::Tombstone) => false,
                Some(Status::Closed) => row
                    .blocker_close_reason
                    .as_deref()
                    .is_some_and(close_reason_indicates_failure),
                _ => true,
            },
            DependencyType::WaitsFor => {
                let gate = GateMode::from_metadata(row.metadata.as_deref());
                let (total, closed) = child_closure
                    .get(&row.depends_on_id)
                    .copied()
                    .unwrap_or((0, 0));
                match gate {
                    GateMode::AllChildren => closed < total,
                    GateMode::AnyChildren => closed == 0,
                }
            }
            // parent-child contributes in phase 2 only.
            _ => false,
        };
        if holds {
            blocked
                .entry(row.issue_id.clone())
                .or_default()
                .push(format!("{} ({})", row.depends_on_id, row.dep_type));
        }
    }

    // Phase 2: a blocked parent blocks its children, transitively.
    let parent_edges: Vec<(String, String)> = rows
        .iter()
        .filter(|row| row.dep_type == DependencyType::ParentChild)
        .map(|row| (row.issue_id.clone(), row.depends_on_id.clone()))
        .collect();

    for depth in 0.. {
        if depth >= TRANSITIVE_DEPTH_LIMIT {
            warn!(limit = TRANSITIVE_DEPTH_LIMIT, "Parent-child propagation hit depth cap");
            break;
        }
        let mut grew = false;
        for (child, parent) in &parent_edges {
            if blocked.contains_key(parent) && !blocked.contains_key(child) {
                blocked.insert(child.clone(), vec![format!("{parent} (parent-blocked)")]);
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    let mut stmt = conn
        .prepare("INSERT INTO blocked_issues_cache (issue_id, blocked_by_json) VALUES (?, ?)")?;
    for (issue_id, blockers) in &blocked {
        let json = serde_json::to_string(blockers)?;
        stmt.execute(rusqlite::params![issue_id, json])?;
    }

    debug!(blocked_count = blocked.len(), "Rebuilt blocked cache");
    Ok(blocked.len())
}

fn load_blocking_edges(conn: &Connection) -> Result<Vec<BlockerRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT d.issue_id, d.depends_on_id, d.type, d.metadata, b.status, b.close_reason
         FROM dependencies d
         LEFT JOIN issues b ON b.id = d.depends_on_id
         JOIN issues holder ON holder.id = d.issue_id
         WHERE d.type IN {BLOCKING_TYPES_SQL}
           AND holder.status NOT IN ('closed', 'tombstone')"
    ))?;
    let rows = stmt
        .query_map([], |row| {
            let dep_type: String = row.get(2)?;
            let status: Option<String> = row.get(4)?;
            Ok(BlockerRow {
                issue_id: row.get(0)?,
                depends_on_id: row.get(1)?,
                dep_type: dep_type.parse().unwrap_or(DependencyType::Related),
                metadata: row.get(3)?,
                blocker_status: status.map(|s| s.parse().unwrap_or(Status::Open)),
                blocker_close_reason: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// For each spawner: (total parent-child children, children in a terminal
/// status). Feeds the `waits-for` gates.
fn waits_for_child_counts(conn: &Connection) -> Result<HashMap<String, (usize, usize)>> {
    let mut stmt = conn.prepare(
        "SELECT d.depends_on_id,
                COUNT(*),
                SUM(CASE WHEN c.status IN ('closed', 'tombstone') THEN 1 ELSE 0 END)
         FROM dependencies d
         JOIN issues c ON c.id = d.issue_id
         WHERE d.type = 'parent-child'
         GROUP BY d.depends_on_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;
    let mut map = HashMap::new();
    for row in rows {
        let (parent, total, closed) = row?;
        map.insert(
            parent,
            (
                usize::try_from(total).unwrap_or(0),
                usize::try_from(closed).unwrap_or(0),
            ),
        );
    }
    Ok(map)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateMode {
    AllChildren,
    AnyChildren,
}

impl GateMode {
    /// Gate selection from opaque edge metadata; `{"gate":"any-children"}`
    /// opts in, anything else is the default.
    fn from_metadata(metadata: Option<&str>) -> Self {
        let Some(raw) = metadata else {
            return Self::AllChildren;
        };
        let gate = serde_json::from_str::<serde_json::Value>(raw)
            .ok()
            .and_then(|value| value.get("gate").and_then(|g| g.as_str().map(String::from)));
        match gate.as_deref() {
            Some("any-children") => Self::AnyChildren,
            _ => Self::AllChildren,
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

/// Would inserting the blocking edge `issue_id -> depends_on_id` close a
/// cycle? Walks outgoing blocking-family edges from the target, depth
/// capped, tracking visited IDs as whole tokens (`bd-1` never matches
/// inside `bd-10`).
///
/// # Errors
///
/// Propagates database failures.
pub fn would_create_cycle(conn: &Connection, issue_id: &str, depends_on_id: &str) -> Result<bool> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut frontier = vec![(depends_on_id.to_string(), 0_usize)];

    let mut stmt = conn.prepare(&format!(
        "SELECT depends_on_id FROM dependencies
         WHERE issue_id = ? AND type IN {BLOCKING_TYPES_SQL}"
    ))?;

    while let Some((current, depth)) = frontier.pop() {
        if current == issue_id {
            return Ok(true);
        }
        if depth >= CYCLE_SEARCH_DEPTH_LIMIT || !visited.insert(current.clone()) {
            continue;
        }
        let next: Vec<String> = stmt
            .query_map([&current], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        for target in next {
            if !is_external_target(&target) && !visited.contains(&target) {
                frontier.push((target, depth + 1));
            }
        }
    }
    Ok(false)
}

impl SqliteStorage {
    /// Every cycle currently present in the blocking subgraph; a healthy
    /// store returns none. Maintenance surface for lint-style callers.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn detect_all_cycles(&self) -> Result<Vec<Vec<String>>> {
        let mut graph: HashMap<String, Vec<String>> = HashMap::new();
        let mut stmt = self.conn().prepare(&format!(
            "SELECT issue_id, depends_on_id FROM dependencies WHERE type IN {BLOCKING_TYPES_SQL}"
        ))?;
        let edges = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for edge in edges {
            let (from, to) = edge?;
            graph.entry(from).or_default().push(to);
        }

        let mut cycles = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut keys: Vec<String> = graph.keys().cloned().collect();
        keys.sort();

        for start in keys {
            if visited.contains(&start) {
                continue;
            }
            // Iterative DFS with an explicit path for cycle reconstruction.
            let mut on_path: HashSet<String> = HashSet::new();
            let mut path: Vec<String> = Vec::new();
            let mut stack: Vec<(String, usize)> = vec![(start.clone(), 0)];
            visited.insert(start.clone());
            on_path.insert(start.clone());
            path.push(start);

            while let Some((node, cursor)) = stack.last_mut() {
                let neighbors = graph.get(node.as_str());
                let next = neighbors.and_then(|n| n.get(*cursor)).cloned();
                match next {
                    Some(target) => {
                        *cursor += 1;
                        if on_path.contains(&target) {
                            if let Some(pos) = path.iter().position(|p| p == &target) {
                                let mut cycle = path[pos..].to_vec();
                                cycle.push(target);
                                cycles.push(cycle);
                            }
                        } else if !visited.contains(&target) {
                            visited.insert(target.clone());
                            on_path.insert(target.clone());
                            path.push(target.clone());
                            stack.push((target, 0));
                        }
                    }
                    None => {
                        on_path.remove(node.as_str());
                        path.pop();
                        stack.pop();
                    }
                }
            }
        }
        Ok(cycles)
    }

    /// IDs currently in the blocked cache.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn blocked_ids(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT issue_id FROM blocked_issues_cache")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<HashSet<String>, _>>()?;
        Ok(ids)
    }

    /// Blocked issues with the blocker descriptions recorded at rebuild.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn blocked_issues(&self) -> Result<Vec<(Issue, Vec<String>)>> {
        let mut stmt = self.conn().prepare(
            "SELECT issue_id, blocked_by_json FROM blocked_issues_cache ORDER BY issue_id",
        )?;
        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;

        let mut result = Vec::new();
        for (issue_id, json) in rows {
            if let Some(issue) = self.get_issue_any(&issue_id)? {
                let blockers: Vec<String> = serde_json::from_str(&json).unwrap_or_default();
                result.push((issue, blockers));
            }
        }
        Ok(result)
    }

    /// Force a blocked-cache rebuild outside a mutation (import and tests
    /// use this).
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn rebuild_blocked_cache(&mut self) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let count = rebuild_blocked_cache_tx(&tx)?;
        tx.commit()?;
        Ok(count)
    }

    /// The ready-work query: active, unblocked, undeferred, unpinned,
    /// non-ephemeral issues under the given sort policy.
    ///
    /// # Errors
    ///
    /// Propagates database failures.
    pub fn ready_work(&self, filters: &ReadyFilters, sort: ReadySortPolicy) -> Result<Vec<Issue>> {
        let blocked = self.blocked_ids()?;

        let mut sql = format!(
            "SELECT {} FROM issues
             WHERE status IN ('open', 'in_progress')
               AND (defer_until IS NULL OR defer_until <= ?)
               AND pinned = 0
               AND ephemeral = 0
               AND is_template = 0",
            crate::storage::sqlite::ISSUE_COLUMNS
        );
        let now = chrono::Utc::now().to_rfc3339();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now)];

        if let Some(assignee) = &filters.assignee {
            sql.push_str(" AND assignee = ?");
            params.push(Box::new(assignee.clone()));
        }
        if filters.unassigned {
            sql.push_str(" AND assignee IS NULL");
        }

        sql.push_str(match sort {
            ReadySortPolicy::Hybrid => {
                " ORDER BY CASE WHEN priority <= 1 THEN 0 ELSE 1 END, created_at ASC"
            }
            ReadySortPolicy::Priority => " ORDER BY priority ASC, created_at ASC",
            ReadySortPolicy::Oldest => " ORDER BY created_at ASC",
        });

        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();
        let mut stmt = self.conn().prepare(&sql)?;
        let mut issues: Vec<Issue> = stmt
            .query_map(param_refs.as_slice(), issue_from_row)?
            .collect::<std::result::Result<_, _>>()?;

        issues.retain(|issue| !blocked.contains(&issue.id));

        if let Some(limit) = filters.limit {
            issues.truncate(limit);
        }
        Ok(issues)
    }

    /// Flat dependency-tree traversal from `root`.
    ///
    /// `down` follows `depends_on_id`, `up` follows reverse edges, `both`
    /// concatenates. Nodes come back ordered by `(depth, priority, id)`;
    /// by default only the shallowest occurrence of an ID survives, with
    /// `all_paths` keeping diamond revisits. In `down` mode external
    /// sentinels become synthesized leaves whose status is supplied by
    /// `resolver`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an absent root; database or resolver failures.
    pub fn dependency_tree(
        &self,
        root: &str,
        options: &TreeOptions,
        resolver: &dyn ExternalResolver,
    ) -> Result<Vec<TreeNode>> {
        if !self.id_exists(root)? {
            return Err(crate::error::BeadsError::IssueNotFound {
                id: root.to_string(),
            });
        }

        let mut nodes = Vec::new();
        match options.direction {
            TreeDirection::Down => {
                self.walk_tree(root, options, resolver, TreeDirection::Down, &mut nodes)?;
            }
            TreeDirection::Up => {
                self.walk_tree(root, options, resolver, TreeDirection::Up, &mut nodes)?;
            }
            TreeDirection::Both => {
                self.walk_tree(root, options, resolver, TreeDirection::Down, &mut nodes)?;
                let mut up = Vec::new();
                self.walk_tree(root, options, resolver, TreeDirection::Up, &mut up)?;
                // The root already appears in the downward half.
                nodes.extend(up.into_iter().filter(|node| node.depth > 0));
            }
        }

        nodes.sort_by(|a, b| {
            a.depth
                .cmp(&b.depth)
                .then(a.priority.cmp(&b.priority))
                .then(a.id.cmp(&b.id))
        });
        Ok(nodes)
    }

    fn walk_tree(
        &self,
        root: &str,
        options: &TreeOptions,
        resolver: &dyn ExternalResolver,
        direction: TreeDirection,
        out: &mut Vec<TreeNode>,
    ) -> Result<()> {
        let max_depth = options.max_depth.unwrap_or(DEFAULT_TREE_DEPTH);
        let mut shallowest: HashMap<String, usize> = HashMap::new();
        // Stack entries carry their own ancestor chain so diamond
        // traversal in all-paths mode cannot loop.
        let mut stack: Vec<(String, usize, Option<String>, Vec<String>)> =
            vec![(root.to_string(), 0, None, Vec::new())];

        while let Some((id, depth, parent, ancestors)) = stack.pop() {
            if !options.all_paths {
                match shallowest.get(&id) {
                    Some(&seen) if seen <= depth => continue,
                    _ => {
                        shallowest.insert(id.clone(), depth);
                    }
                }
            } else if ancestors.contains(&id) {
                continue;
            }

            if is_external_target(&id) {
                let status = match parse_external_sentinel(&id) {
                    Some((project, capability)) => resolver.resolve(project, capability)?,
                    None => None,
                };
                out.push(TreeNode {
                    id,
                    title: String::new(),
                    status,
                    priority: Priority::default(),
                    depth,
                    parent_id: parent,
                    truncated: false,
                    external: true,
                });
                continue;
            }

            let Some(issue) = self.issue_header(&id)? else {
                continue;
            };

            let next: Vec<String> = match direction {
                TreeDirection::Up => self
                    .dependents_of(&id)?
                    .into_iter()
                    .map(|dep| dep.issue_id)
                    .collect(),
                _ => self
                    .dependencies_of(&id)?
                    .into_iter()
                    .map(|dep| dep.depends_on_id)
                    .collect(),
            };
            let truncated = depth >= max_depth && !next.is_empty();

            out.push(TreeNode {
                id: id.clone(),
                title: issue.title,
                status: Some(issue.status),
                priority: issue.priority,
                depth,
                parent_id: parent,
                truncated,
                external: false,
            });

            if !truncated {
                let mut chain = ancestors;
                chain.push(id.clone());
                for target in next {
                    // Sentinels only materialize when walking downward.
                    if is_external_target(&target) && direction == TreeDirection::Up {
                        continue;
                    }
                    stack.push((target, depth + 1, Some(id.clone()), chain.clone()));
                }
            }
        }
        Ok(())
    }

    /// Status/priority/title header without relations, cheap enough for
    /// traversal.
    fn issue_header(&self, issue_id: &str) -> Result<Option<Issue>> {
        crate::storage::sqlite::get_issue_row_tx(self.conn(), issue_id)
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Filters for [`SqliteStorage::ready_work`].
#[derive(Debug, Clone, Default)]
pub struct ReadyFilters {
    pub assignee: Option<String>,
    pub unassigned: bool,
    pub limit: Option<usize>,
}

/// Sort policy for ready work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadySortPolicy {
    /// Urgent tier (P0/P1) first, oldest first within each tier.
    #[default]
    Hybrid,
    /// Priority ascending, then oldest first.
    Priority,
    /// Oldest first regardless of priority.
    Oldest,
}

impl std::str::FromStr for ReadySortPolicy {
    type Err = crate::error::BeadsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "hybrid" => Ok(Self::Hybrid),
            "priority" => Ok(Self::Priority),
            "oldest" => Ok(Self::Oldest),
            other => Err(crate::error::BeadsError::validation(
                "sort",
                format!("unknown sort policy '{other}'"),
            )),
        }
    }
}

/// Traversal direction for [`SqliteStorage::dependency_tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeDirection {
    #[default]
    Down,
    Up,
    Both,
}

/// Traversal options.
#[derive(Debug, Clone, Default)]
pub struct TreeOptions {
    pub direction: TreeDirection,
    /// Depth cap; `None` means the default of 50.
    pub max_depth: Option<usize>,
    /// Keep every path through diamonds instead of the shallowest.
    pub all_paths: bool,
}

/// One node of a flattened dependency tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub id: String,
    pub title: String,
    /// `None` for an external sentinel the resolver could not resolve.
    pub status: Option<Status>,
    pub priority: Priority,
    pub depth: usize,
    pub parent_id: Option<String>,
    /// Set when children exist beyond the depth cap.
    pub truncated: bool,
    /// Synthesized leaf for an `external:<project>:<capability>` target.
    pub external: bool,
}

/// Pull-only resolution of external sentinels to statuses. The engine
/// never opens a foreign store on its own; collaborators that can do so
/// implement this.
pub trait ExternalResolver {
    /// Resolve `external:<project>:<capability>` to the status of the
    /// providing issue, or `None` when unknown.
    ///
    /// # Errors
    ///
    /// Resolution failures propagate to the traversal caller.
    fn resolve(&self, project: &str, capability: &str) -> Result<Option<Status>>;
}

/// Resolver that knows nothing; every sentinel stays unresolved.
pub struct NoExternalResolution;

impl ExternalResolver for NoExternalResolution {
    fn resolve(&self, _project: &str, _capability: &str) -> Result<Option<Status>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dependency, DependencyType, Issue};
    use crate::storage::sqlite::IssuePatch;
    use crate::util::id::IdConfig;

    fn store() -> SqliteStorage {
        SqliteStorage::open_memory().unwrap()
    }

    fn create(store: &mut SqliteStorage, title: &str) -> Issue {
        store
            .create_issue(Issue::new("", title), None, &IdConfig::default(), &[], "t")
            .unwrap()
    }

    fn link(store: &mut SqliteStorage, from: &str, to: &str, dep_type: DependencyType) {
        store
            .add_dependency(&Dependency::new(from, to, dep_type), "t")
            .unwrap();
    }

    #[test]
    fn failure_keywords_match_case_insensitively() {
        assert!(close_reason_indicates_failure("task FAILED in CI"));
        assert!(close_reason_indicates_failure("Won't Fix"));
        assert!(close_reason_indicates_failure("upstream timeout"));
        assert!(!close_reason_indicates_failure("done"));
        assert!(!close_reason_indicates_failure(""));
    }

    #[test]
    fn blocks_edge_releases_on_terminal_blocker() {
        let mut store = store();
        let blocker = create(&mut store, "blocker");
        let holder = create(&mut store, "holder");
        link(&mut store, &holder.id, &blocker.id, DependencyType::Blocks);

        assert!(store.blocked_ids().unwrap().contains(&holder.id));

        store
            .close_issue(&blocker.id, Some("done"), None, false, "t")
            .unwrap();
        assert!(!store.blocked_ids().unwrap().contains(&holder.id));
    }

    #[test]
    fn conditional_blocks_holds_on_failure_close() {
        let mut store = store();
        let upstream = create(&mut store, "upstream");
        let holder = create(&mut store, "holder");
        link(
            &mut store,
            &holder.id,
            &upstream.id,
            DependencyType::ConditionalBlocks,
        );
        assert!(store.blocked_ids().unwrap().contains(&holder.id));

        store
            .close_issue(&upstream.id, Some("cancelled by owner"), None, false, "t")
            .unwrap();
        // Failure close keeps holding.
        assert!(store.blocked_ids().unwrap().contains(&holder.id));

        store.reopen_issue(&upstream.id, "t").unwrap();
        store
            .close_issue(&upstream.id, Some("shipped"), None, false, "t")
            .unwrap();
        assert!(!store.blocked_ids().unwrap().contains(&holder.id));
    }

    #[test]
    fn waits_for_gates_on_children() {
        let mut store = store();
        let spawner = create(&mut store, "spawner");
        let child_a = create(&mut store, "child a");
        let child_b = create(&mut store, "child b");
        let waiter = create(&mut store, "waiter");

        link(&mut store, &child_a.id, &spawner.id, DependencyType::ParentChild);
        link(&mut store, &child_b.id, &spawner.id, DependencyType::ParentChild);
        link(&mut store, &waiter.id, &spawner.id, DependencyType::WaitsFor);

        // Default gate: all children must close.
        assert!(store.blocked_ids().unwrap().contains(&waiter.id));

        store
            .close_issue(&child_a.id, Some("done"), None, false, "t")
            .unwrap();
        assert!(store.blocked_ids().unwrap().contains(&waiter.id));

        store
            .close_issue(&child_b.id, Some("done"), None, false, "t")
            .unwrap();
        assert!(!store.blocked_ids().unwrap().contains(&waiter.id));
    }

    #[test]
    fn waits_for_any_children_gate() {
        let mut store = store();
        let spawner = create(&mut store, "spawner");
        let child_a = create(&mut store, "child a");
        let child_b = create(&mut store, "child b");
        let waiter = create(&mut store, "waiter");

        link(&mut store, &child_a.id, &spawner.id, DependencyType::ParentChild);
        link(&mut store, &child_b.id, &spawner.id, DependencyType::ParentChild);
        let mut dep = Dependency::new(&waiter.id, &spawner.id, DependencyType::WaitsFor);
        dep.metadata = Some(r#"{"gate":"any-children"}"#.to_string());
        store.add_dependency(&dep, "t").unwrap();

        assert!(store.blocked_ids().unwrap().contains(&waiter.id));

        store
            .close_issue(&child_a.id, Some("done"), None, false, "t")
            .unwrap();
        assert!(!store.blocked_ids().unwrap().contains(&waiter.id));
    }

    #[test]
    fn parent_child_blocks_transitively_not_directly() {
        let mut store = store();
        let parent = create(&mut store, "parent");
        let child = create(&mut store, "child");
        link(&mut store, &child.id, &parent.id, DependencyType::ParentChild);

        // An idle (unblocked) parent does not hold its child.
        assert!(!store.blocked_ids().unwrap().contains(&child.id));

        // Block the parent; the child inherits it.
        let blocker = create(&mut store, "blocker");
        link(&mut store, &parent.id, &blocker.id, DependencyType::Blocks);
        let blocked = store.blocked_ids().unwrap();
        assert!(blocked.contains(&parent.id));
        assert!(blocked.contains(&child.id));

        // Grandchildren inherit too.
        let grandchild = create(&mut store, "grandchild");
        link(&mut store, &grandchild.id, &child.id, DependencyType::ParentChild);
        assert!(store.blocked_ids().unwrap().contains(&grandchild.id));
    }

    #[test]
    fn informational_edges_never_block() {
        let mut store = store();
        let a = create(&mut store, "a");
        let b = create(&mut store, "b");
        link(&mut store, &a.id, &b.id, DependencyType::RelatesTo);
        link(&mut store, &b.id, &a.id, DependencyType::DiscoveredFrom);
        store.rebuild_blocked_cache().unwrap();
        assert!(store.blocked_ids().unwrap().is_empty());
    }

    #[test]
    fn cycle_rejection_end_to_end() {
        let mut store = store();
        let a = create(&mut store, "a");
        let b = create(&mut store, "b");
        let c = create(&mut store, "c");
        link(&mut store, &a.id, &b.id, DependencyType::Blocks);
        link(&mut store, &b.id, &c.id, DependencyType::Blocks);

        let err = store
            .add_dependency(&Dependency::new(&c.id, &a.id, DependencyType::Blocks), "t")
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CycleDetected);

        // No row landed, the cache is unchanged, no cycles exist.
        assert!(store.dependencies_of(&c.id).unwrap().is_empty());
        assert!(store.detect_all_cycles().unwrap().is_empty());
    }

    #[test]
    fn relates_to_loops_are_legal() {
        let mut store = store();
        let a = create(&mut store, "a");
        let b = create(&mut store, "b");
        link(&mut store, &a.id, &b.id, DependencyType::RelatesTo);
        // The reverse informational edge is fine.
        store
            .add_dependency(&Dependency::new(&b.id, &a.id, DependencyType::RelatesTo), "t")
            .unwrap();
        assert!(store.detect_all_cycles().unwrap().is_empty());
    }

    #[test]
    fn cycle_check_is_token_aware() {
        let mut store = store();
        // IDs where one hash is a prefix of the other.
        store
            .create_issue(Issue::new("bd-1", "one"), None, &IdConfig::default(), &[], "t")
            .unwrap();
        store
            .create_issue(Issue::new("bd-10", "ten"), None, &IdConfig::default(), &[], "t")
            .unwrap();
        link(&mut store, "bd-1", "bd-10", DependencyType::Blocks);
        // bd-10 -> bd-1 would be a real cycle; but bd-10 -> bd-100 (absent)
        // must not be confused by substring matching. The legal edge back
        // from a third issue proves no spurious hit.
        let c = create(&mut store, "c");
        store
            .add_dependency(&Dependency::new("bd-10", &c.id, DependencyType::Blocks), "t")
            .unwrap();
        let err = store
            .add_dependency(&Dependency::new(&c.id, "bd-1", DependencyType::Blocks), "t")
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CycleDetected);
    }

    #[test]
    fn ready_work_scenario_create_close_unblock() {
        let mut store = store();
        let mut a_input = Issue::new("", "A");
        a_input.priority = Priority(1);
        let a = store
            .create_issue(a_input, None, &IdConfig::default(), &[], "t")
            .unwrap();
        let mut b_input = Issue::new("", "B");
        b_input.priority = Priority(2);
        let b = store
            .create_issue(b_input, None, &IdConfig::default(), &[], "t")
            .unwrap();
        link(&mut store, &b.id, &a.id, DependencyType::Blocks);

        let ready = store
            .ready_work(&ReadyFilters::default(), ReadySortPolicy::Hybrid)
            .unwrap();
        assert_eq!(
            ready.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            vec![a.id.as_str()]
        );

        store.close_issue(&a.id, Some("done"), None, false, "t").unwrap();
        let ready = store
            .ready_work(&ReadyFilters::default(), ReadySortPolicy::Hybrid)
            .unwrap();
        assert_eq!(
            ready.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            vec![b.id.as_str()]
        );
    }

    #[test]
    fn ready_work_excludes_deferred_pinned_ephemeral() {
        let mut store = store();
        let visible = create(&mut store, "visible");

        let deferred = create(&mut store, "deferred");
        let patch = IssuePatch {
            defer_until: Some(Some(chrono::Utc::now() + chrono::Duration::days(1))),
            ..Default::default()
        };
        store.update_issue(&deferred.id, &patch, "t").unwrap();

        let pinned = create(&mut store, "pinned");
        let patch = IssuePatch {
            pinned: Some(true),
            ..Default::default()
        };
        store.update_issue(&pinned.id, &patch, "t").unwrap();

        let mut eph = Issue::new("", "scratch");
        eph.ephemeral = true;
        store
            .create_issue(eph, None, &IdConfig::default(), &[], "t")
            .unwrap();

        let ready = store
            .ready_work(&ReadyFilters::default(), ReadySortPolicy::Oldest)
            .unwrap();
        assert_eq!(
            ready.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            vec![visible.id.as_str()]
        );
    }

    #[test]
    fn ready_sort_policies_order_differently() {
        let mut store = store();
        // Created in this order: old P3, mid P0, new P1.
        let mut i1 = Issue::new("", "old low");
        i1.priority = Priority(3);
        let old_low = store
            .create_issue(i1, None, &IdConfig::default(), &[], "t")
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut i2 = Issue::new("", "mid critical");
        i2.priority = Priority(0);
        let mid_critical = store
            .create_issue(i2, None, &IdConfig::default(), &[], "t")
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut i3 = Issue::new("", "new high");
        i3.priority = Priority(1);
        let new_high = store
            .create_issue(i3, None, &IdConfig::default(), &[], "t")
            .unwrap();

        let ids = |issues: &[Issue]| issues.iter().map(|i| i.id.clone()).collect::<Vec<_>>();

        let hybrid = store
            .ready_work(&ReadyFilters::default(), ReadySortPolicy::Hybrid)
            .unwrap();
        assert_eq!(
            ids(&hybrid),
            vec![mid_critical.id.clone(), new_high.id.clone(), old_low.id.clone()]
        );

        let oldest = store
            .ready_work(&ReadyFilters::default(), ReadySortPolicy::Oldest)
            .unwrap();
        assert_eq!(ids(&oldest)[0], old_low.id);

        let priority = store
            .ready_work(&ReadyFilters::default(), ReadySortPolicy::Priority)
            .unwrap();
        assert_eq!(ids(&priority), vec![mid_critical.id, new_high.id, old_low.id]);
    }

    #[test]
    fn tree_down_orders_and_dedupes() {
        let mut store = store();
        let root = create(&mut store, "root");
        let mid_a = create(&mut store, "mid a");
        let mid_b = create(&mut store, "mid b");
        let shared = create(&mut store, "shared leaf");

        link(&mut store, &root.id, &mid_a.id, DependencyType::Blocks);
        link(&mut store, &root.id, &mid_b.id, DependencyType::Blocks);
        link(&mut store, &mid_a.id, &shared.id, DependencyType::Blocks);
        link(&mut store, &mid_b.id, &shared.id, DependencyType::Blocks);

        let nodes = store
            .dependency_tree(&root.id, &TreeOptions::default(), &NoExternalResolution)
            .unwrap();
        // Diamond collapsed: root, two mids, one shared leaf.
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[0].id, root.id);
        assert_eq!(nodes[0].depth, 0);
        assert!(nodes.iter().filter(|n| n.id == shared.id).count() == 1);

        let all_paths = store
            .dependency_tree(
                &root.id,
                &TreeOptions {
                    all_paths: true,
                    ..Default::default()
                },
                &NoExternalResolution,
            )
            .unwrap();
        assert_eq!(all_paths.iter().filter(|n| n.id == shared.id).count(), 2);
    }

    #[test]
    fn tree_up_and_both_directions() {
        let mut store = store();
        let base = create(&mut store, "base");
        let dependent = create(&mut store, "dependent");
        link(&mut store, &dependent.id, &base.id, DependencyType::Blocks);

        let up = store
            .dependency_tree(
                &base.id,
                &TreeOptions {
                    direction: TreeDirection::Up,
                    ..Default::default()
                },
                &NoExternalResolution,
            )
            .unwrap();
        assert_eq!(up.len(), 2);
        assert_eq!(up[1].id, dependent.id);
        assert_eq!(up[1].parent_id.as_deref(), Some(base.id.as_str()));

        let both = store
            .dependency_tree(
                &base.id,
                &TreeOptions {
                    direction: TreeDirection::Both,
                    ..Default::default()
                },
                &NoExternalResolution,
            )
            .unwrap();
        // Root once, dependent once.
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn tree_depth_cap_marks_truncation() {
        let mut store = store();
        let a = create(&mut store, "a");
        let b = create(&mut store, "b");
        let c = create(&mut store, "c");
        link(&mut store, &a.id, &b.id, DependencyType::Blocks);
        link(&mut store, &b.id, &c.id, DependencyType::Blocks);

        let nodes = store
            .dependency_tree(
                &a.id,
                &TreeOptions {
                    max_depth: Some(1),
                    ..Default::default()
                },
                &NoExternalResolution,
            )
            .unwrap();
        assert_eq!(nodes.len(), 2);
        let b_node = nodes.iter().find(|n| n.id == b.id).unwrap();
        assert!(b_node.truncated);
    }

    #[test]
    fn tree_synthesizes_external_leaves() {
        struct FixedResolver;
        impl ExternalResolver for FixedResolver {
            fn resolve(&self, project: &str, capability: &str) -> Result<Option<Status>> {
                assert_eq!(project, "auth");
                assert_eq!(capability, "tokens");
                Ok(Some(Status::Closed))
            }
        }

        let mut store = store();
        let a = create(&mut store, "a");
        link(
            &mut store,
            &a.id,
            "external:auth:tokens",
            DependencyType::Blocks,
        );

        let nodes = store
            .dependency_tree(&a.id, &TreeOptions::default(), &FixedResolver)
            .unwrap();
        assert_eq!(nodes.len(), 2);
        let leaf = &nodes[1];
        assert!(leaf.external);
        assert_eq!(leaf.id, "external:auth:tokens");
        assert_eq!(leaf.status, Some(Status::Closed));

        // Without a resolver the sentinel stays unresolved.
        let nodes = store
            .dependency_tree(&a.id, &TreeOptions::default(), &NoExternalResolution)
            .unwrap();
        assert_eq!(nodes[1].status, None);
    }

    #[test]
    fn gate_mode_parsing() {
        assert_eq!(GateMode::from_metadata(None), GateMode::AllChildren);
        assert_eq!(
            GateMode::from_metadata(Some(r#"{"gate":"any-children"}"#)),
            GateMode::AnyChildren
        );
        assert_eq!(
            GateMode::from_metadata(Some(r#"{"gate":"all-children"}"#)),
            GateMode::AllChildren
        );
        assert_eq!(GateMode::from_metadata(Some("not json")), GateMode::AllChildren);
    }
}
