//! Engine configuration and workspace layout.
//!
//! The engine's knobs travel in the process environment (the collaborator
//! owns richer config surfaces); this module reads them, applies defaults,
//! and derives the fixed workspace layout:
//!
//! ```text
//! <workspace>/
//!   beads.db       relational store
//!   issues.jsonl   textual mirror (canonical name)
//!   .sync.lock     cross-process advisory lock
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{BeadsError, Result};
use crate::util::id::IdConfig;

/// Database file name within the workspace.
pub const DB_FILE: &str = "beads.db";

/// Canonical mirror file name.
pub const MIRROR_FILE: &str = "issues.jsonl";

/// Accepted legacy mirror name.
pub const MIRROR_FALLBACK: &str = "beads.jsonl";

/// Advisory lock file name.
pub const SYNC_LOCK_FILE: &str = ".sync.lock";

/// Files that look like mirrors but must never be selected by discovery:
/// side-channel logs and three-way-merge scratch files.
pub const EXCLUDED_MIRROR_NAMES: &[&str] = &[
    "deletions.jsonl",
    "interactions.jsonl",
    "beads.base.jsonl",
    "beads.left.jsonl",
    "beads.right.jsonl",
];

/// How import treats a `parent-child` edge whose parent is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrphanMode {
    /// Fail the import.
    Strict,
    /// Create a placeholder closed parent (recursing up the ancestry).
    Resurrect,
    /// Drop the child record with a warning.
    Skip,
    /// Keep the dangling edge.
    #[default]
    Allow,
}

impl OrphanMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Resurrect => "resurrect",
            Self::Skip => "skip",
            Self::Allow => "allow",
        }
    }
}

impl FromStr for OrphanMode {
    type Err = BeadsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "resurrect" => Ok(Self::Resurrect),
            "skip" => Ok(Self::Skip),
            "allow" => Ok(Self::Allow),
            other => Err(BeadsError::validation(
                "orphan_handling",
                format!("unknown mode '{other}' (strict, resurrect, skip, allow)"),
            )),
        }
    }
}

/// Environment-carried engine configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// The workspace directory holding store, mirror, and lock.
    pub workspace_dir: PathBuf,
    /// Issue ID prefix; inferred on cold start when absent.
    pub issue_prefix: Option<String>,
    /// Additional prefixes import accepts without rename.
    pub allowed_prefixes: Vec<String>,
    /// Birthday-bound collision probability for ID sizing.
    pub max_collision_prob: f64,
    pub min_hash_length: usize,
    pub max_hash_length: usize,
    /// Maximum dotted child depth.
    pub hierarchy_max_depth: usize,
    pub orphan_handling: OrphanMode,
    /// Stable workspace identity stirred into ID seeds.
    pub workspace_id: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("."),
            issue_prefix: None,
            allowed_prefixes: Vec::new(),
            max_collision_prob: 0.25,
            min_hash_length: 3,
            max_hash_length: 8,
            hierarchy_max_depth: 3,
            orphan_handling: OrphanMode::default(),
            workspace_id: None,
        }
    }
}

impl CoreConfig {
    /// A config rooted at `workspace_dir` with defaults elsewhere.
    #[must_use]
    pub fn for_workspace(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            ..Default::default()
        }
    }

    /// Read configuration from `BEADS_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    ///
    /// Recognized: `BEADS_WORKSPACE_DIR`, `BEADS_ISSUE_PREFIX`,
    /// `BEADS_ALLOWED_PREFIXES` (comma separated),
    /// `BEADS_MAX_COLLISION_PROB`, `BEADS_MIN_HASH_LENGTH`,
    /// `BEADS_MAX_HASH_LENGTH`, `BEADS_HIERARCHY_MAX_DEPTH`,
    /// `BEADS_ORPHAN_HANDLING`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var("BEADS_WORKSPACE_DIR") {
            if !dir.is_empty() {
                config.workspace_dir = PathBuf::from(dir);
            }
        }
        if let Ok(prefix) = env::var("BEADS_ISSUE_PREFIX") {
            if !prefix.is_empty() {
                config.issue_prefix = Some(prefix);
            }
        }
        if let Ok(list) = env::var("BEADS_ALLOWED_PREFIXES") {
            config.allowed_prefixes = list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Some(prob) = env_parse::<f64>("BEADS_MAX_COLLISION_PROB") {
            if prob > 0.0 && prob < 1.0 {
                config.max_collision_prob = prob;
            }
        }
        if let Some(len) = env_parse::<usize>("BEADS_MIN_HASH_LENGTH") {
            config.min_hash_length = len.max(1);
        }
        if let Some(len) = env_parse::<usize>("BEADS_MAX_HASH_LENGTH") {
            config.max_hash_length = len.max(config.min_hash_length);
        }
        if let Some(depth) = env_parse::<usize>("BEADS_HIERARCHY_MAX_DEPTH") {
            config.hierarchy_max_depth = depth;
        }
        if let Ok(mode) = env::var("BEADS_ORPHAN_HANDLING") {
            if let Ok(parsed) = mode.parse() {
                config.orphan_handling = parsed;
            }
        }

        config
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.workspace_dir.join(DB_FILE)
    }

    #[must_use]
    pub fn mirror_path(&self) -> PathBuf {
        self.workspace_dir.join(MIRROR_FILE)
    }

    #[must_use]
    pub fn sync_lock_path(&self) -> PathBuf {
        self.workspace_dir.join(SYNC_LOCK_FILE)
    }

    /// The ID generator settings implied by this config. The prefix falls
    /// back to the workspace directory name when nothing is configured.
    #[must_use]
    pub fn id_config(&self) -> IdConfig {
        IdConfig {
            prefix: self
                .issue_prefix
                .clone()
                .unwrap_or_else(|| workspace_dir_name(&self.workspace_dir)),
            min_hash_length: self.min_hash_length,
            max_hash_length: self.max_hash_length,
            max_collision_prob: self.max_collision_prob,
            workspace_id: self.workspace_id.clone(),
            hierarchy_max_depth: self.hierarchy_max_depth,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// The workspace directory's own name, used as the prefix of last resort.
#[must_use]
pub fn workspace_dir_name(workspace_dir: &Path) -> String {
    workspace_dir
        .file_name()
        .map_or_else(|| "bd".to_string(), |n| n.to_string_lossy().to_string())
}

/// Whether a file name is banned from mirror discovery.
#[must_use]
pub fn is_excluded_mirror_name(name: &str) -> bool {
    EXCLUDED_MIRROR_NAMES.contains(&name)
}

/// Locate the mirror file in a workspace: `issues.jsonl` wins, then
/// `beads.jsonl`; excluded names are never considered. Returns `None` when
/// no mirror exists yet.
#[must_use]
pub fn discover_mirror(workspace_dir: &Path) -> Option<PathBuf> {
    for name in [MIRROR_FILE, MIRROR_FALLBACK] {
        debug_assert!(!is_excluded_mirror_name(name));
        let candidate = workspace_dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn workspace_layout_paths() {
        let config = CoreConfig::for_workspace("/tmp/ws");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/ws/beads.db"));
        assert_eq!(config.mirror_path(), PathBuf::from("/tmp/ws/issues.jsonl"));
        assert_eq!(config.sync_lock_path(), PathBuf::from("/tmp/ws/.sync.lock"));
    }

    #[test]
    fn discovery_prefers_canonical_name() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("beads.jsonl"), "").unwrap();
        assert_eq!(
            discover_mirror(dir.path()).unwrap().file_name().unwrap(),
            "beads.jsonl"
        );

        fs::write(dir.path().join("issues.jsonl"), "").unwrap();
        assert_eq!(
            discover_mirror(dir.path()).unwrap().file_name().unwrap(),
            "issues.jsonl"
        );
    }

    #[test]
    fn discovery_never_selects_scratch_files() {
        let dir = TempDir::new().unwrap();
        for name in EXCLUDED_MIRROR_NAMES {
            fs::write(dir.path().join(name), "").unwrap();
        }
        assert!(discover_mirror(dir.path()).is_none());
        assert!(is_excluded_mirror_name("beads.left.jsonl"));
        assert!(!is_excluded_mirror_name("issues.jsonl"));
    }

    #[test]
    fn orphan_mode_parses_all_variants() {
        for (text, mode) in [
            ("strict", OrphanMode::Strict),
            ("resurrect", OrphanMode::Resurrect),
            ("skip", OrphanMode::Skip),
            ("allow", OrphanMode::Allow),
        ] {
            assert_eq!(text.parse::<OrphanMode>().unwrap(), mode);
            assert_eq!(mode.as_str(), text);
        }
        assert!("lenient".parse::<OrphanMode>().is_err());
    }

    #[test]
    fn id_config_prefix_falls_back_to_dir_name() {
        let config = CoreConfig::for_workspace("/projects/rocket");
        assert_eq!(config.id_config().prefix, "rocket");

        let mut named = config;
        named.issue_prefix = Some("rk".to_string());
        assert_eq!(named.id_config().prefix, "rk");
    }
}
