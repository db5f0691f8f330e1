//! Issue identity: generation, parsing, and partial-ID resolution.
//!
//! IDs have the shape `<prefix>-<hash>` with an optional dotted child path
//! (`bd-a1b2.3.1`). The hash is lowercase base36, sized adaptively: short
//! enough to type while the store is small, growing as the birthday bound
//! demands.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::{BeadsError, Result};

/// Hash length used when the collision-probability computation itself
/// fails (non-finite input).
const DEGRADED_LENGTH: usize = 6;

/// Hash length used when every nonce at every permitted length collided.
const OVERFLOW_LENGTH: usize = 16;

/// Nonces tried per candidate length before growing the hash.
const NONCES_PER_LENGTH: u32 = 10;

/// Hard bound on overflow nonce probing; beyond this the ID space is
/// treated as exhausted.
const OVERFLOW_NONCE_BUDGET: u32 = 1000;

/// Tunables for ID generation.
#[derive(Debug, Clone)]
pub struct IdConfig {
    /// Issue ID prefix (e.g. "bd").
    pub prefix: String,
    /// Smallest hash length considered.
    pub min_hash_length: usize,
    /// Largest hash length before the overflow fallback.
    pub max_hash_length: usize,
    /// Acceptable birthday-paradox collision probability.
    pub max_collision_prob: f64,
    /// Stirred into the seed so distinct workspaces diverge even on
    /// identical content.
    pub workspace_id: Option<String>,
    /// Maximum dotted hierarchy depth.
    pub hierarchy_max_depth: usize,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            prefix: "bd".to_string(),
            min_hash_length: 3,
            max_hash_length: 8,
            max_collision_prob: 0.25,
            workspace_id: None,
            hierarchy_max_depth: 3,
        }
    }
}

impl IdConfig {
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }
}

/// Generates collision-checked issue IDs.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    config: IdConfig,
}

impl IdGenerator {
    #[must_use]
    pub const fn new(config: IdConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    /// Smallest hash length whose birthday collision probability against
    /// `issue_count` existing top-level issues stays within the configured
    /// bound.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn length_for(&self, issue_count: usize) -> usize {
        let n = issue_count as f64;
        for len in self.config.min_hash_length..=self.config.max_hash_length {
            let space = 36_f64.powi(len as i32);
            // P(collision) ~= 1 - e^(-n^2 / 2d)
            let prob = 1.0 - (-(n * n) / (2.0 * space)).exp();
            if !prob.is_finite() {
                return DEGRADED_LENGTH;
            }
            if prob <= self.config.max_collision_prob {
                return len;
            }
        }
        self.config.max_hash_length
    }

    /// Generate a unique ID for a new top-level issue.
    ///
    /// `exists` reports whether a candidate is already taken (in the store
    /// or in the same batch). Collisions walk nonces 0..10 at the chosen
    /// length, then grow the length, then fall back to a 16-character hash.
    ///
    /// # Errors
    ///
    /// `IdExhausted` when the overflow nonce budget runs out, which only
    /// happens if the existence check is broken or the store is
    /// pathologically full.
    pub fn generate<F>(
        &self,
        title: &str,
        description: Option<&str>,
        creator: Option<&str>,
        created_at: DateTime<Utc>,
        issue_count: usize,
        exists: F,
    ) -> Result<String>
    where
        F: Fn(&str) -> bool,
    {
        let mut length = self.length_for(issue_count);

        loop {
            for nonce in 0..NONCES_PER_LENGTH {
                let id = self.candidate(title, description, creator, created_at, nonce, length);
                if !exists(&id) {
                    return Ok(id);
                }
            }

            if length < self.config.max_hash_length {
                length += 1;
                continue;
            }

            // Every permitted length is saturated for the first ten nonces;
            // widen to the overflow length and keep walking nonces.
            for nonce in 0..OVERFLOW_NONCE_BUDGET {
                let id =
                    self.candidate(title, description, creator, created_at, nonce, OVERFLOW_LENGTH);
                if !exists(&id) {
                    return Ok(id);
                }
            }

            return Err(BeadsError::IdExhausted {
                prefix: self.config.prefix.clone(),
            });
        }
    }

    /// Deterministic candidate for a given nonce and length.
    #[must_use]
    pub fn candidate(
        &self,
        title: &str,
        description: Option<&str>,
        creator: Option<&str>,
        created_at: DateTime<Utc>,
        nonce: u32,
        length: usize,
    ) -> String {
        let seed = format!(
            "{}|{}|{}|{}|{}|{}",
            title,
            description.unwrap_or(""),
            creator.unwrap_or(""),
            created_at.timestamp_nanos_opt().unwrap_or(0),
            nonce,
            self.config.workspace_id.as_deref().unwrap_or("")
        );
        format!("{}-{}", self.config.prefix, hash_fragment(&seed, length))
    }

    /// Build a child ID under `parent_id` with the next counter value.
    ///
    /// # Errors
    ///
    /// `Validation` when the parent already sits at the hierarchy depth cap.
    pub fn child_of(&self, parent_id: &str, next_child_number: u32) -> Result<String> {
        let depth = id_depth(parent_id);
        if depth + 1 > self.config.hierarchy_max_depth {
            return Err(BeadsError::validation(
                "id",
                format!(
                    "hierarchy depth limit is {} ({parent_id} is already at depth {depth})",
                    self.config.hierarchy_max_depth
                ),
            ));
        }
        Ok(format!("{parent_id}.{next_child_number}"))
    }
}

/// Lowercase-base36 fragment of `length` chars derived from SHA-256 of the
/// seed. The first 16 digest bytes feed a u128, which covers the overflow
/// length with room to spare.
#[must_use]
pub fn hash_fragment(seed: &str, length: usize) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let mut num = 0u128;
    for &byte in digest.iter().take(16) {
        num = (num << 8) | u128::from(byte);
    }
    let mut encoded = base36(num);
    if encoded.len() < length {
        encoded = format!("{encoded:0>length$}");
    }
    encoded.chars().take(length).collect()
}

fn base36(mut num: u128) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if num == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while num > 0 {
        out.push(ALPHABET[(num % 36) as usize] as char);
        num /= 36;
    }
    out.into_iter().rev().collect()
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Structured view of an issue ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId {
    pub prefix: String,
    pub hash: String,
    /// Dotted child segments, outermost first.
    pub child_path: Vec<u32>,
}

impl ParsedId {
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.child_path.is_empty()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.child_path.len()
    }

    /// Immediate parent, or `None` for root IDs.
    #[must_use]
    pub fn parent(&self) -> Option<String> {
        if self.child_path.is_empty() {
            return None;
        }
        let mut path = self.child_path.clone();
        path.pop();
        let mut id = format!("{}-{}", self.prefix, self.hash);
        for seg in path {
            id.push('.');
            id.push_str(&seg.to_string());
        }
        Some(id)
    }
}

/// Parse `<prefix>-<hash>[.n]*`.
///
/// The **last** dash separates prefix from hash, so dashed prefixes like
/// `my-proj` survive. The hash must be lowercase base36; child segments
/// must be purely numeric.
///
/// # Errors
///
/// `InvalidId` on any structural violation.
pub fn parse_id(id: &str) -> Result<ParsedId> {
    let Some(dash) = id.rfind('-') else {
        return Err(BeadsError::InvalidId { id: id.to_string() });
    };
    let prefix = &id[..dash];
    let remainder = &id[dash + 1..];
    if prefix.is_empty() || remainder.is_empty() {
        return Err(BeadsError::InvalidId { id: id.to_string() });
    }

    let mut segments = remainder.split('.');
    let hash = segments.next().unwrap_or_default();
    if hash.is_empty()
        || !hash
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(BeadsError::InvalidId { id: id.to_string() });
    }

    let mut child_path = Vec::new();
    for segment in segments {
        match segment.parse::<u32>() {
            Ok(n) => child_path.push(n),
            Err(_) => return Err(BeadsError::InvalidId { id: id.to_string() }),
        }
    }

    Ok(ParsedId {
        prefix: prefix.to_string(),
        hash: hash.to_string(),
        child_path,
    })
}

/// Split `id` into parent and trailing child number, honoring dots inside
/// prefixes: only the last dot followed by a purely numeric suffix counts.
#[must_use]
pub fn parent_and_child_number(id: &str) -> Option<(&str, u32)> {
    let dot = id.rfind('.')?;
    let suffix = &id[dot + 1..];
    if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    suffix.parse::<u32>().ok().map(|n| (&id[..dot], n))
}

/// Dotted hierarchy depth of an ID (0 for roots). Counts only trailing
/// numeric segments, so dots inside the prefix do not inflate the depth.
#[must_use]
pub fn id_depth(id: &str) -> usize {
    let mut depth = 0;
    let mut rest = id;
    while let Some((parent, _)) = parent_and_child_number(rest) {
        depth += 1;
        rest = parent;
    }
    depth
}

/// The hash portion of an ID (between the last dash and the child path).
#[must_use]
pub fn hash_portion(id: &str) -> &str {
    let after_dash = id.rfind('-').map_or(id, |pos| &id[pos + 1..]);
    after_dash.split('.').next().unwrap_or(after_dash)
}

/// Validate that an ID carries the expected or an allowed prefix.
///
/// # Errors
///
/// `InvalidId` for malformed IDs; `PrefixMismatch` otherwise.
pub fn validate_prefix(id: &str, expected: &str, allowed: &[String]) -> Result<()> {
    let parsed = parse_id(id)?;
    if parsed.prefix == expected || allowed.iter().any(|p| p == &parsed.prefix) {
        return Ok(());
    }
    Err(BeadsError::PrefixMismatch {
        expected: expected.to_string(),
        found: vec![id.to_string()],
    })
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Candidate lookups a resolver needs from the store. Substring candidates
/// must exclude tombstones; exact lookups must not.
pub trait IdIndex {
    /// Does this exact ID exist?
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn id_exists(&self, id: &str) -> Result<bool>;

    /// IDs whose hash portion equals `hash`, across all prefixes.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn ids_with_hash(&self, hash: &str) -> Result<Vec<String>>;

    /// Non-tombstone IDs whose hash portion contains `fragment`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn ids_containing(&self, fragment: &str) -> Result<Vec<String>>;
}

/// Resolve user input to a full issue ID.
///
/// Order: exact match; prefix-normalized exact match; exact hash-portion
/// match across prefixes; substring match. More than one surviving
/// candidate is an ambiguity error carrying the candidate list.
///
/// # Errors
///
/// `InvalidId` for empty input, `AmbiguousId` with candidates, or
/// `IssueNotFound`.
pub fn resolve_id(input: &str, default_prefix: &str, index: &impl IdIndex) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(BeadsError::InvalidId { id: String::new() });
    }
    let normalized = trimmed.to_lowercase();

    if index.id_exists(&normalized)? {
        return Ok(normalized);
    }

    if !normalized.contains('-') {
        let with_prefix = format!("{default_prefix}-{normalized}");
        if index.id_exists(&with_prefix)? {
            return Ok(with_prefix);
        }
    }

    let fragment = hash_portion(&normalized);
    if !fragment.is_empty() {
        let exact = index.ids_with_hash(fragment)?;
        match exact.len() {
            1 => return Ok(exact.into_iter().next().unwrap_or_default()),
            n if n > 1 => {
                return Err(BeadsError::AmbiguousId {
                    partial: trimmed.to_string(),
                    matches: exact,
                });
            }
            _ => {}
        }

        let fuzzy = index.ids_containing(fragment)?;
        match fuzzy.len() {
            1 => return Ok(fuzzy.into_iter().next().unwrap_or_default()),
            n if n > 1 => {
                return Err(BeadsError::AmbiguousId {
                    partial: trimmed.to_string(),
                    matches: fuzzy,
                });
            }
            _ => {}
        }
    }

    Err(BeadsError::IssueNotFound {
        id: trimmed.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeIndex {
        ids: Vec<String>,
        tombstones: HashSet<String>,
    }

    impl FakeIndex {
        fn new(ids: &[&str]) -> Self {
            Self {
                ids: ids.iter().map(ToString::to_string).collect(),
                tombstones: HashSet::new(),
            }
        }
    }

    impl IdIndex for FakeIndex {
        fn id_exists(&self, id: &str) -> Result<bool> {
            Ok(self.ids.iter().any(|i| i == id))
        }

        fn ids_with_hash(&self, hash: &str) -> Result<Vec<String>> {
            Ok(self
                .ids
                .iter()
                .filter(|id| hash_portion(id) == hash)
                .cloned()
                .collect())
        }

        fn ids_containing(&self, fragment: &str) -> Result<Vec<String>> {
            Ok(self
                .ids
                .iter()
                .filter(|id| {
                    !self.tombstones.contains(*id) && hash_portion(id).contains(fragment)
                })
                .cloned()
                .collect())
        }
    }

    #[test]
    fn exact_match_beats_longer_siblings() {
        let index = FakeIndex::new(&["bd-1", "bd-10", "bd-100"]);
        assert_eq!(resolve_id("bd-1", "bd", &index).unwrap(), "bd-1");
    }

    #[test]
    fn bare_hash_normalizes_with_default_prefix() {
        let index = FakeIndex::new(&["bd-abc12"]);
        assert_eq!(resolve_id("abc12", "bd", &index).unwrap(), "bd-abc12");
    }

    #[test]
    fn hash_portion_matches_across_prefixes() {
        let index = FakeIndex::new(&["proj-k7x", "bd-other"]);
        assert_eq!(resolve_id("k7x", "bd", &index).unwrap(), "proj-k7x");
    }

    #[test]
    fn substring_ambiguity_lists_candidates() {
        let index = FakeIndex::new(&["bd-abc1", "bd-abd2"]);
        match resolve_id("ab", "bd", &index) {
            Err(BeadsError::AmbiguousId { matches, .. }) => {
                assert_eq!(matches.len(), 2);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn tombstones_are_invisible_to_substring_search() {
        let mut index = FakeIndex::new(&["bd-abc1", "bd-abd2"]);
        index.tombstones.insert("bd-abd2".to_string());
        assert_eq!(resolve_id("ab", "bd", &index).unwrap(), "bd-abc1");
    }

    #[test]
    fn unresolvable_input_is_not_found() {
        let index = FakeIndex::new(&["bd-abc1"]);
        assert!(matches!(
            resolve_id("zzz", "bd", &index),
            Err(BeadsError::IssueNotFound { .. })
        ));
    }

    #[test]
    fn parse_round_and_child_ids() {
        let root = parse_id("bd-a1b2").unwrap();
        assert!(root.is_root());
        assert_eq!(root.parent(), None);

        let child = parse_id("bd-a1b2.4.2").unwrap();
        assert_eq!(child.child_path, vec![4, 2]);
        assert_eq!(child.parent().as_deref(), Some("bd-a1b2.4"));
    }

    #[test]
    fn dashed_prefix_parses_on_last_dash() {
        let parsed = parse_id("my-proj-a1b2").unwrap();
        assert_eq!(parsed.prefix, "my-proj");
        assert_eq!(parsed.hash, "a1b2");
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(parse_id("noprefix").is_err());
        assert!(parse_id("bd-").is_err());
        assert!(parse_id("bd-ABC").is_err());
        assert!(parse_id("bd-abc.x").is_err());
    }

    #[test]
    fn child_number_detection_honors_numeric_suffixes_only() {
        assert_eq!(parent_and_child_number("bd-abc.3"), Some(("bd-abc", 3)));
        assert_eq!(
            parent_and_child_number("bd-abc.3.10"),
            Some(("bd-abc.3", 10))
        );
        assert_eq!(parent_and_child_number("bd-abc"), None);
        // A dot inside the prefix is not a child separator.
        assert_eq!(parent_and_child_number("my.team-abc"), None);
        assert_eq!(id_depth("my.team-abc.2"), 1);
    }

    #[test]
    fn adaptive_length_grows_with_store_size() {
        let generator = IdGenerator::new(IdConfig::default());
        assert_eq!(generator.length_for(0), 3);
        assert_eq!(generator.length_for(10), 3);
        let large = generator.length_for(10_000);
        assert!(large >= 4, "10k issues need more than 3 chars, got {large}");
        assert!(large <= 8);
    }

    #[test]
    fn ten_thousand_issues_meet_birthday_bound() {
        // L >= ceil(log_36(N^2 / 2p)) with N = 10_000, p = 0.25.
        let generator = IdGenerator::new(IdConfig::default());
        let len = generator.length_for(10_000);
        let bound = ((10_000.0_f64 * 10_000.0) / (2.0 * 0.25)).log(36.0).ceil() as usize;
        assert!(len >= bound.min(8));
    }

    #[test]
    fn generator_walks_nonces_on_collision() {
        let generator = IdGenerator::new(IdConfig::default());
        let now = Utc::now();
        let mut taken = HashSet::new();

        let first = generator
            .generate("same title", None, None, now, 0, |id| taken.contains(id))
            .unwrap();
        taken.insert(first.clone());

        let second = generator
            .generate("same title", None, None, now, 0, |id| taken.contains(id))
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn overflow_falls_back_to_sixteen_chars() {
        let config = IdConfig {
            min_hash_length: 3,
            max_hash_length: 3,
            ..Default::default()
        };
        let generator = IdGenerator::new(config);
        let now = Utc::now();
        // Refuse every short candidate; only 16-char hashes get through.
        let id = generator
            .generate("t", None, None, now, 0, |candidate| {
                hash_portion(candidate).len() < OVERFLOW_LENGTH
            })
            .unwrap();
        assert_eq!(hash_portion(&id).len(), OVERFLOW_LENGTH);
    }

    #[test]
    fn child_depth_cap_is_enforced() {
        let generator = IdGenerator::new(IdConfig::default());
        assert_eq!(generator.child_of("bd-abc", 1).unwrap(), "bd-abc.1");
        assert_eq!(generator.child_of("bd-abc.1.2", 5).unwrap(), "bd-abc.1.2.5");
        assert!(generator.child_of("bd-abc.1.2.3", 1).is_err());
    }

    #[test]
    fn workspace_id_diverges_candidates() {
        let now = Utc::now();
        let plain = IdGenerator::new(IdConfig::default());
        let seeded = IdGenerator::new(IdConfig {
            workspace_id: Some("ws-1".to_string()),
            ..Default::default()
        });
        assert_ne!(
            plain.candidate("t", None, None, now, 0, 8),
            seeded.candidate("t", None, None, now, 0, 8)
        );
    }
}
