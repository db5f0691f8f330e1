//! Process-local "last issue touched" affinity.
//!
//! Collaborators use this to resolve shorthand like "the issue I just
//! created". It is deliberately not persistent: the engine keeps no hidden
//! state on disk, and a fresh process starts with no affinity.

use once_cell::sync::Lazy;
use std::sync::Mutex;

static LAST_TOUCHED: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

/// Record the most recently touched issue ID.
pub fn set(id: &str) {
    if let Ok(mut slot) = LAST_TOUCHED.lock() {
        *slot = Some(id.to_string());
    }
}

/// The most recently touched issue ID, if any mutation ran this process.
#[must_use]
pub fn get() -> Option<String> {
    LAST_TOUCHED.lock().ok().and_then(|slot| slot.clone())
}

/// Forget the affinity (used by tests and by wipe-style operations).
pub fn clear() {
    if let Ok(mut slot) = LAST_TOUCHED.lock() {
        *slot = None;
    }
}
