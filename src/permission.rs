//! Canonical permission levels.
//!
//! The API reports access as a set of boolean capability flags; the store
//! keeps a single permission string per principal and resource.
use std::collections::{BTreeMap, HashMap};

/// Permission levels from most to least privileged.
pub const PERMISSION_ORDER: [&str; 5] = ["admin", "maintain", "push", "triage", "pull"];

fn normalize(permission: &str) -> String {
    permission.trim().to_ascii_lowercase()
}

/// Position in `PERMISSION_ORDER`; lower is more privileged. Unknown levels
/// rank below every known one.
fn rank(permission: &str) -> usize {
    let permission = normalize(permission);
    PERMISSION_ORDER
        .iter()
        .position(|p| *p == permission)
        .unwrap_or(PERMISSION_ORDER.len())
}

/// Highest-priority permission whose flag is set, or an empty string.
pub fn resolve(flags: &HashMap<String, bool>) -> String {
    flags
        .iter()
        .filter(|(_, enabled)| **enabled)
        .map(|(name, _)| normalize(name))
        .filter(|name| rank(name) < PERMISSION_ORDER.len())
        .min_by_key(|name| rank(name))
        .unwrap_or_default()
}

/// The more privileged of two resolved permissions.
pub fn max_permission(current: &str, candidate: &str) -> String {
    let current = normalize(current);
    let candidate = normalize(candidate);
    if current.is_empty() {
        return candidate;
    }
    if candidate.is_empty() {
        return current;
    }
    if rank(&candidate) < rank(&current) {
        candidate
    } else {
        current
    }
}

/// Merges direct and team-derived grants keyed by login into effective
/// permissions.
pub fn merge_effective(
    direct: &BTreeMap<String, String>,
    team_derived: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut effective = direct.clone();
    for (login, permission) in team_derived {
        let merged = match effective.get(login) {
            Some(current) => max_permission(current, permission),
            None => normalize(permission),
        };
        effective.insert(login.clone(), merged);
    }
    effective
}
