//! Must-have server ids for a truncated server list
//!
//! When the API only returns a bounded subset of servers, the client asks it
//! to always include the servers the user depends on: the one in use, recent
//! connections and servers pinned by profiles.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

use super::ServerId;
use crate::connection_manager::VpnStatus;

/// Bounds for the must-have set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationLimits {
    /// Recents taken ahead of profiles
    pub max_recents: usize,
    /// Cap on the whole set
    pub max_must_haves: usize,
}

impl Default for TruncationLimits {
    fn default() -> Self {
        Self { max_recents: 10, max_must_haves: 50 }
    }
}

/// Compute the set of server ids that truncation must never drop.
///
/// Priority: current server, the first `max_recents` distinct recents,
/// profile servers, then the remaining recents as backfill. The result never
/// exceeds `max_must_haves`, except that the current server is always kept.
pub fn must_have_ids(
    current: Option<&ServerId>,
    recent_ids: &[ServerId],
    profile_ids: &[ServerId],
    max_recents: usize,
    max_must_haves: usize,
) -> HashSet<ServerId> {
    let mut ordered: Vec<&ServerId> = Vec::new();
    let mut seen: HashSet<&ServerId> = HashSet::new();

    if let Some(current) = current {
        seen.insert(current);
        ordered.push(current);
    }

    let mut distinct_recents: Vec<&ServerId> = Vec::new();
    let mut seen_recents: HashSet<&ServerId> = HashSet::new();
    for id in recent_ids {
        if Some(id) != current && seen_recents.insert(id) {
            distinct_recents.push(id);
        }
    }
    let split = max_recents.min(distinct_recents.len());
    let (primary, backfill) = distinct_recents.split_at(split);

    for id in primary.iter().copied().chain(profile_ids) {
        if seen.insert(id) {
            ordered.push(id);
        }
    }

    for id in backfill {
        if ordered.len() >= max_must_haves {
            break;
        }
        if seen.insert(id) {
            ordered.push(id);
        }
    }

    let cap = if current.is_some() { max_must_haves.max(1) } else { max_must_haves };
    ordered.truncate(cap);
    ordered.into_iter().cloned().collect()
}

/// Source of user history feeding the must-have set (recents and profiles
/// storage live outside this crate).
pub trait ConnectionHistory: Send + Sync {
    /// Recently used servers, most recent first
    fn recent_server_ids(&self) -> Vec<ServerId>;
    /// Servers pinned by saved profiles
    fn profile_server_ids(&self) -> Vec<ServerId>;
}

/// Computes must-haves from live connection state and stored history
pub struct TruncationSelector {
    history: Arc<dyn ConnectionHistory>,
    status: watch::Receiver<VpnStatus>,
    limits: TruncationLimits,
}

impl TruncationSelector {
    pub fn new(
        history: Arc<dyn ConnectionHistory>,
        status: watch::Receiver<VpnStatus>,
        limits: TruncationLimits,
    ) -> Self {
        Self { history, status, limits }
    }

    pub fn limits(&self) -> TruncationLimits {
        self.limits
    }

    /// Server currently connecting or connected, if any
    pub fn current_server_id(&self) -> Option<ServerId> {
        let status = self.status.borrow();
        if status.state.is_establishing_or_connected() {
            status.server_id.clone()
        } else {
            None
        }
    }

    pub fn must_have_ids(&self) -> HashSet<ServerId> {
        must_have_ids(
            self.current_server_id().as_ref(),
            &self.history.recent_server_ids(),
            &self.history.profile_server_ids(),
            self.limits.max_recents,
            self.limits.max_must_haves,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<ServerId> {
        values.iter().map(|v| ServerId::new(*v)).collect()
    }

    fn set(values: &[&str]) -> HashSet<ServerId> {
        ids(values).into_iter().collect()
    }

    #[test]
    fn test_recents_before_profiles_then_backfill() {
        let recents = ids(&["r1", "r2", "r3", "r4"]);
        let profiles = ids(&["p1"]);

        let result = must_have_ids(Some(&ServerId::new("cur")), &recents, &profiles, 2, 5);
        assert_eq!(result, set(&["cur", "r1", "r2", "p1", "r3"]));
    }

    #[test]
    fn test_current_excluded_from_recents_and_duplicates_collapsed() {
        let recents = ids(&["cur", "r1", "r1", "r2"]);

        let result = must_have_ids(Some(&ServerId::new("cur")), &recents, &[], 2, 10);
        assert_eq!(result, set(&["cur", "r1", "r2"]));
    }

    #[test]
    fn test_cap_drops_backfill_first() {
        let recents = ids(&["r1", "r2", "r3"]);
        let profiles = ids(&["p1", "p2"]);

        let result = must_have_ids(None, &recents, &profiles, 1, 3);
        assert_eq!(result, set(&["r1", "p1", "p2"]));
    }

    #[test]
    fn test_current_survives_tight_cap() {
        let recents = ids(&["r1", "r2"]);

        let result = must_have_ids(Some(&ServerId::new("cur")), &recents, &[], 5, 1);
        assert_eq!(result, set(&["cur"]));

        let result = must_have_ids(Some(&ServerId::new("cur")), &recents, &[], 5, 0);
        assert_eq!(result, set(&["cur"]));
    }

    #[test]
    fn test_profile_overlapping_recent_counts_once() {
        let recents = ids(&["r1", "r2", "r3"]);
        let profiles = ids(&["r1"]);

        let result = must_have_ids(None, &recents, &profiles, 1, 2);
        assert_eq!(result, set(&["r1", "r2"]));
    }

    #[test]
    fn test_empty_inputs() {
        assert!(must_have_ids(None, &[], &[], 10, 50).is_empty());
    }
}
