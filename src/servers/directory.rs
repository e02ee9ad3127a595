//! In-memory server directory
//!
//! The directory is a sequence of immutable snapshots. Writers (full refresh,
//! status updates) build a new snapshot and swap it in; readers always see one
//! complete snapshot and never a half-applied update.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::status::{self, StatusUpdate};
use super::{Server, ServerId};
use crate::error::{DecodeError, PreparationError};
use crate::vpn::intent::ConnectIntent;

/// Orders selection candidates, best first.
///
/// `penalty`/`cost` from the status reference are available to implementations
/// that want them.
pub trait ServerRanking: Send + Sync {
    fn rank(&self, servers: &mut [Arc<Server>]);
}

/// Lowest load first, then lowest penalty, then server id
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadRanking;

impl ServerRanking for LoadRanking {
    fn rank(&self, servers: &mut [Arc<Server>]) {
        servers.sort_by(|a, b| {
            a.load
                .total_cmp(&b.load)
                .then_with(|| penalty(a).total_cmp(&penalty(b)))
                .then_with(|| a.server_id.cmp(&b.server_id))
        });
    }
}

fn penalty(server: &Server) -> f32 {
    server.status_reference.map(|reference| reference.penalty).unwrap_or(0.0)
}

/// Per-user constraints applied when picking servers for an intent
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext {
    /// Highest server tier the user may connect to
    pub max_tier: u8,
    /// Cap on the number of candidates handed to the connection manager
    pub max_candidates: usize,
}

impl Default for SelectionContext {
    fn default() -> Self {
        Self { max_tier: u8::MAX, max_candidates: 5 }
    }
}

/// One immutable view of the directory
#[derive(Debug, Default)]
pub struct DirectorySnapshot {
    servers: Vec<Arc<Server>>,
    by_id: HashMap<ServerId, usize>,
    status_id: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    generation: u64,
}

impl DirectorySnapshot {
    fn build(servers: Vec<Arc<Server>>, status_id: Option<String>, generation: u64) -> Self {
        let mut by_id = HashMap::with_capacity(servers.len());
        let mut unique = Vec::with_capacity(servers.len());
        for server in servers {
            if by_id.contains_key(&server.server_id) {
                warn!("Dropping duplicate server id {}", server.server_id);
                continue;
            }
            by_id.insert(server.server_id.clone(), unique.len());
            unique.push(server);
        }

        Self {
            servers: unique,
            by_id,
            status_id,
            updated_at: Some(Utc::now()),
            generation,
        }
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    pub fn get(&self, id: &ServerId) -> Option<&Arc<Server>> {
        self.by_id.get(id).map(|&i| &self.servers[i])
    }

    pub fn contains(&self, id: &ServerId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Id of the status feed matching this server list
    pub fn status_id(&self) -> Option<&str> {
        self.status_id.as_deref()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Incremented on every swap
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Same contents as another snapshot, ignoring bookkeeping
    pub fn same_servers(&self, other: &DirectorySnapshot) -> bool {
        self.servers.len() == other.servers.len()
            && self.servers.iter().zip(&other.servers).all(|(a, b)| a == b)
    }
}

/// Shared server directory
pub struct ServerDirectory {
    snapshot: ArcSwap<DirectorySnapshot>,
    ranking: Arc<dyn ServerRanking>,
}

impl ServerDirectory {
    pub fn new() -> Self {
        Self::with_ranking(Arc::new(LoadRanking))
    }

    pub fn with_ranking(ranking: Arc<dyn ServerRanking>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(DirectorySnapshot::default()),
            ranking,
        }
    }

    /// Current snapshot; stays valid even if the directory is swapped meanwhile
    pub fn snapshot(&self) -> Arc<DirectorySnapshot> {
        self.snapshot.load_full()
    }

    pub fn get(&self, id: &ServerId) -> Option<Arc<Server>> {
        self.snapshot.load().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// Replace the whole directory after a full refresh.
    ///
    /// Servers from the previous snapshot whose ids are in `retain_ids` and
    /// that the new list lacks are carried over. Returns the number retained.
    pub fn replace(
        &self,
        servers: Vec<Arc<Server>>,
        status_id: Option<String>,
        retain_ids: &HashSet<ServerId>,
    ) -> usize {
        let mut retained = 0;
        self.snapshot.rcu(|current| {
            let new_ids: HashSet<&ServerId> = servers.iter().map(|s| &s.server_id).collect();
            let kept: Vec<Arc<Server>> = current
                .servers
                .iter()
                .filter(|s| retain_ids.contains(&s.server_id) && !new_ids.contains(&s.server_id))
                .cloned()
                .collect();
            retained = kept.len();

            let mut all = servers.clone();
            all.extend(kept);
            DirectorySnapshot::build(all, status_id.clone(), current.generation + 1)
        });

        info!(
            "Server directory replaced: {} servers ({} retained)",
            self.len(),
            retained
        );
        retained
    }

    /// Apply a decoded status update as one atomic swap
    pub fn apply_status(&self, update: &StatusUpdate) {
        self.snapshot.rcu(|current| {
            let servers = update.apply(&current.servers);
            DirectorySnapshot::build(servers, current.status_id.clone(), current.generation + 1)
        });
        debug!("Applied status update with {} records", update.len());
    }

    /// Decode and apply a raw status payload.
    ///
    /// On a decode failure the directory keeps its previous snapshot.
    pub fn apply_status_payload(&self, raw: &[u8]) -> Result<usize, DecodeError> {
        let update = status::decode(raw).map_err(|e| {
            warn!("Discarding status payload ({} bytes): {}", raw.len(), e);
            e
        })?;
        self.apply_status(&update);
        Ok(update.len())
    }

    /// Decode and apply a status payload fetched for `status_id`.
    ///
    /// Returns `Ok(None)` without touching the directory when the list was
    /// replaced by one with another status id while the payload was in flight.
    pub fn apply_status_payload_for(&self, status_id: &str, raw: &[u8]) -> Result<Option<usize>, DecodeError> {
        let update = status::decode(raw).map_err(|e| {
            warn!("Discarding status payload ({} bytes): {}", raw.len(), e);
            e
        })?;

        let mut applied = false;
        self.snapshot.rcu(|current| {
            applied = current.status_id() == Some(status_id);
            if !applied {
                return Arc::clone(current);
            }
            let servers = update.apply(&current.servers);
            Arc::new(DirectorySnapshot::build(servers, current.status_id.clone(), current.generation + 1))
        });

        if !applied {
            info!("Dropping status payload for {}, server list changed meanwhile", status_id);
            return Ok(None);
        }
        debug!("Applied status update with {} records", update.len());
        Ok(Some(update.len()))
    }

    /// Candidate servers for an intent, best first
    pub fn select(
        &self,
        intent: &ConnectIntent,
        ctx: &SelectionContext,
    ) -> Result<Vec<Arc<Server>>, PreparationError> {
        let snapshot = self.snapshot();

        let (matching, label): (Vec<Arc<Server>>, Option<String>) = match intent {
            ConnectIntent::Profile { target, .. } => return self.select(target, ctx),
            ConnectIntent::Fastest => (
                snapshot
                    .servers
                    .iter()
                    .filter(|s| s.gateway_name.is_none())
                    .cloned()
                    .collect(),
                None,
            ),
            ConnectIntent::FastestInCountry { country, excluded_features } => {
                let matching: Vec<Arc<Server>> = snapshot
                    .servers
                    .iter()
                    .filter(|s| s.gateway_name.is_none() && s.exit_country.eq_ignore_ascii_case(country))
                    .filter(|s| excluded_features.iter().all(|f| !s.has_feature(*f)))
                    .cloned()
                    .collect();
                if matching.is_empty() {
                    return Err(PreparationError::UnknownCountry(country.clone()));
                }
                (matching, Some(country.clone()))
            }
            ConnectIntent::SpecificServer { server_id } => {
                let server = snapshot
                    .get(server_id)
                    .cloned()
                    .ok_or_else(|| PreparationError::UnknownServer(server_id.clone()))?;
                let label = server.server_name.clone();
                (vec![server], Some(label))
            }
            ConnectIntent::Gateway { gateway_name, server_id } => {
                let matching: Vec<Arc<Server>> = snapshot
                    .servers
                    .iter()
                    .filter(|s| s.gateway_name.as_deref() == Some(gateway_name.as_str()))
                    .filter(|s| server_id.as_ref().map_or(true, |id| &s.server_id == id))
                    .cloned()
                    .collect();
                if matching.is_empty() {
                    return Err(PreparationError::UnknownGateway(gateway_name.clone()));
                }
                (matching, Some(gateway_name.clone()))
            }
        };

        let mut available: Vec<Arc<Server>> = matching
            .into_iter()
            .filter(|s| s.tier <= ctx.max_tier)
            .filter(|s| s.is_available())
            .collect();

        if available.is_empty() {
            return Err(match label {
                Some(label) => PreparationError::ServerInMaintenance(label),
                None => PreparationError::NoServerAvailable,
            });
        }

        self.ranking.rank(&mut available);
        available.truncate(ctx.max_candidates.max(1));
        debug!(
            "Selected {} candidates for {}: {:?}",
            available.len(),
            intent,
            available.iter().map(|s| s.server_name.as_str()).collect::<Vec<_>>()
        );
        Ok(available)
    }
}

impl Default for ServerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::status::{encode, StatusEntry};
    use crate::servers::test_support::server;
    use crate::servers::ServerFeature;

    fn directory_with(servers: Vec<Server>) -> ServerDirectory {
        let directory = ServerDirectory::new();
        directory.replace(servers.into_iter().map(Arc::new).collect(), None, &HashSet::new());
        directory
    }

    #[test]
    fn test_replace_retains_requested_ids() {
        let directory = directory_with(vec![server("A", Some(0), 10.0), server("B", Some(1), 20.0)]);

        let retain = HashSet::from([ServerId::new("B")]);
        let retained = directory.replace(vec![Arc::new(server("C", Some(2), 30.0))], None, &retain);

        assert_eq!(retained, 1);
        let snapshot = directory.snapshot();
        assert!(snapshot.contains(&ServerId::new("B")));
        assert!(snapshot.contains(&ServerId::new("C")));
        assert!(!snapshot.contains(&ServerId::new("A")));
    }

    #[test]
    fn test_replace_prefers_fresh_record_over_retained() {
        let directory = directory_with(vec![server("A", Some(0), 10.0)]);

        let retain = HashSet::from([ServerId::new("A")]);
        let retained = directory.replace(vec![Arc::new(server("A", Some(0), 70.0))], None, &retain);

        assert_eq!(retained, 0);
        assert_eq!(directory.get(&ServerId::new("A")).unwrap().load, 70.0);
    }

    #[test]
    fn test_bad_payload_keeps_snapshot() {
        let directory = directory_with(vec![server("A", Some(0), 10.0)]);
        let before = directory.snapshot();

        assert!(directory.apply_status_payload(&[9, 1, 2]).is_err());

        let after = directory.snapshot();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_status_payload_applies_atomically() {
        let directory = directory_with(vec![server("A", Some(0), 10.0), server("B", Some(1), 20.0)]);
        let before = directory.snapshot();

        let applied = directory
            .apply_status_payload(&encode(&[StatusEntry::new(1, 90.0, true)]))
            .unwrap();

        assert_eq!(applied, 1);
        // the old snapshot is untouched
        assert!(before.get(&ServerId::new("A")).unwrap().visible);
        let after = directory.snapshot();
        assert!(!after.get(&ServerId::new("A")).unwrap().visible);
        assert_eq!(after.get(&ServerId::new("B")).unwrap().load, 90.0);
        assert_eq!(after.generation(), before.generation() + 1);
    }

    #[test]
    fn test_reapplying_status_keeps_servers() {
        let directory = directory_with(vec![server("A", Some(0), 10.0), server("B", Some(1), 20.0)]);
        let payload = encode(&[StatusEntry::new(0, 40.0, false)]);

        directory.apply_status_payload(&payload).unwrap();
        let first = directory.snapshot();
        directory.apply_status_payload(&payload).unwrap();
        let second = directory.snapshot();

        assert!(first.same_servers(&second));
        assert_eq!(second.generation(), first.generation() + 1);
        assert!(!first.same_servers(&directory_with(vec![server("A", Some(0), 10.0)]).snapshot()));
    }

    #[test]
    fn test_status_for_other_list_is_dropped() {
        let directory = ServerDirectory::new();
        directory.replace(
            vec![Arc::new(server("A", Some(0), 10.0))],
            Some("status-2".to_string()),
            &HashSet::new(),
        );
        let before = directory.snapshot();
        let payload = encode(&[StatusEntry::new(0, 90.0, false)]);

        assert_eq!(directory.apply_status_payload_for("status-1", &payload).unwrap(), None);
        assert!(Arc::ptr_eq(&before, &directory.snapshot()));

        assert_eq!(directory.apply_status_payload_for("status-2", &payload).unwrap(), Some(1));
        assert!(!directory.get(&ServerId::new("A")).unwrap().online);
    }

    #[test]
    fn test_select_fastest_orders_by_load() {
        let directory = directory_with(vec![
            server("A", Some(0), 60.0),
            server("B", Some(1), 20.0),
            server("C", Some(2), 40.0),
        ]);
        let ctx = SelectionContext { max_tier: 2, max_candidates: 2 };

        let picked = directory.select(&ConnectIntent::Fastest, &ctx).unwrap();
        let ids: Vec<&str> = picked.iter().map(|s| s.server_id.as_str()).collect();
        assert_eq!(ids, vec!["B", "C"]);
    }

    #[test]
    fn test_select_country_and_features() {
        let mut se = server("SE1", Some(0), 10.0);
        se.exit_country = "SE".to_string();
        se.features.insert(ServerFeature::Tor);
        let mut se2 = server("SE2", Some(1), 50.0);
        se2.exit_country = "SE".to_string();
        let directory = directory_with(vec![se, se2, server("CH1", Some(2), 5.0)]);
        let ctx = SelectionContext::default();

        let intent = ConnectIntent::FastestInCountry {
            country: "se".to_string(),
            excluded_features: [ServerFeature::Tor].into_iter().collect(),
        };
        let picked = directory.select(&intent, &ctx).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].server_id.as_str(), "SE2");

        assert_eq!(
            directory.select(&ConnectIntent::fastest_in_country("XX"), &ctx).unwrap_err(),
            PreparationError::UnknownCountry("XX".to_string())
        );
    }

    #[test]
    fn test_select_specific_server_states() {
        let mut down = server("A", Some(0), 10.0);
        down.online = false;
        let directory = directory_with(vec![down]);
        let ctx = SelectionContext::default();

        assert!(matches!(
            directory.select(&ConnectIntent::server("A"), &ctx),
            Err(PreparationError::ServerInMaintenance(_))
        ));
        assert_eq!(
            directory.select(&ConnectIntent::server("Z"), &ctx).unwrap_err(),
            PreparationError::UnknownServer(ServerId::new("Z"))
        );
    }

    #[test]
    fn test_select_respects_tier_and_gateways() {
        let mut plus = server("P", Some(0), 1.0);
        plus.tier = 2;
        let mut gw = server("G", Some(1), 1.0);
        gw.gateway_name = Some("office".to_string());
        let directory = directory_with(vec![plus, gw, server("F", Some(2), 80.0)]);
        let ctx = SelectionContext { max_tier: 0, max_candidates: 5 };

        let fastest = directory.select(&ConnectIntent::Fastest, &ctx).unwrap();
        assert_eq!(fastest.len(), 1);
        assert_eq!(fastest[0].server_id.as_str(), "F");

        let intent = ConnectIntent::Gateway { gateway_name: "office".to_string(), server_id: None };
        let picked = directory.select(&intent, &ctx).unwrap();
        assert_eq!(picked[0].server_id.as_str(), "G");
    }
}
