//! Server list refresh
//!
//! Fetches the (possibly truncated) server list together with its binary
//! status, and swaps the result into the [`ServerDirectory`].

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::directory::ServerDirectory;
use super::status;
use super::truncation::TruncationSelector;
use super::{Server, ServerId};
use crate::error::{VpnError, VpnResult};

/// Parameters of a server list request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerListRequest {
    pub truncation_enabled: bool,
    /// Ids the API must include even in a truncated list
    pub must_have_ids: BTreeSet<ServerId>,
    pub if_modified_since: Option<DateTime<Utc>>,
}

/// Server list API response
#[derive(Debug, Clone, PartialEq)]
pub enum ServerListResponse {
    NotModified,
    Servers {
        servers: Vec<Server>,
        /// Id of the binary status matching this list
        status_id: Option<String>,
        is_truncated: bool,
        last_modified: Option<DateTime<Utc>>,
    },
}

/// Server list API collaborator
#[async_trait]
pub trait ServerListApi: Send + Sync {
    async fn fetch_server_list(&self, request: &ServerListRequest) -> VpnResult<ServerListResponse>;

    async fn fetch_binary_status(&self, status_id: &str) -> VpnResult<Bytes>;
}

/// Result of a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated { servers: usize, retained: usize },
    NotModified,
}

/// Keeps the directory fresh from the API
pub struct ServerListUpdater {
    api: Arc<dyn ServerListApi>,
    directory: Arc<ServerDirectory>,
    /// `None` disables truncation
    truncation: Option<TruncationSelector>,
    last_modified: Mutex<Option<DateTime<Utc>>>,
}

impl ServerListUpdater {
    pub fn new(
        api: Arc<dyn ServerListApi>,
        directory: Arc<ServerDirectory>,
        truncation: Option<TruncationSelector>,
    ) -> Self {
        Self {
            api,
            directory,
            truncation,
            last_modified: Mutex::new(None),
        }
    }

    fn current_must_haves(&self) -> HashSet<ServerId> {
        self.truncation
            .as_ref()
            .map(|selector| selector.must_have_ids())
            .unwrap_or_default()
    }

    /// Full refresh: server list plus its binary status.
    ///
    /// Any failure leaves the directory as it was.
    pub async fn refresh(&self) -> VpnResult<RefreshOutcome> {
        let requested = self.current_must_haves();
        let request = ServerListRequest {
            truncation_enabled: self.truncation.is_some(),
            must_have_ids: requested.iter().cloned().collect(),
            if_modified_since: *self.last_modified.lock().await,
        };

        debug!(
            "Requesting server list (truncation: {}, must-haves: {})",
            request.truncation_enabled,
            request.must_have_ids.len()
        );

        let (servers, status_id, is_truncated, last_modified) =
            match self.api.fetch_server_list(&request).await? {
                ServerListResponse::NotModified => {
                    debug!("Server list not modified");
                    return Ok(RefreshOutcome::NotModified);
                }
                ServerListResponse::Servers { servers, status_id, is_truncated, last_modified } => {
                    (servers, status_id, is_truncated, last_modified)
                }
            };

        let mut servers: Vec<Arc<Server>> = servers
            .into_iter()
            .filter(|server| match server.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Dropping invalid server {}: {}", server.server_id, e);
                    false
                }
            })
            .map(Arc::new)
            .collect();

        if let Some(status_id) = &status_id {
            let raw = self.api.fetch_binary_status(status_id).await?;
            let update = status::decode(&raw).map_err(|e| {
                warn!("Binary status {} rejected, keeping previous server list: {}", status_id, e);
                VpnError::Decode(e)
            })?;
            servers = update.apply(&servers);
        }

        // Retain only must-haves that were not part of this request
        let retain_ids: HashSet<ServerId> = if is_truncated {
            self.current_must_haves().difference(&requested).cloned().collect()
        } else {
            HashSet::new()
        };

        let count = servers.len();
        let retained = self.directory.replace(servers, status_id, &retain_ids);
        if let Some(last_modified) = last_modified {
            *self.last_modified.lock().await = Some(last_modified);
        }

        info!("Server list refreshed: {} servers, truncated: {}", count, is_truncated);
        Ok(RefreshOutcome::Updated { servers: count, retained })
    }

    /// Fetch and apply only the binary status for the current list
    pub async fn refresh_status(&self) -> VpnResult<usize> {
        let snapshot = self.directory.snapshot();
        let status_id = snapshot
            .status_id()
            .ok_or_else(|| VpnError::InvalidState("Server list has no status id".to_string()))?;

        let raw = self.api.fetch_binary_status(status_id).await?;
        Ok(self.directory.apply_status_payload_for(status_id, &raw)?.unwrap_or(0))
    }
}
