//! Roadmap reconciliation between the client-side store and the server.
//!
//! Every mutation lands in the local [`RoadmapStore`] first; the network is
//! strictly secondary. Anonymous sessions never touch the wire. Authenticated
//! sessions push the full roadmap after each local change and merge the
//! server copy additively on login, with the local entry winning any title
//! collision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dpg_core::{Identity, Opportunity, ToggleAction};
use dpg_store::RoadmapStore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dpg-sync";

/// Header carrying the anonymous shadow id on roadmap fetches.
pub const SHADOW_ID_HEADER: &str = "x-shadow-id";

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned status {0}")]
    Status(u16),
    #[error("undecodable server payload: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

impl SyncConfig {
    /// Environment overrides on top of defaults. `DPG_API_URL` points at the
    /// lead server, `DPG_HTTP_TIMEOUT_SECS` bounds every call.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(url) = std::env::var("DPG_API_URL") {
            if !url.trim().is_empty() {
                cfg.base_url = url.trim_end_matches('/').to_string();
            }
        }
        if let Ok(raw) = std::env::var("DPG_HTTP_TIMEOUT_SECS") {
            if let Ok(secs) = raw.parse::<u64>() {
                cfg.timeout = Duration::from_secs(secs);
            }
        }
        cfg
    }
}

/// Wire shape of `GET /api/roadmap/{identity_key}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RoadmapPayload {
    pub recipes: Vec<Opportunity>,
}

/// Wire shape of `PUT /api/leads/sync`: the full roadmap, overwrite semantics.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncRequest {
    pub identity_key: String,
    pub recipes: Vec<Opportunity>,
}

/// Server side of the reconciliation protocol, seen from the client.
#[async_trait]
pub trait RoadmapApi: Send + Sync {
    async fn fetch_roadmap(&self, identity: &Identity) -> Result<Vec<Opportunity>, SyncError>;

    /// Replaces the server-side roadmap with exactly `recipes`. Entries
    /// absent from the payload are gone after this call.
    async fn overwrite_roadmap(
        &self,
        identity: &Identity,
        recipes: &[Opportunity],
    ) -> Result<(), SyncError>;
}

pub struct HttpRoadmapApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRoadmapApi {
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RoadmapApi for HttpRoadmapApi {
    async fn fetch_roadmap(&self, identity: &Identity) -> Result<Vec<Opportunity>, SyncError> {
        let url = format!("{}/api/roadmap/{}", self.base_url, identity.key());
        let mut req = self.client.get(&url);
        if let Identity::Anonymous { shadow_id } = identity {
            req = req.header(SHADOW_ID_HEADER, shadow_id.to_string());
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(SyncError::Status(resp.status().as_u16()));
        }
        let payload: RoadmapPayload = resp
            .json()
            .await
            .map_err(|e| SyncError::Decode(e.to_string()))?;
        Ok(payload.recipes)
    }

    async fn overwrite_roadmap(
        &self,
        identity: &Identity,
        recipes: &[Opportunity],
    ) -> Result<(), SyncError> {
        let url = format!("{}/api/leads/sync", self.base_url);
        let body = SyncRequest {
            identity_key: identity.key(),
            recipes: recipes.to_vec(),
        };
        let resp = self.client.put(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(SyncError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Who the client currently is. The shadow id survives login/logout so an
/// anonymous session resumed later keeps its server-side roadmap addressable.
pub struct IdentityContext {
    shadow_id: Uuid,
    current: RwLock<Identity>,
}

impl IdentityContext {
    pub fn anonymous(shadow_id: Uuid) -> Self {
        Self {
            shadow_id,
            current: RwLock::new(Identity::Anonymous { shadow_id }),
        }
    }

    pub fn current(&self) -> Identity {
        self.current.read().expect("identity lock poisoned").clone()
    }

    pub fn login(&self, user_id: i64, email: impl Into<String>) -> Identity {
        let identity = Identity::Authenticated {
            user_id,
            email: email.into(),
        };
        *self.current.write().expect("identity lock poisoned") = identity.clone();
        identity
    }

    /// Drops authentication without touching the local roadmap cache.
    pub fn logout(&self) -> Identity {
        let identity = Identity::Anonymous {
            shadow_id: self.shadow_id,
        };
        *self.current.write().expect("identity lock poisoned") = identity.clone();
        identity
    }
}

/// Monotonic token issuer used to discard stale in-flight loads. A response
/// is applied only if no newer load was issued while it was in flight.
#[derive(Default)]
struct RequestGuard {
    latest: AtomicU64,
}

impl RequestGuard {
    fn issue(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, token: u64) -> bool {
        self.latest.load(Ordering::SeqCst) == token
    }
}

/// The reconciliation service. Wraps the local store, the server API and the
/// identity context; all public operations are local-first.
pub struct RoadmapSync {
    store: Arc<RoadmapStore>,
    api: Arc<dyn RoadmapApi>,
    identity: Arc<IdentityContext>,
    loads: RequestGuard,
    // Held from local issue through the server push so full-state
    // overwrites land in issue order. tokio's mutex is FIFO-fair.
    push_lock: TokioMutex<()>,
}

impl RoadmapSync {
    pub fn new(
        store: Arc<RoadmapStore>,
        api: Arc<dyn RoadmapApi>,
        identity: Arc<IdentityContext>,
    ) -> Self {
        Self {
            store,
            api,
            identity,
            loads: RequestGuard::default(),
            push_lock: TokioMutex::new(()),
        }
    }

    pub fn store(&self) -> &RoadmapStore {
        &self.store
    }

    pub fn identity(&self) -> &IdentityContext {
        &self.identity
    }

    /// Toggles membership by title. The local write always lands and is
    /// never rolled back; for authenticated sessions the full post-toggle
    /// set is then pushed, and a push failure is reported as
    /// [`ToggleAction::Error`] while the local state stands.
    pub async fn toggle_save(&self, opportunity: &Opportunity) -> ToggleAction {
        let _ordered = self.push_lock.lock().await;
        let (local, snapshot) = match self.store.toggle(opportunity).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "local roadmap write failed");
                return ToggleAction::Error;
            }
        };
        let action = match local {
            dpg_store::LocalToggle::Added => ToggleAction::Added,
            dpg_store::LocalToggle::Removed => ToggleAction::Removed,
        };
        let identity = self.identity.current();
        if !identity.is_authenticated() {
            return action;
        }
        match self.api.overwrite_roadmap(&identity, &snapshot).await {
            Ok(()) => action,
            Err(err) => {
                warn!(error = %err, "roadmap push failed, local state kept");
                ToggleAction::Error
            }
        }
    }

    /// Removes the entry shown at `index` of `display_view` (a sorted or
    /// otherwise reordered rendering of the roadmap). Resolves the title
    /// from the view so the removal hits the right entry regardless of
    /// sort order. Returns `None` when the index is out of range or the
    /// title is no longer in the store.
    pub async fn remove_recipe(
        &self,
        display_view: &[Opportunity],
        index: usize,
    ) -> Option<ToggleAction> {
        let title = &display_view.get(index)?.title;
        let _ordered = self.push_lock.lock().await;
        let snapshot = match self.store.remove_by_title(title).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, "local roadmap write failed");
                return Some(ToggleAction::Error);
            }
        };
        let identity = self.identity.current();
        if !identity.is_authenticated() {
            return Some(ToggleAction::Removed);
        }
        match self.api.overwrite_roadmap(&identity, &snapshot).await {
            Ok(()) => Some(ToggleAction::Removed),
            Err(err) => {
                warn!(error = %err, "roadmap push failed, local state kept");
                Some(ToggleAction::Error)
            }
        }
    }

    /// Login-time reconciliation: fetch the server roadmap for the new
    /// identity, merge it additively under the local copy (local wins on
    /// title collisions), then write the merged set back in one overwrite.
    /// Network failures leave the local roadmap intact and are not fatal.
    pub async fn merge_on_login(&self, user_id: i64, email: impl Into<String>) -> Vec<Opportunity> {
        let _ordered = self.push_lock.lock().await;
        let identity = self.identity.login(user_id, email);
        let server = match self.api.fetch_roadmap(&identity).await {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "server roadmap fetch failed, keeping local only");
                Vec::new()
            }
        };
        let merged = match self.store.merge_additive(server).await {
            Ok(merged) => merged,
            Err(err) => {
                warn!(error = %err, "merge persist failed");
                self.store.snapshot().await
            }
        };
        if let Err(err) = self.api.overwrite_roadmap(&identity, &merged).await {
            warn!(error = %err, "post-merge push failed, will retry on next toggle");
        }
        merged
    }

    /// Loads the roadmap for the current identity: the locally cached copy
    /// is surfaced immediately, then (authenticated only) the server copy is
    /// merged in additively. A load superseded by a newer one discards its
    /// server response instead of applying it out of order.
    pub async fn load_for_identity(&self) -> Vec<Opportunity> {
        if let Err(err) = self.store.hydrate().await {
            warn!(error = %err, "roadmap hydrate failed, starting empty");
        }
        let identity = self.identity.current();
        if !identity.is_authenticated() {
            return self.store.snapshot().await;
        }
        let token = self.loads.issue();
        match self.api.fetch_roadmap(&identity).await {
            Ok(server) if self.loads.is_current(token) => {
                match self.store.merge_additive(server).await {
                    Ok(merged) => merged,
                    Err(err) => {
                        warn!(error = %err, "merge persist failed");
                        self.store.snapshot().await
                    }
                }
            }
            Ok(_) => {
                debug!("discarding superseded roadmap load");
                self.store.snapshot().await
            }
            Err(err) => {
                warn!(error = %err, "server roadmap fetch failed, serving local copy");
                self.store.snapshot().await
            }
        }
    }
}

/// Sort orders for rendering a roadmap. Sorting is pure: it never mutates
/// the stored set, only the returned view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Roi,
    Department,
    Newest,
}

/// Numeric weight of a free-text ROI estimate. Digits are concatenated and
/// parsed; a `$` anywhere in the text scales the result by 1000 so dollar
/// figures outrank bare hour counts.
pub fn roi_value(estimate: &str) -> i64 {
    let digits: String = estimate.chars().filter(|c| c.is_ascii_digit()).collect();
    let base: i64 = digits.parse().unwrap_or(0);
    if estimate.contains('$') {
        base * 1000
    } else {
        base
    }
}

pub fn sorted_view(roadmap: &[Opportunity], order: SortBy) -> Vec<Opportunity> {
    let mut view = roadmap.to_vec();
    match order {
        SortBy::Roi => {
            view.sort_by_key(|o| std::cmp::Reverse(roi_value(&o.public_view.roi_estimate)));
        }
        SortBy::Department => {
            view.sort_by(|a, b| a.department.cmp(&b.department));
        }
        SortBy::Newest => {
            // Insertion order is oldest-first, so newest-first is a reversal.
            view.reverse();
        }
    }
    view
}
