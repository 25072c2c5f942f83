//! Axum lead server: the server half of the roadmap protocol.
//!
//! Leads are keyed by identity key (email or shadow id). `POST /api/leads`
//! merges by title and never shrinks a roadmap; `PUT /api/leads/sync`
//! replaces it wholesale. Storage is an in-memory map behind a mutex with an
//! optional JSON snapshot on disk, written atomically after every mutation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use dpg_core::{CompanyProfile, Lead, Opportunity};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dpg-web";

/// Fallback identity header for anonymous clients that omit `identity_key`.
pub const SHADOW_ID_HEADER: &str = "x-shadow-id";

/// Identity-keyed lead registry. The snapshot file, when configured, holds
/// the full map as JSON and is replayed on startup.
pub struct LeadStore {
    leads: Mutex<HashMap<String, Lead>>,
    next_id: Mutex<i64>,
    snapshot_path: Option<PathBuf>,
}

impl LeadStore {
    pub fn in_memory() -> Self {
        Self {
            leads: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
            snapshot_path: None,
        }
    }

    /// Snapshot-backed store. Replays an existing snapshot; an unreadable
    /// one is logged and ignored rather than blocking startup.
    pub async fn with_snapshot(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut leads: HashMap<String, Lead> = HashMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => leads = map,
                Err(err) => warn!(path = %path.display(), error = %err, "discarding corrupt lead snapshot"),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "lead snapshot unreadable"),
        }
        let next_id = leads.values().map(|l| l.id).max().unwrap_or(0) + 1;
        Self {
            leads: Mutex::new(leads),
            next_id: Mutex::new(next_id),
            snapshot_path: Some(path),
        }
    }

    async fn persist(&self, leads: &HashMap<String, Lead>) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let raw = match serde_json::to_string_pretty(leads) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "lead snapshot serialize failed");
                return;
            }
        };
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        let result = async {
            tokio::fs::write(&tmp, raw.as_bytes()).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        if let Err(err) = result {
            warn!(path = %path.display(), error = %err, "lead snapshot write failed");
            let _ = tokio::fs::remove_file(&tmp).await;
        }
    }

    /// Merge upsert: unknown titles are appended, shared titles keep the
    /// already-stored entry. A fresh profile replaces a stale one.
    pub async fn upsert_merge(
        &self,
        identity_key: &str,
        profile: Option<CompanyProfile>,
        recipes: Vec<Opportunity>,
    ) -> Lead {
        let mut leads = self.leads.lock().await;
        let lead = match leads.get_mut(identity_key) {
            Some(lead) => {
                for recipe in recipes {
                    if !lead.recipes.iter().any(|r| r.title == recipe.title) {
                        lead.recipes.push(recipe);
                    }
                }
                if profile.is_some() {
                    lead.profile = profile;
                }
                lead.clone()
            }
            None => {
                let lead = self.fresh_lead(identity_key, profile, recipes).await;
                leads.insert(identity_key.to_string(), lead.clone());
                lead
            }
        };
        self.persist(&leads).await;
        lead
    }

    /// Overwrite: the stored roadmap becomes exactly `recipes`.
    pub async fn overwrite(&self, identity_key: &str, recipes: Vec<Opportunity>) -> Lead {
        let mut leads = self.leads.lock().await;
        let lead = match leads.get_mut(identity_key) {
            Some(lead) => {
                lead.recipes = recipes;
                lead.clone()
            }
            None => {
                let lead = self.fresh_lead(identity_key, None, recipes).await;
                leads.insert(identity_key.to_string(), lead.clone());
                lead
            }
        };
        self.persist(&leads).await;
        lead
    }

    pub async fn roadmap(&self, identity_key: &str) -> Vec<Opportunity> {
        self.leads
            .lock()
            .await
            .get(identity_key)
            .map(|l| l.recipes.clone())
            .unwrap_or_default()
    }

    /// All stored recipes across every lead, first occurrence of each title.
    pub async fn library(&self) -> Vec<Opportunity> {
        let leads = self.leads.lock().await;
        let mut ordered: Vec<&Lead> = leads.values().collect();
        ordered.sort_by_key(|l| l.id);
        let mut out: Vec<Opportunity> = Vec::new();
        for lead in ordered {
            for recipe in &lead.recipes {
                if !out.iter().any(|r| r.title == recipe.title) {
                    out.push(recipe.clone());
                }
            }
        }
        out
    }

    async fn fresh_lead(
        &self,
        identity_key: &str,
        profile: Option<CompanyProfile>,
        recipes: Vec<Opportunity>,
    ) -> Lead {
        let mut next_id = self.next_id.lock().await;
        let id = *next_id;
        *next_id += 1;
        Lead {
            id,
            identity_key: identity_key.to_string(),
            profile,
            recipes,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<LeadStore>,
}

#[derive(Debug, Deserialize)]
struct LeadBody {
    #[serde(default)]
    identity_key: Option<String>,
    #[serde(default)]
    profile: Option<CompanyProfile>,
    #[serde(default)]
    recipes: Vec<Opportunity>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoadmapResponse {
    pub recipes: Vec<Opportunity>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LibraryResponse {
    pub recipes: Vec<Opportunity>,
}

enum ApiError {
    MissingIdentity,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::MissingIdentity => (
                StatusCode::BAD_REQUEST,
                "identity_key or x-shadow-id required",
            ),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Body `identity_key` wins; the shadow-id header is the anonymous fallback.
fn resolve_identity(body_key: Option<String>, headers: &HeaderMap) -> Result<String, ApiError> {
    if let Some(key) = body_key {
        let key = key.trim().to_string();
        if !key.is_empty() {
            return Ok(key);
        }
    }
    headers
        .get(SHADOW_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::MissingIdentity)
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/leads", post(leads_merge_handler))
        .route("/api/leads/sync", put(leads_sync_handler))
        .route("/api/roadmap/{identity_key}", get(roadmap_handler))
        .route("/api/library", get(library_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("DPG_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let store = match std::env::var("DPG_LEADS_SNAPSHOT") {
        Ok(path) if !path.trim().is_empty() => LeadStore::with_snapshot(path).await,
        _ => LeadStore::in_memory(),
    };
    let state = AppState {
        store: Arc::new(store),
    };
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "lead server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn leads_merge_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LeadBody>,
) -> Result<Json<Lead>, ApiError> {
    let identity_key = resolve_identity(body.identity_key, &headers)?;
    let lead = state
        .store
        .upsert_merge(&identity_key, body.profile, body.recipes)
        .await;
    Ok(Json(lead))
}

async fn leads_sync_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LeadBody>,
) -> Result<Json<Lead>, ApiError> {
    let identity_key = resolve_identity(body.identity_key, &headers)?;
    let lead = state.store.overwrite(&identity_key, body.recipes).await;
    Ok(Json(lead))
}

/// Unknown identities get an empty roadmap, not a 404: a fresh client must
/// be able to poll before it has ever written.
async fn roadmap_handler(
    State(state): State<AppState>,
    AxumPath(identity_key): AxumPath<String>,
) -> Json<RoadmapResponse> {
    let recipes = state.store.roadmap(&identity_key).await;
    Json(RoadmapResponse { recipes })
}

async fn library_handler(State(state): State<AppState>) -> Json<LibraryResponse> {
    let recipes = state.store.library().await;
    Json(LibraryResponse { recipes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use dpg_core::{AdminView, Difficulty, PublicView};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn recipe(title: &str, department: &str) -> Opportunity {
        Opportunity {
            title: title.to_string(),
            department: department.to_string(),
            industry: None,
            public_view: PublicView {
                problem: "Manual work".to_string(),
                solution_narrative: "Automate it".to_string(),
                value_proposition: "Less toil".to_string(),
                roi_estimate: "Save 5 hours/week".to_string(),
                detailed_explanation: None,
                example_scenario: None,
                walkthrough_steps: None,
            },
            admin_view: AdminView {
                tech_stack: vec!["Email API".to_string()],
                stack_details: None,
                implementation_difficulty: Difficulty::Low,
                workflow_steps: "1. Ingest 2. Act".to_string(),
                upsell_opportunity: "Reporting add-on".to_string(),
            },
            generation_metadata: None,
        }
    }

    fn test_app() -> Router {
        app(AppState {
            store: Arc::new(LeadStore::in_memory()),
        })
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn roadmap_titles(app: &Router, key: &str) -> Vec<String> {
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/api/roadmap/{key}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let payload: RoadmapResponse = serde_json::from_slice(&body).unwrap();
        payload.recipes.into_iter().map(|r| r.title).collect()
    }

    #[tokio::test]
    async fn unknown_identity_gets_empty_roadmap_not_404() {
        let app = test_app();
        assert!(roadmap_titles(&app, "nobody@example.com").await.is_empty());
    }

    #[tokio::test]
    async fn post_merges_and_never_shrinks() {
        let app = test_app();
        let body = serde_json::json!({
            "identity_key": "owner@example.com",
            "recipes": [recipe("A", "Finance"), recipe("B", "Sales")],
        });
        let resp = app
            .clone()
            .oneshot(json_request("POST", "/api/leads", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Second post shares B (different department) and adds C. The
        // stored B must survive untouched.
        let body = serde_json::json!({
            "identity_key": "owner@example.com",
            "recipes": [recipe("B", "Operations"), recipe("C", "HR")],
        });
        let resp = app
            .clone()
            .oneshot(json_request("POST", "/api/leads", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let lead: Lead = serde_json::from_slice(
            &resp.into_body().collect().await.unwrap().to_bytes(),
        )
        .unwrap();
        let titles: Vec<&str> = lead.recipes.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
        assert_eq!(lead.recipes[1].department, "Sales");
    }

    #[tokio::test]
    async fn put_sync_overwrites_wholesale() {
        let app = test_app();
        let seed = serde_json::json!({
            "identity_key": "owner@example.com",
            "recipes": [recipe("A", "Finance"), recipe("B", "Sales")],
        });
        app.clone()
            .oneshot(json_request("POST", "/api/leads", seed))
            .await
            .unwrap();

        let overwrite = serde_json::json!({
            "identity_key": "owner@example.com",
            "recipes": [recipe("B", "Sales")],
        });
        let resp = app
            .clone()
            .oneshot(json_request("PUT", "/api/leads/sync", overwrite))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(roadmap_titles(&app, "owner@example.com").await, vec!["B"]);
    }

    #[tokio::test]
    async fn shadow_header_stands_in_for_identity_key() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri("/api/leads/sync")
                    .header("content-type", "application/json")
                    .header(SHADOW_ID_HEADER, "shadow-123")
                    .body(Body::from(
                        serde_json::json!({ "recipes": [recipe("A", "Finance")] }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(roadmap_titles(&app, "shadow-123").await, vec!["A"]);
    }

    #[tokio::test]
    async fn missing_identity_is_400_with_error_body() {
        let app = test_app();
        let resp = app
            .oneshot(json_request(
                "POST",
                "/api/leads",
                serde_json::json!({ "recipes": [] }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(payload["error"].is_string());
    }

    #[tokio::test]
    async fn library_flattens_across_leads_and_dedupes() {
        let app = test_app();
        for (key, titles) in [("a@example.com", vec!["A", "B"]), ("b@example.com", vec!["B", "C"])] {
            let recipes: Vec<_> = titles.iter().map(|t| recipe(t, "Finance")).collect();
            let body = serde_json::json!({ "identity_key": key, "recipes": recipes });
            app.clone()
                .oneshot(json_request("POST", "/api/leads", body))
                .await
                .unwrap();
        }
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/library")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let payload: LibraryResponse = serde_json::from_slice(
            &resp.into_body().collect().await.unwrap().to_bytes(),
        )
        .unwrap();
        let titles: Vec<&str> = payload.recipes.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leads.json");
        {
            let store = LeadStore::with_snapshot(&path).await;
            store
                .upsert_merge("owner@example.com", None, vec![recipe("A", "Finance")])
                .await;
        }
        let store = LeadStore::with_snapshot(&path).await;
        let titles: Vec<String> = store
            .roadmap("owner@example.com")
            .await
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert_eq!(titles, vec!["A"]);
    }
}
