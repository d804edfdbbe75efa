use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::PeerAddress;
use crate::filter::QuotientFilter;
use crate::raft::{ApplyOutcome, NodeHandle, RaftCommand, RaftError};

const FORWARD_RETRIES: usize = 3;
const FORWARD_BACKOFF: Duration = Duration::from_millis(500);

/// Application state shared across handlers
pub struct AppState {
    pub filter: Arc<QuotientFilter>,
    pub raft: NodeHandle,
    pub node_id: u64,
    pub http_client: reqwest::Client,
}

// ============================================================================
// Liveness
// ============================================================================

pub async fn home() -> &'static str {
    "Quotient is up and running"
}

pub async fn health() -> &'static str {
    "OK"
}

// ============================================================================
// Membership operations
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyRequest {
    #[serde(default)]
    pub key: String,
}

#[derive(Serialize)]
pub struct InsertResponse {
    pub key: String,
    pub status: &'static str,
}

/// Leader-only: replicates the insert through the log. A follower forwards
/// the request to the leader instead of serving it.
pub async fn insert(
    State(state): State<Arc<AppState>>,
    Json(request): Json<KeyRequest>,
) -> Result<Response, ApiError> {
    if request.key.is_empty() {
        return Err(ApiError::BadRequest("key is required".to_string()));
    }

    match state.raft.propose(RaftCommand::insert(request.key.as_str())).await {
        Ok(_) => Ok(Json(InsertResponse {
            key: request.key,
            status: "inserted",
        })
        .into_response()),
        Err(RaftError::NotLeader {
            leader_http: Some(leader),
        }) => forward(&state, &leader, "/v1/insert", &request).await,
        Err(e) => Err(e.into()),
    }
}

#[derive(Deserialize)]
pub struct ExistsQuery {
    #[serde(default)]
    pub key: String,
}

#[derive(Serialize)]
pub struct ExistsResponse {
    pub key: String,
    pub exists: bool,
    pub elapsed: String,
}

/// Served from the local replica; reflects everything applied here so far.
pub async fn exists(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExistsQuery>,
) -> Result<Json<ExistsResponse>, ApiError> {
    if query.key.is_empty() {
        return Err(ApiError::BadRequest("key is required".to_string()));
    }

    let (found, elapsed) = state.filter.exists(query.key.as_bytes());
    Ok(Json(ExistsResponse {
        key: query.key,
        exists: found,
        elapsed: format!("{:.2}µs", elapsed.as_secs_f64() * 1e6),
    }))
}

#[derive(Serialize)]
pub struct RemoveResponse {
    pub key: String,
    pub removed: bool,
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Json(request): Json<KeyRequest>,
) -> Result<Response, ApiError> {
    if request.key.is_empty() {
        return Err(ApiError::BadRequest("key is required".to_string()));
    }

    match state.raft.propose(RaftCommand::remove(request.key.as_str())).await {
        Ok(outcome) => Ok(Json(RemoveResponse {
            key: request.key,
            removed: outcome == ApplyOutcome::Removed,
        })
        .into_response()),
        Err(RaftError::NotLeader {
            leader_http: Some(leader),
        }) => forward(&state, &leader, "/v1/remove", &request).await,
        Err(e) => Err(e.into()),
    }
}

#[derive(Serialize)]
pub struct CountResponse {
    pub count: u64,
}

pub async fn count(State(state): State<Arc<AppState>>) -> Json<CountResponse> {
    Json(CountResponse {
        count: state.filter.count(),
    })
}

// ============================================================================
// Cluster management
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct AddPeerRequest {
    pub node_id: u64,
    /// Raft transport address of the new voter.
    pub addr: String,
    /// HTTP address used for leader forwarding; falls back to `addr`.
    #[serde(default)]
    pub http_addr: Option<String>,
}

pub async fn add_peer(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddPeerRequest>,
) -> Result<Response, ApiError> {
    if request.node_id == 0 || request.addr.is_empty() {
        return Err(ApiError::BadRequest(
            "node_id and addr are required".to_string(),
        ));
    }

    let peer = PeerAddress {
        id: request.node_id,
        raft_addr: request.addr.clone(),
        http_addr: request
            .http_addr
            .clone()
            .unwrap_or_else(|| request.addr.clone()),
    };

    match state.raft.add_peer(peer).await {
        Ok(()) => Ok(Json(serde_json::json!({
            "node_id": request.node_id,
            "status": "added",
        }))
        .into_response()),
        Err(RaftError::NotLeader {
            leader_http: Some(leader),
        }) => forward(&state, &leader, "/v1/add_peer", &request).await,
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemovePeerRequest {
    pub node_id: u64,
}

pub async fn remove_peer(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RemovePeerRequest>,
) -> Result<Response, ApiError> {
    if request.node_id == 0 {
        return Err(ApiError::BadRequest("node_id is required".to_string()));
    }

    match state.raft.remove_peer(request.node_id).await {
        Ok(()) => Ok(Json(serde_json::json!({
            "node_id": request.node_id,
            "status": "removed",
        }))
        .into_response()),
        Err(RaftError::NotLeader {
            leader_http: Some(leader),
        }) => forward(&state, &leader, "/v1/remove_peer", &request).await,
        Err(e) => Err(e.into()),
    }
}

#[derive(Serialize)]
pub struct InfoResponse {
    pub is_leader: bool,
    pub node_id: u64,
    pub qf_size: u64,
}

pub async fn info(State(state): State<Arc<AppState>>) -> Result<Json<InfoResponse>, ApiError> {
    let status = state.raft.status().await?;
    Ok(Json(InfoResponse {
        is_leader: status.is_leader,
        node_id: state.node_id,
        qf_size: state.filter.capacity(),
    }))
}

// ============================================================================
// Leader forwarding
// ============================================================================

/// Replays a leader-only request against the leader's HTTP address and
/// relays the response verbatim. Retried with back-off because a freshly
/// elected leader may not be serving yet.
async fn forward<T: Serialize>(
    state: &AppState,
    leader: &str,
    path: &str,
    body: &T,
) -> Result<Response, ApiError> {
    let url = format!("http://{leader}{path}");
    let mut last_error = String::new();

    for attempt in 1..=FORWARD_RETRIES {
        match state.http_client.post(&url).json(body).send().await {
            Ok(response) => {
                let status = StatusCode::from_u16(response.status().as_u16())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Forward(e.to_string()))?;
                return Ok(
                    (status, [(header::CONTENT_TYPE, "application/json")], bytes).into_response()
                );
            }
            Err(e) => {
                last_error = e.to_string();
                tracing::warn!(attempt, url = %url, error = %last_error, "forward to leader failed");
                if attempt < FORWARD_RETRIES {
                    tokio::time::sleep(FORWARD_BACKOFF).await;
                }
            }
        }
    }

    Err(ApiError::Forward(format!(
        "failed to reach leader after {FORWARD_RETRIES} attempts: {last_error}"
    )))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NoLeader,
    Forward(String),
    Apply(String),
    Internal(String),
}

impl From<RaftError> for ApiError {
    fn from(e: RaftError) -> Self {
        match e {
            RaftError::NotLeader { .. } | RaftError::NoLeader => ApiError::NoLeader,
            RaftError::ApplyTimeout => ApiError::Apply(e.to_string()),
            RaftError::Apply(msg) => ApiError::Apply(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NoLeader => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no leader available".to_string(),
            ),
            ApiError::Forward(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::Apply(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
