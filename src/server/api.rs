// src/server/api.rs

//! Route handlers for the control surface.
//!
//! Role probes (`/`, `/master`, `/replica`) answer 200/503 so TCP load
//! balancers can steer traffic by role. Mutating endpoints answer 503 when
//! the single background slot is occupied and 412 when a precondition does
//! not hold; they never queue work.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use serde::Deserialize;
use tracing::warn;

use super::ApiState;
use crate::core::postgres::StopMode;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(master_status))
        .route("/master", get(master_status))
        .route("/replica", get(replica_status))
        .route("/restart", post(restart))
        .route("/reinitialize", post(reinitialize))
        .route("/failover", post(failover))
        .with_state(state)
}

/// Checks HTTP basic auth against the configured `username:password`.
/// Endpoints that mutate state call this first; probes stay open.
fn authorized(state: &ApiState, headers: &HeaderMap) -> bool {
    let Some(required) = &state.config.restapi.auth else {
        return true;
    };
    let expected = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(required)
    );
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected)
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "authorization required\n").into_response()
}

async fn master_status(State(state): State<ApiState>) -> Response {
    match role(&state).await {
        Some(true) => (StatusCode::OK, "running as master\n").into_response(),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "not the master\n").into_response(),
    }
}

async fn replica_status(State(state): State<ApiState>) -> Response {
    match role(&state).await {
        Some(false) => (StatusCode::OK, "running as replica\n").into_response(),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "not a running replica\n").into_response(),
    }
}

/// `Some(true)` running primary, `Some(false)` running replica, `None` down.
async fn role(state: &ApiState) -> Option<bool> {
    match state.db.is_running().await {
        Ok(true) => state.db.is_leader().await.ok(),
        _ => None,
    }
}

async fn restart(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let db = state.db.clone();
    match state.executor.run_async("restarting the database", async move {
        if let Err(e) = db.restart().await {
            warn!("restart requested over the API failed: {e}");
        }
    }) {
        Ok(()) => (StatusCode::OK, "restart scheduled\n").into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("{e}\n")).into_response(),
    }
}

async fn reinitialize(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    // Wiping the data directory of the current primary would destroy the
    // cluster; only replicas may be rebuilt.
    if state.db.is_leader().await.unwrap_or(false) {
        return (
            StatusCode::PRECONDITION_FAILED,
            "I am the leader, cannot reinitialize\n",
        )
            .into_response();
    }

    let cluster = match state.dcs.get_cluster().await {
        Ok(cluster) => cluster,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, format!("{e}\n")).into_response(),
    };
    let Some(leader) = cluster.leader_member().cloned() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "cluster has no leader to reinitialize from\n",
        )
            .into_response();
    };

    let db = state.db.clone();
    let ha = state.ha.clone();
    match state
        .executor
        .run_async("reinitializing from leader", async move {
            if let Err(e) = db.stop(StopMode::Immediate).await {
                warn!("could not stop before reinitialize: {e}");
                return;
            }
            if let Err(e) = db.remove_data_directory().await {
                warn!("could not clear the data directory: {e}");
                return;
            }
            match db.sync_from_leader(&leader).await {
                Ok(true) => {
                    if let Err(e) = db.write_recovery_conf(Some(&leader)).await {
                        warn!("could not write recovery configuration: {e}");
                        return;
                    }
                    if let Err(e) = db.start().await {
                        warn!("could not start after reinitialize: {e}");
                        return;
                    }
                    ha.resume();
                }
                Ok(false) => warn!("base backup did not complete during reinitialize"),
                Err(e) => warn!("reinitialize failed: {e}"),
            }
        }) {
        Ok(()) => (StatusCode::OK, "reinitialize scheduled\n").into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("{e}\n")).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct FailoverBody {
    #[serde(default)]
    pub leader: Option<String>,
    #[serde(default)]
    pub candidate: Option<String>,
}

/// The fast path of a manual failover: the operator tool posts directly to
/// the current leader, which releases the lease and rewires itself under
/// the candidate. The slow path (a `failover` key in the DCS) converges to
/// the same state one tick later.
async fn failover(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<FailoverBody>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let me = state.db.name().to_string();
    if !state.db.is_leader().await.unwrap_or(false) {
        return (
            StatusCode::PRECONDITION_FAILED,
            format!("{me} is not the leader\n"),
        )
            .into_response();
    }
    if let Some(leader) = &body.leader
        && leader != &me
    {
        return (
            StatusCode::PRECONDITION_FAILED,
            format!("{leader} is not the leader\n"),
        )
            .into_response();
    }

    let Some(candidate_name) = body.candidate else {
        return (StatusCode::PRECONDITION_FAILED, "no candidate named\n").into_response();
    };
    if candidate_name == me {
        return (
            StatusCode::PRECONDITION_FAILED,
            "target and source are the same\n",
        )
            .into_response();
    }

    let cluster = match state.dcs.get_cluster().await {
        Ok(cluster) => cluster,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, format!("{e}\n")).into_response(),
    };
    let Some(candidate) = cluster.member(&candidate_name).cloned() else {
        return (
            StatusCode::PRECONDITION_FAILED,
            format!("{candidate_name} does not exist\n"),
        )
            .into_response();
    };

    let db = state.db.clone();
    let dcs = state.dcs.clone();
    match state.executor.run_async("manual failover", async move {
        if let Err(e) = dcs.delete_leader(&me).await {
            warn!("could not release the session lease for failover: {e}");
            return;
        }
        if let Err(e) = db.demote(Some(&candidate)).await {
            warn!("could not demote for failover: {e}");
        }
    }) {
        Ok(()) => (StatusCode::OK, "failover initiated\n").into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("{e}\n")).into_response(),
    }
}
