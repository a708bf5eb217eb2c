//! HTTP API Server
//!
//! REST surface for observability: member list, current leader, epoch and
//! the last failover reason. No cluster state can be mutated through the
//! status routes; the only mutating route is the explicit
//! `POST /admin/failover` step-down request.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cluster::{ClusterMember, MemberRegistry};
use crate::config::ApiConfig;
use crate::election::ElectionEngine;
use crate::error::{Error, Result};
use crate::failover::{FailoverDecision, FailoverOrchestrator};
use crate::topology::TopologyRecord;

/// Shared application state
pub struct AppState {
    /// This node's member name
    pub node_name: String,
    /// Member state cache
    pub registry: Arc<MemberRegistry>,
    /// Election state machine
    pub engine: Arc<ElectionEngine>,
    /// Failover orchestrator (topology + decision reads)
    pub orchestrator: Arc<FailoverOrchestrator>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(
        config: ApiConfig,
        node_name: String,
        registry: Arc<MemberRegistry>,
        engine: Arc<ElectionEngine>,
        orchestrator: Arc<FailoverOrchestrator>,
    ) -> Self {
        let state = Arc::new(AppState {
            node_name,
            registry,
            engine,
            orchestrator,
        });
        Self { config, state }
    }

    fn create_router(state: Arc<AppState>, cors_enabled: bool) -> Router {
        let router = Router::new()
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .route("/cluster", get(handle_cluster_info))
            .route("/cluster/nodes", get(handle_nodes))
            .route("/cluster/nodes/:name", get(handle_node_info))
            .route("/topology", get(handle_topology))
            .route("/admin/failover", post(handle_manual_failover))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        if cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state), self.config.cors_enabled);

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Http(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Response Types ============

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_name: String,
    pub state: String,
    pub is_leader: bool,
    pub leader_name: Option<String>,
    pub epoch: Option<u64>,
    pub member_count: usize,
    pub last_failover: Option<FailoverDecision>,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_name: String,
    pub state: String,
}

/// Cluster info response
#[derive(Debug, Serialize)]
pub struct ClusterInfoResponse {
    pub members: Vec<ClusterMember>,
    pub leader_name: Option<String>,
    pub epoch: Option<u64>,
    pub last_failover_reason: Option<String>,
}

/// Admin action response
#[derive(Debug, Serialize)]
pub struct AdminResponse {
    pub success: bool,
    pub message: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// ============ Handlers ============

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let topology = state.orchestrator.observe_topology().await.ok().flatten();
    let last_failover = state.orchestrator.last_decision().await.ok().flatten();
    let members = state.registry.list_members().await;
    let engine_state = state.engine.state().await;

    Json(StatusResponse {
        node_name: state.node_name.clone(),
        state: engine_state.to_string(),
        is_leader: state.engine.is_leader().await,
        leader_name: topology.as_ref().map(|(r, _)| r.leader_name.clone()),
        epoch: topology.as_ref().map(|(r, _)| r.epoch),
        member_count: members.len(),
        last_failover,
    })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine_state = state.engine.state().await;
    Json(HealthResponse {
        healthy: true,
        node_name: state.node_name.clone(),
        state: engine_state.to_string(),
    })
}

async fn handle_cluster_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let topology = state.orchestrator.observe_topology().await.ok().flatten();
    let last_failover = state.orchestrator.last_decision().await.ok().flatten();

    Json(ClusterInfoResponse {
        members: state.registry.list_members().await,
        leader_name: topology.as_ref().map(|(r, _)| r.leader_name.clone()),
        epoch: topology.as_ref().map(|(r, _)| r.epoch),
        last_failover_reason: last_failover.map(|d| d.reason.to_string()),
    })
}

async fn handle_nodes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list_members().await)
}

async fn handle_node_info(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&name).await {
        Some(member) => Json(member).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Member {} not found", name),
                code: "MEMBER_NOT_FOUND".to_string(),
            }),
        )
            .into_response(),
    }
}

async fn handle_topology(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.orchestrator.observe_topology().await {
        Ok(Some((record, _))) => Json::<TopologyRecord>(record).into_response(),
        Ok(None) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "No leader published".to_string(),
                code: "NO_LEADER".to_string(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: e.to_string(),
                code: "STORE_UNAVAILABLE".to_string(),
            }),
        )
            .into_response(),
    }
}

async fn handle_manual_failover(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.engine.request_manual_failover().await {
        Ok(()) => Json(AdminResponse {
            success: true,
            message: "Step-down requested; failover begins on the next cycle".to_string(),
        })
        .into_response(),
        Err(Error::NoLeader) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "This node is not the leader".to_string(),
                code: "NOT_LEADER".to_string(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
                code: "INTERNAL".to_string(),
            }),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{CoordinationStore, MemoryStore};
    use crate::db::mock::MockDb;
    use crate::db::DatabaseManager;
    use std::time::Duration;

    async fn app_state() -> Arc<AppState> {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(MemberRegistry::new(
            "a".to_string(),
            Duration::from_secs(20),
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
        ));
        registry.register_self("10.0.0.1:3306".into()).await.unwrap();

        let db = Arc::new(MockDb::new(100));
        let orchestrator = Arc::new(FailoverOrchestrator::new(
            "a".to_string(),
            "10.0.0.1:3306".to_string(),
            Arc::clone(&registry),
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
            Arc::clone(&db) as Arc<dyn DatabaseManager>,
            0,
        ));
        let engine = Arc::new(ElectionEngine::new(
            "a".to_string(),
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
            Arc::clone(&registry),
            Arc::clone(&orchestrator),
            Arc::clone(&db) as Arc<dyn DatabaseManager>,
            Duration::from_millis(200),
            Duration::from_millis(80),
        ));

        Arc::new(AppState {
            node_name: "a".to_string(),
            registry,
            engine,
            orchestrator,
        })
    }

    #[tokio::test]
    async fn test_status_before_any_election() {
        let state = app_state().await;
        let response = handle_status(State(Arc::clone(&state))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_topology_unavailable_without_leader() {
        let state = app_state().await;
        let response = handle_topology(State(Arc::clone(&state)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_manual_failover_rejected_on_follower() {
        let state = app_state().await;
        let response = handle_manual_failover(State(Arc::clone(&state)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_node_info_found_and_missing() {
        let state = app_state().await;

        let found = handle_node_info(State(Arc::clone(&state)), Path("a".to_string()))
            .await
            .into_response();
        assert_eq!(found.status(), StatusCode::OK);

        let missing = handle_node_info(State(Arc::clone(&state)), Path("zz".to_string()))
            .await
            .into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_topology_after_election() {
        let state = app_state().await;
        state.engine.tick().await;
        state.engine.tick().await;
        assert!(state.engine.is_leader().await);

        let response = handle_topology(State(Arc::clone(&state)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
