//! HTTP API: policy invocation, health checks and Prometheus metrics

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tuner_lib::{
    health::{components, ComponentStatus, HealthRegistry},
    observability::TunerMetrics,
    policy::{
        wire::{ServeError, ServeRequest},
        PolicyService,
    },
    TunerError,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PolicyService>,
    pub health_registry: HealthRegistry,
    pub metrics: TunerMetrics,
}

impl AppState {
    pub fn new(service: Arc<PolicyService>, health_registry: HealthRegistry, metrics: TunerMetrics) -> Self {
        Self {
            service,
            health_registry,
            metrics,
        }
    }
}

/// HTTP status for a failed policy call
fn status_for(error: &TunerError) -> StatusCode {
    match error {
        TunerError::InvalidObservation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        TunerError::FatalConfig(_) => StatusCode::BAD_REQUEST,
        TunerError::Conflict { .. } => StatusCode::CONFLICT,
        TunerError::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(status: StatusCode, message: String) -> axum::response::Response {
    (status, Json(ServeError { error: message })).into_response()
}

/// Observe or recommend against one model
async fn invoke(
    State(state): State<Arc<AppState>>,
    request: Result<Json<ServeRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return error_body(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    let start = Instant::now();
    let result = state.service.handle(&request).await;
    state
        .metrics
        .observe_request_latency(start.elapsed().as_secs_f64());

    match result {
        Ok(response) => {
            state.health_registry.set_healthy(components::MODEL_STORE).await;
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            let status = status_for(&e);
            if e.is_transient() {
                state
                    .health_registry
                    .set_degraded(components::MODEL_STORE, e.to_string())
                    .await;
            }
            if status.is_server_error() {
                warn!(
                    key = %request.target.key,
                    action = ?request.action,
                    error = %e,
                    "Policy invocation failed"
                );
            }
            error_body(status, e.to_string())
        }
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        TunerMetrics::render(),
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/invoke", post(invoke))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server and run until `shutdown` resolves
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use tuner_lib::error::StoreError;
    use tuner_lib::policy::PolicyState;
    use tuner_lib::store::{InMemoryModelStore, ModelKey, ModelStore};

    async fn setup_app(store: Arc<dyn ModelStore>) -> (Router, Arc<AppState>) {
        let health_registry = HealthRegistry::new();
        health_registry.register(components::POLICY_SERVICE).await;
        health_registry.register(components::MODEL_STORE).await;

        let state = Arc::new(AppState::new(
            Arc::new(PolicyService::new(store)),
            health_registry,
            TunerMetrics::new(),
        ));
        (create_router(state.clone()), state)
    }

    fn serve_request(action: &str, request: Value) -> Value {
        json!({
            "action": action,
            "target": {"bucket": "models", "key": "resize_exp.model"},
            "config": {
                "action_space": [128, 256, 512],
                "features": ["payload_size"],
                "model_name": "resize"
            },
            "request": request
        })
    }

    async fn post_json(app: Router, body: String) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/invoke")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_observe_then_recommend() {
        let store = Arc::new(InMemoryModelStore::new());
        let (app, _state) = setup_app(store.clone()).await;

        let observe = serve_request(
            "observe",
            json!({"payload_size": 100, "selected_action": 256, "cost": -40.0, "probability": 0.9}),
        );
        let (status, body) = post_json(app.clone(), observe.to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"result": 1}));
        assert_eq!(store.keys().await.len(), 1);

        let recommend = serve_request("recommend", json!({"payload_size": 100}));
        let (status, body) = post_json(app, recommend.to_string()).await;
        assert_eq!(status, StatusCode::OK);

        let result = &body["result"];
        let size = result["recommended_action"].as_u64().unwrap();
        assert!([128, 256, 512].contains(&size));
        let probabilities = result["probability_list"].as_array().unwrap();
        assert_eq!(probabilities.len(), 3);
        let sum: f64 = probabilities.iter().map(|p| p.as_f64().unwrap()).sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_invalid_observation_is_422() {
        let (app, _state) = setup_app(Arc::new(InMemoryModelStore::new())).await;

        let observe = serve_request(
            "observe",
            json!({"payload_size": 100, "selected_action": 256, "cost": 1.0, "probability": 0.0}),
        );
        let (status, body) = post_json(app, observe.to_string()).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("invalid observation"));
    }

    #[tokio::test]
    async fn test_unknown_action_size_is_422() {
        let (app, _state) = setup_app(Arc::new(InMemoryModelStore::new())).await;

        let observe = serve_request(
            "observe",
            json!({"payload_size": 100, "selected_action": 300, "cost": 1.0, "probability": 0.5}),
        );
        let (status, _) = post_json(app, observe.to_string()).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let (app, _state) = setup_app(Arc::new(InMemoryModelStore::new())).await;

        let (status, body) = post_json(app.clone(), "{not json".to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let mut bad_space = serve_request("recommend", json!({"payload_size": 1}));
        bad_space["config"]["action_space"] = json!([512, 128]);
        let (status, _) = post_json(app, bad_space.to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    struct ConflictingStore;

    #[async_trait]
    impl ModelStore for ConflictingStore {
        async fn load(&self, key: &ModelKey) -> Result<PolicyState, StoreError> {
            Err(StoreError::NotFound(key.to_string()))
        }

        async fn save(&self, key: &ModelKey, _state: &PolicyState) -> Result<u64, StoreError> {
            Err(StoreError::Conflict {
                key: key.to_string(),
                expected: 0,
                found: 3,
            })
        }
    }

    #[tokio::test]
    async fn test_conflicting_save_is_409() {
        let (app, _state) = setup_app(Arc::new(ConflictingStore)).await;

        let observe = serve_request(
            "observe",
            json!({"payload_size": 100, "selected_action": 128, "cost": -5.0, "probability": 0.5}),
        );
        let (status, body) = post_json(app, observe.to_string()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("concurrently"));
    }

    struct UnreachableStore;

    #[async_trait]
    impl ModelStore for UnreachableStore {
        async fn load(&self, _key: &ModelKey) -> Result<PolicyState, StoreError> {
            Err(StoreError::Transient("connection refused".to_string()))
        }

        async fn save(&self, _key: &ModelKey, _state: &PolicyState) -> Result<u64, StoreError> {
            Err(StoreError::Transient("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_unreachable_store_is_503_and_degrades_health() {
        let (app, state) = setup_app(Arc::new(UnreachableStore)).await;

        let recommend = serve_request("recommend", json!({"payload_size": 1}));
        let (status, _) = post_json(app.clone(), recommend.to_string()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let health = state.health_registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);

        // degraded is still operational
        let (status, _) = get(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_tracks_startup_and_health() {
        let (app, state) = setup_app(Arc::new(InMemoryModelStore::new())).await;

        let (status, body) = get(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let readiness: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(readiness["ready"], false);

        state.health_registry.set_ready(true).await;
        let (status, _) = get(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::OK);

        state
            .health_registry
            .set_unhealthy(components::POLICY_SERVICE, "Failed")
            .await;
        let (status, _) = get(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = get(app, "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_returns_prometheus_format() {
        let (app, _state) = setup_app(Arc::new(InMemoryModelStore::new())).await;

        let recommend = serve_request("recommend", json!({"payload_size": 1}));
        let (status, _) = post_json(app.clone(), recommend.to_string()).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = get(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("memory_tuner_recommendations_total"));
        assert!(text.contains("memory_tuner_request_latency_seconds_bucket"));
    }
}
