//! The OpenAI-compatible HTTP surface of the gateway.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::proxy;
use crate::registry::{Error, Resolver};

#[derive(Clone)]
pub(crate) struct AppState {
    resolver: Resolver,
    client: reqwest::Client,
}

impl AppState {
    pub(crate) fn new(resolver: Resolver) -> AppState {
        AppState {
            resolver,
            client: reqwest::Client::new(),
        }
    }
}

/// An error rendered the way OpenAI clients expect.
pub(crate) struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(value: Error) -> Self {
        ApiError(value)
    }
}

impl ApiError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            Error::SecurityRejection | Error::Validation(_) | Error::InvalidPersistedState { .. } => {
                (StatusCode::BAD_REQUEST, "invalid_request_error")
            }
            Error::NotFound { .. } => (StatusCode::NOT_FOUND, "model_not_found"),
            Error::Persistence(_) | Error::Config(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
            }
            Error::Backend(_) => (StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable"),
            Error::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_type();

        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            warn!(error = %self.0, "request rejected");
        }

        let body = json!({
            "error": {
                "message": self.0.to_string(),
                "type": kind,
            }
        });

        (status, Json(body)).into_response()
    }
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/models", get(list_models))
        .route("/v1/completions", post(completions))
        .route("/v1/chat/completions", post(completions))
        .route("/v1/backends", get(list_backends))
        .route("/v1/routes/{*model}", delete(forget_route))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let models = state.resolver.models().await?;

    let data: Vec<Value> = models
        .into_iter()
        .map(|id| json!({"id": id, "object": "model", "owned_by": "modelgate"}))
        .collect();

    Ok(Json(json!({"object": "list", "data": data})))
}

async fn list_backends(State(state): State<AppState>) -> impl IntoResponse {
    let backends = state.resolver.pool().running().await;

    Json(json!({"object": "list", "data": backends}))
}

async fn forget_route(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.resolver.forget(&model).await? {
        Ok(Json(json!({"id": model, "deleted": true})))
    } else {
        Err(Error::NotFound {
            model,
            attempted: Vec::new(),
        }
        .into())
    }
}

/// Shared by the completion endpoints: resolve the requested model, then
/// forward the request to wherever it lives.
async fn completions(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Result<Response, ApiError> {
    let body: Value = serde_json::from_slice(&body)
        .map_err(|err| Error::Validation(format!("request body is not valid JSON: {}", err)))?;

    let model = match body.get("model") {
        Some(Value::String(model)) => model.clone(),
        _ if !body.is_object() => {
            return Err(Error::Validation("request body must be a JSON object".to_string()).into())
        }
        _ => return Err(Error::Validation("\"model\" must be a string".to_string()).into()),
    };

    let resolved = state.resolver.resolve(&model).await?;

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    let response = proxy::forward(&state.client, method, path_and_query, body, &resolved)
        .await
        .map_err(Error::Upstream)?;

    Ok(response)
}

/// Serves the gateway on `listen` until interrupted, then stops every
/// backend.
pub(crate) async fn run(listen: &str, state: AppState) -> std::io::Result<()> {
    let pool = state.resolver.pool().clone();

    let listener = TcpListener::bind(listen).await?;

    info!(address = %listener.local_addr()?, "gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }

            info!("shutting down");
        })
        .await?;

    pool.shutdown().await;

    Ok(())
}
