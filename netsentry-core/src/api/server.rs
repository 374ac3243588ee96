//! HTTP сервер для Control API.

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::rules::Rule;

/// Состояние API сервера: дешёвый клон движка.
#[derive(Clone)]
pub struct ApiState {
    engine: Engine,
}

impl ApiState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

/// Обработчик для endpoint `/health`.
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "netsentry-api"
    }))
}

/// Обработчик для endpoint `/api/status`.
///
/// Возвращает срез состояния движка: счётчики, размеры хранилищ, блок-листы.
async fn status_handler(State(state): State<ApiState>) -> Json<Value> {
    let status = state.engine.get_status().await;
    Json(json!({
        "status": "ok",
        "engine": status
    }))
}

/// Обработчик для endpoint `/api/threats`.
///
/// Возвращает последние события угроз (до 100).
async fn threats_handler(State(state): State<ApiState>) -> Json<Value> {
    let threats = state.engine.recent_threats(100).await;
    Json(json!({
        "status": "ok",
        "count": threats.len(),
        "threats": threats
    }))
}

/// Обработчик для endpoint `GET /api/rules`.
async fn rules_list_handler(State(state): State<ApiState>) -> Json<Value> {
    let rules = state.engine.rules().await;
    Json(json!({
        "status": "ok",
        "count": rules.len(),
        "rules": rules
    }))
}

/// Обработчик для endpoint `POST /api/rules`.
async fn rules_add_handler(
    State(state): State<ApiState>,
    Json(rule): Json<Rule>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let rule_id = rule.id.clone();
    match state.engine.add_rule(rule).await {
        Ok(()) => Ok(Json(json!({ "status": "ok", "rule_id": rule_id }))),
        Err(e @ EngineError::DuplicateRule(_)) => Err((
            StatusCode::CONFLICT,
            Json(json!({ "status": "error", "message": e.to_string() })),
        )),
        Err(e) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": e.to_string() })),
        )),
    }
}

/// Обработчик для endpoint `DELETE /api/rules/:id`.
async fn rules_remove_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.engine.remove_rule(&id).await {
        Ok(removed) => Ok(Json(json!({ "status": "ok", "removed": removed.id }))),
        Err(e) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "error", "message": e.to_string() })),
        )),
    }
}

/// Обработчик для endpoint `GET /api/blocklist`.
async fn blocklist_handler(State(state): State<ApiState>) -> Json<Value> {
    let blocklists = state.engine.blocklists().await;
    let mut sources: Vec<String> = blocklists.sources.into_iter().collect();
    sources.sort();
    let mut ports: Vec<u16> = blocklists.ports.into_iter().collect();
    ports.sort_unstable();
    Json(json!({
        "status": "ok",
        "sources": sources,
        "ports": ports
    }))
}

#[derive(Debug, Deserialize)]
struct BlockSourceRequest {
    source_key: String,
}

/// Обработчик для endpoint `POST /api/blocklist/sources`.
async fn block_source_handler(
    State(state): State<ApiState>,
    Json(req): Json<BlockSourceRequest>,
) -> Json<Value> {
    let newly_blocked = state.engine.block_source(req.source_key.clone()).await;
    Json(json!({
        "status": "ok",
        "source_key": req.source_key,
        "newly_blocked": newly_blocked
    }))
}

/// Обработчик для endpoint `DELETE /api/blocklist/sources/:key`.
async fn unblock_source_handler(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> Json<Value> {
    let removed = state.engine.unblock_source(&key).await;
    Json(json!({
        "status": "ok",
        "source_key": key,
        "removed": removed
    }))
}

/// Создаёт роутер для API.
fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/threats", get(threats_handler))
        .route("/api/rules", get(rules_list_handler).post(rules_add_handler))
        .route("/api/rules/:id", delete(rules_remove_handler))
        .route("/api/blocklist", get(blocklist_handler))
        .route("/api/blocklist/sources", post(block_source_handler))
        .route(
            "/api/blocklist/sources/:key",
            delete(unblock_source_handler),
        )
        .with_state(state)
}

/// HTTP API сервер NetSentry.
///
/// Запускается в отдельной задаче и останавливается через handle.
pub struct ApiServer {
    addr: std::net::SocketAddr,
    state: ApiState,
}

impl ApiServer {
    pub fn new(addr: std::net::SocketAddr, engine: Engine) -> Self {
        Self {
            addr,
            state: ApiState::new(engine),
        }
    }

    /// Запускает API сервер в фоновой задаче.
    ///
    /// # Ошибки
    ///
    /// Возвращает ошибку, если не удалось привязаться к адресу.
    pub async fn start(self) -> Result<ApiServerHandle> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("Failed to bind API server to {}", self.addr))?;

        info!("API server listening on http://{}", self.addr);

        let router = create_router(self.state);
        let server = axum::serve(listener, router);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = ApiServerHandle {
            shutdown_tx: Some(shutdown_tx),
        };

        tokio::spawn(async move {
            let graceful = server.with_graceful_shutdown(async {
                shutdown_rx.await.ok();
            });

            if let Err(e) = graceful.await {
                error!("API server error: {}", e);
            } else {
                info!("API server stopped");
            }
        });

        Ok(handle)
    }
}

/// Handle для управления API сервером.
pub struct ApiServerHandle {
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ApiServerHandle {
    /// Останавливает API сервер.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            tx.send(()).map_err(|_| {
                anyhow::anyhow!("Failed to send shutdown signal to API server (receiver dropped)")
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn health_handler_reports_ok() {
        let json = health_handler().await;
        let value: Value = json.0;
        assert_eq!(value["status"], "ok");
        assert_eq!(value["service"], "netsentry-api");
    }

    #[tokio::test]
    async fn status_handler_exposes_engine_state() {
        let engine = Engine::new(Config::default());
        let state = ApiState::new(engine);
        let json = status_handler(State(state)).await;
        let value: Value = json.0;
        assert_eq!(value["status"], "ok");
        assert_eq!(value["engine"]["state"], "stopped");
        assert_eq!(value["engine"]["records_stored"], 0);
    }

    #[tokio::test]
    async fn block_and_unblock_via_handlers() {
        let engine = Engine::new(Config::default());
        let state = ApiState::new(engine.clone());

        let json = block_source_handler(
            State(state.clone()),
            Json(BlockSourceRequest {
                source_key: "1.2.3.4".to_string(),
            }),
        )
        .await;
        assert_eq!(json.0["newly_blocked"], true);

        // Повторная блокировка идемпотентна
        let json = block_source_handler(
            State(state.clone()),
            Json(BlockSourceRequest {
                source_key: "1.2.3.4".to_string(),
            }),
        )
        .await;
        assert_eq!(json.0["newly_blocked"], false);

        let json = unblock_source_handler(State(state), Path("1.2.3.4".to_string())).await;
        assert_eq!(json.0["removed"], true);
        assert!(!engine.blocklists().await.is_source_blocked("1.2.3.4"));
    }
}
