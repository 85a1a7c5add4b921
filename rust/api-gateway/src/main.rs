/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! API gateway — the HTTP surface over the dispatch broker.
//!
//! Exposes:
//! - `POST /api/ai/completion`            — synchronous text completion
//! - `POST /api/ai/analyze-prescription`  — synchronous prescription analysis
//! - `POST /api/chats/:id/messages`       — persist a chat message; detected
//!   prescriptions trigger a background analysis
//! - `POST /api/chats/:id/images`         — resolve an uploaded image and
//!   fire-and-forget its analysis
//! - `GET  /healthz`                      — health check
//!
//! Authentication and billing are handled upstream; requests arriving here
//! are already authorized.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rxline_analysis::job::AnalysisJob;
use rxline_analysis::{is_prescription_message, Budgets, FallbackChain, ProviderClient, StrategyContext};
use rxline_config::Config;
use rxline_dispatch::{DispatchBroker, DispatchError, NatsTransport, Subjects, Transport};
use rxline_runtime::CircuitBreaker;
use rxline_store::{ChatStore, Message, NewMessage, ObjectStore, PgChatStore, PublicUrlObjectStore, StoreError};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const SERVICE_NAME: &str = "api-gateway";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const CIRCUIT_HALF_OPEN_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The analysis did not finish within the wait budget; the caller may
    /// retry later.
    #[error("analysis timed out")]
    Timeout,
    #[error("message bus unavailable: {0}")]
    Bus(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DispatchError> for GatewayError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Timeout(_) => Self::Timeout,
            DispatchError::Transport(e) => Self::Bus(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            GatewayError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            GatewayError::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "analysis timed out, please try again later".to_string(),
            ),
            GatewayError::Bus(e) => {
                error!(error = %e, "message bus unavailable");
                (
                    StatusCode::BAD_GATEWAY,
                    "analysis service unavailable".to_string(),
                )
            }
            GatewayError::Store(e) => {
                error!(error = %e, "store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
            GatewayError::Internal(e) => {
                error!(error = %e, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": msg }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

struct AppState {
    config: Arc<Config>,
    broker: DispatchBroker,
    chats: Arc<dyn ChatStore>,
    objects: Arc<dyn ObjectStore>,
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CompletionBody {
    prompt: String,
}

#[derive(Deserialize)]
struct AnalyzeBody {
    text: String,
}

fn default_content_type() -> String {
    "text".to_string()
}

#[derive(Deserialize)]
struct MessageBody {
    role: String,
    content: String,
    #[serde(default = "default_content_type")]
    content_type: String,
}

#[derive(Deserialize)]
struct ImageBody {
    object_key: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn completion_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CompletionBody>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    if body.prompt.is_empty() {
        return Err(GatewayError::BadRequest("prompt field is required".to_string()));
    }

    let job = AnalysisJob::completion(&body.prompt);
    let wait = Duration::from_secs(state.config.analysis.completion_wait_seconds);
    let result = dispatch_or_run_inline(&state, job, wait).await?;

    Ok(Json(serde_json::json!({
        "status": result.status.as_str(),
        "completion": result.text,
    })))
}

async fn analyze_prescription_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AnalyzeBody>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    if body.text.is_empty() {
        return Err(GatewayError::BadRequest("text field is required".to_string()));
    }

    let job = AnalysisJob::prescription_text(&body.text);
    let wait = Duration::from_secs(state.config.analysis.prescription_wait_seconds);
    let result = dispatch_or_run_inline(&state, job, wait).await?;

    Ok(Json(serde_json::json!({
        "status": result.status.as_str(),
        "analysis": result.text,
    })))
}

/// Bus round-trip when connected; in-process chain when the transport is
/// down, so a bus outage degrades latency rather than availability.
async fn dispatch_or_run_inline(
    state: &AppState,
    job: AnalysisJob,
    wait: Duration,
) -> Result<rxline_analysis::job::AnalysisResult, GatewayError> {
    if state.broker.is_connected() {
        Ok(state.broker.dispatch_sync(job, wait).await?)
    } else {
        warn!(job_id = %job.id, "transport disconnected, running analysis in-process");
        Ok(state.broker.run_inline(&job).await)
    }
}

async fn create_message_handler(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Json(body): Json<MessageBody>,
) -> Result<Json<Message>, GatewayError> {
    if body.content.is_empty() {
        return Err(GatewayError::BadRequest("content field is required".to_string()));
    }

    let message = state
        .chats
        .append_message(NewMessage {
            chat_id,
            role: body.role.clone(),
            content: body.content.clone(),
            content_type: body.content_type,
            metadata: serde_json::Value::Null,
        })
        .await?;

    // Prescription-like user messages trigger a background analysis; the
    // response to this request is not held up by it.
    if body.role == "user" && is_prescription_message(&body.content) {
        info!(chat_id, message_id = message.id, "prescription detected in chat message");
        state
            .broker
            .dispatch_async(AnalysisJob::prescription_text(&body.content), chat_id);
    }

    Ok(Json(message))
}

async fn upload_image_handler(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Json(body): Json<ImageBody>,
) -> Result<Json<Message>, GatewayError> {
    if body.object_key.is_empty() {
        return Err(GatewayError::BadRequest("object_key field is required".to_string()));
    }

    let ttl = Duration::from_secs(state.config.storage.url_ttl_hours * 3600);
    let image_url = state.objects.temporary_url(&body.object_key, ttl).await?;

    let message = state
        .chats
        .append_message(NewMessage {
            chat_id,
            role: "user".to_string(),
            content: image_url.clone(),
            content_type: "image".to_string(),
            metadata: serde_json::json!({ "object_key": body.object_key }),
        })
        .await?;

    info!(chat_id, message_id = message.id, "prescription image received");
    state
        .broker
        .dispatch_async(AnalysisJob::prescription_image(&image_url), chat_id);

    Ok(Json(message))
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "nats_connected": state.broker.is_connected(),
    }))
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("fatal: failed to load config: {e}");
        process::exit(1);
    });
    let config = Arc::new(config);

    let _telemetry_guard = rxline_telemetry::init_telemetry(SERVICE_NAME, &config.telemetry)
        .unwrap_or_else(|e| {
            eprintln!("fatal: telemetry init failed: {e}");
            process::exit(1);
        });

    info!(service = SERVICE_NAME, version = SERVICE_VERSION, "starting");

    let state = match init_state(Arc::clone(&config)).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "fatal: failed to initialise");
            process::exit(1);
        }
    };

    let cors = build_cors(&config);

    let app = Router::new()
        .route("/api/ai/completion", post(completion_handler))
        .route(
            "/api/ai/analyze-prescription",
            post(analyze_prescription_handler),
        )
        .route("/api/chats/:chat_id/messages", post(create_message_handler))
        .route("/api/chats/:chat_id/images", post(upload_image_handler))
        .route("/healthz", get(healthz_handler))
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.gateway.port));
    info!(addr = %addr, "api gateway listening");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind");
            process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(rxline_runtime::shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
    }

    info!("shutdown complete");
}

async fn init_state(config: Arc<Config>) -> Result<AppState, GatewayError> {
    // Postgres pool for the chat store
    let pg_url = format!(
        "postgres://{}:{}@{}:{}/{}",
        config.postgres.user,
        config.postgres.password,
        config.postgres.host,
        config.postgres.port,
        config.postgres.database,
    );
    let pool = PgPoolOptions::new()
        .min_connections(config.postgres.min_connections)
        .max_connections(config.postgres.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&pg_url)
        .await
        .map_err(StoreError::Database)?;
    info!("postgres pool connected");

    let chats: Arc<dyn ChatStore> = Arc::new(PgChatStore::new(pool));
    let objects: Arc<dyn ObjectStore> =
        Arc::new(PublicUrlObjectStore::new(&config.storage.public_base_url));

    let transport = NatsTransport::connect(SERVICE_NAME, &config.nats)
        .await
        .map_err(|e| GatewayError::Bus(e.to_string()))?;

    // Shared HTTP client for the in-process analysis path
    let http = reqwest::Client::builder()
        .pool_max_idle_per_host(4)
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to create HTTP client: {e}")))?;

    let breaker = Arc::new(CircuitBreaker::new(
        "provider",
        CIRCUIT_FAILURE_THRESHOLD,
        CIRCUIT_HALF_OPEN_SECS,
    ));
    let provider = Arc::new(ProviderClient::new(http.clone(), &config.provider, breaker));
    let chain = Arc::new(FallbackChain::new(StrategyContext {
        provider,
        http,
        budgets: Budgets::from_config(&config),
    }));

    let broker = DispatchBroker::new(
        Arc::new(transport) as Arc<dyn Transport>,
        chain,
        Arc::clone(&chats),
        Subjects::new(&config.nats.subject_prefix),
    );

    Ok(AppState {
        config,
        broker,
        chats,
        objects,
    })
}

fn build_cors(config: &Config) -> CorsLayer {
    if config.gateway.cors_origins.is_empty() {
        if config.service.env != "dev" && config.service.env != "local" {
            error!("gateway.cors_origins is empty in non-dev environment — refusing to start");
            process::exit(1);
        }
        warn!("gateway.cors_origins is empty — allowing all origins (dev/local mode)");
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
    } else {
        let parsed: Vec<header::HeaderValue> = config
            .gateway
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rxline_analysis::job::StrategyKind;
    use rxline_analysis::{Strategy, StrategyError};
    use rxline_dispatch::MemoryTransport;
    use rxline_store::{MemoryChatStore, MemoryObjectStore};

    fn test_config() -> Arc<Config> {
        let toml_str = r#"
[service]
env = "test"

[nats]
url = "nats://127.0.0.1:4222"

[provider]
api_key = "sk-test"

[postgres]
host = "127.0.0.1"
port = 5432
database = "rxline"
user = "rxline"
password = "secret"
"#;
        Arc::new(toml::from_str(toml_str).unwrap())
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl Strategy for Fixed {
        fn kind(&self) -> StrategyKind {
            StrategyKind::TextDescription
        }

        async fn attempt(
            &self,
            _job: &AnalysisJob,
            _ctx: &StrategyContext,
        ) -> Result<String, StrategyError> {
            Ok(self.0.to_string())
        }
    }

    fn test_state(
        transport: Arc<MemoryTransport>,
        reply_text: &'static str,
    ) -> (Arc<AppState>, Arc<MemoryChatStore>, Arc<MemoryObjectStore>) {
        let config = test_config();
        let chats = Arc::new(MemoryChatStore::new());
        let objects = Arc::new(MemoryObjectStore::new());

        let provider_config = rxline_config::ProviderConfig {
            base_url: "https://provider.test/v1".to_string(),
            api_key: "sk-test".to_string(),
            model: "test-model".to_string(),
            completion_max_tokens: 2000,
            analysis_max_tokens: 8000,
            temperature: 0.7,
        };
        let chain = Arc::new(FallbackChain::with_strategies(
            StrategyContext {
                provider: Arc::new(ProviderClient::new(
                    reqwest::Client::new(),
                    &provider_config,
                    Arc::new(CircuitBreaker::new("provider", 5, 30)),
                )),
                http: reqwest::Client::new(),
                budgets: Budgets::from_config(&config),
            },
            vec![Box::new(Fixed(reply_text))],
        ));

        let broker = DispatchBroker::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            chain,
            Arc::clone(&chats) as Arc<dyn ChatStore>,
            Subjects::new(&config.nats.subject_prefix),
        );

        let state = Arc::new(AppState {
            config,
            broker,
            chats: Arc::clone(&chats) as Arc<dyn ChatStore>,
            objects: Arc::clone(&objects) as Arc<dyn ObjectStore>,
        });
        (state, chats, objects)
    }

    #[tokio::test]
    async fn test_healthz_reports_connection_state() {
        let transport = Arc::new(MemoryTransport::new());
        let (state, _, _) = test_state(Arc::clone(&transport), "unused");

        let Json(body) = healthz_handler(State(Arc::clone(&state))).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["nats_connected"], true);

        transport.set_connected(false);
        let Json(body) = healthz_handler(State(state)).await;
        assert_eq!(body["nats_connected"], false);
    }

    #[tokio::test]
    async fn test_prescription_message_triggers_background_analysis() {
        let transport = Arc::new(MemoryTransport::new());
        let (state, chats, _) = test_state(transport, "با سلام همکار گرامی، تحلیل شد.");

        let Json(message) = create_message_handler(
            State(state),
            Path(3),
            Json(MessageBody {
                role: "user".to_string(),
                content: "نسخه: آموکسی‌سیلین ۵۰۰".to_string(),
                content_type: "text".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(message.role, "user");

        // The analysis lands as a second, assistant message.
        for _ in 0..100 {
            if chats.messages_for(3).unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let messages = chats.messages_for(3).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "با سلام همکار گرامی، تحلیل شد.");
    }

    #[tokio::test]
    async fn test_plain_message_triggers_nothing() {
        let transport = Arc::new(MemoryTransport::new());
        let (state, chats, _) = test_state(transport, "unused");

        create_message_handler(
            State(state),
            Path(3),
            Json(MessageBody {
                role: "user".to_string(),
                content: "سلام، حالت چطوره؟".to_string(),
                content_type: "text".to_string(),
            }),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(chats.messages_for(3).unwrap().len(), 1, "no analysis spawned");
    }

    #[tokio::test]
    async fn test_image_upload_resolves_key_and_dispatches() {
        let transport = Arc::new(MemoryTransport::new());
        let (state, chats, objects) = test_state(transport, "تحلیل نسخه تصویری.");
        objects
            .insert("chats/9/rx.jpg", "http://images.test/chats/9/rx.jpg")
            .unwrap();

        let Json(message) = upload_image_handler(
            State(state),
            Path(9),
            Json(ImageBody {
                object_key: "chats/9/rx.jpg".to_string(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(message.content_type, "image");
        assert_eq!(message.content, "http://images.test/chats/9/rx.jpg");

        for _ in 0..100 {
            if chats.messages_for(9).unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let messages = chats.messages_for(9).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "تحلیل نسخه تصویری.");
    }

    #[tokio::test]
    async fn test_unknown_object_key_is_an_error() {
        let transport = Arc::new(MemoryTransport::new());
        let (state, _, _) = test_state(transport, "unused");

        let result = upload_image_handler(
            State(state),
            Path(9),
            Json(ImageBody {
                object_key: "missing.jpg".to_string(),
            }),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_disconnected_transport_falls_back_to_inline_analysis() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_connected(false);
        let (state, _, _) = test_state(transport, "پاسخ درون‌پردازه‌ای.");

        let Json(body) = analyze_prescription_handler(
            State(state),
            Json(AnalyzeBody {
                text: "نسخه: قرص متفورمین".to_string(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(body["status"], "success");
        assert_eq!(body["analysis"], "پاسخ درون‌پردازه‌ای.");
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let (state, _, _) = test_state(transport, "unused");

        let result = completion_handler(
            State(state),
            Json(CompletionBody {
                prompt: String::new(),
            }),
        )
        .await;
        assert!(matches!(result, Err(GatewayError::BadRequest(_))));
    }
}
