//! Relay server: wires the store, gateway, agent and chat processor behind
//! the webhook router.

use crate::agent::LlmAgent;
use crate::clock::{Clock, SystemClock};
use crate::config::RelayConfig;
use crate::db::{MessageStore, PgStore};
use crate::delivery::DeliverySettings;
use crate::routes;
use crate::worker::{ChatProcessor, ProcessorSettings};
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use wa_gateway::{ChatId, EvolutionClient, MessagingGateway};
use wa_llm::LlmClient;

/// How long shutdown waits for in-flight chat passes.
const PASS_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RelayState {
    pub store: Arc<dyn MessageStore>,
    pub processor: Arc<ChatProcessor>,
    pub clock: Arc<dyn Clock>,
    pub webhook_api_key: Option<String>,
    pub tasks: TaskTracker,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RelayConfig::load_with_path(config_path).await?;
    let gateway = build_gateway(&cfg)?;
    build_llm(&cfg)?;
    tracing::info!(
        model = %cfg.llm.model,
        instance = %gateway.instance(),
        max_concurrent_passes = cfg.max_concurrent_passes(),
        debounce_seconds = cfg.agent.debounce_seconds,
        config_path = ?path.as_ref().map(|p| p.display().to_string()),
        "config ok"
    );

    let store = PgStore::connect(&cfg.database.url, cfg.database.max_connections).await?;
    store.ping().await?;
    store.close().await;
    tracing::info!("database ok");
    Ok(())
}

pub async fn send_one_shot(config_path: Option<PathBuf>, chat: &str, message: &str) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let gateway = build_gateway(&cfg)?;
    let chat_id = ChatId::new(chat.trim());
    let sent = gateway.send_text(&chat_id, message).await?;
    tracing::info!(
        instance = %gateway.instance(),
        chat_id = %chat_id,
        gateway_message_id = ?sent.message_id,
        "one-shot message sent"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = RelayConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = ?cfg_path.as_ref().map(|p| p.display().to_string()),
        model = %cfg.llm.model,
        instance = %cfg.gateway.instance,
        debounce_seconds = cfg.agent.debounce_seconds,
        db_max_connections = cfg.database.max_connections,
        max_concurrent_passes = cfg.max_concurrent_passes(),
        webhook_auth = cfg.gateway.webhook_api_key.is_some(),
        "wa-relay starting"
    );
    let listener = preflight_bind_listener(addr).await?;

    let store = Arc::new(PgStore::connect(&cfg.database.url, cfg.database.max_connections).await?);
    store.ensure_schema().await?;
    tracing::info!("database schema ready");

    let gateway = Arc::new(build_gateway(&cfg)?);
    let agent = Arc::new(LlmAgent::new(
        build_llm(&cfg)?,
        store.clone(),
        cfg.agent.system_prompt.clone(),
        cfg.agent.history_limit,
    ));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let processor = Arc::new(ChatProcessor::new(
        store.clone(),
        gateway,
        agent,
        clock.clone(),
        ProcessorSettings {
            debounce: cfg.debounce(),
            mark_read: cfg.delivery.mark_read,
            max_concurrent_passes: cfg.max_concurrent_passes(),
        },
        DeliverySettings::from(&cfg.delivery),
    ));

    let tasks = TaskTracker::new();
    let state = Arc::new(RelayState {
        store: store.clone(),
        processor,
        clock,
        webhook_api_key: cfg
            .gateway
            .webhook_api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string),
        tasks: tasks.clone(),
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "wa-relay serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("http server shutdown completed");

    tasks.close();
    if !tasks.is_empty() {
        tracing::info!(in_flight = tasks.len(), "waiting for chat passes to finish");
    }
    match tokio::time::timeout(PASS_DRAIN_TIMEOUT, tasks.wait()).await {
        Ok(()) => tracing::info!("chat passes drained"),
        Err(_) => tracing::warn!(
            in_flight = tasks.len(),
            "chat passes still running at shutdown; their batches stay pending"
        ),
    }
    store.close().await;
    Ok(())
}

fn build_gateway(cfg: &RelayConfig) -> Result<EvolutionClient> {
    Ok(EvolutionClient::new(
        &cfg.gateway.api_url,
        &cfg.gateway.api_key,
        &cfg.gateway.instance,
    )?)
}

fn build_llm(cfg: &RelayConfig) -> Result<LlmClient> {
    Ok(
        LlmClient::new(&cfg.llm.base_url, &cfg.llm.api_key, &cfg.llm.model)?
            .with_temperature(Some(cfg.llm.temperature)),
    )
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
}
