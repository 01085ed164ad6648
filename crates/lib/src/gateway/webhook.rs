//! Webhook listener: Telegram POSTs updates here when webhook mode is enabled.
//!
//! The listener binds a TCP address or, with `listenNetwork: "unix"`, a unix domain socket
//! whose owner, group and mode can be set from config.

use crate::channels::{InboundMessage, TelegramUpdate};
use crate::config::WebhookConfig;
use anyhow::{bail, Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::future::Future;
use tokio::sync::mpsc;

const SECRET_TOKEN_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";

/// State shared by webhook requests. Dropping every clone closes the inbound queue.
#[derive(Clone)]
pub struct WebhookState {
    pub inbound_tx: mpsc::Sender<InboundMessage>,
    /// Expected X-Telegram-Bot-Api-Secret-Token; None accepts any request.
    pub webhook_secret: Option<String>,
}

impl WebhookState {
    pub fn new(inbound_tx: mpsc::Sender<InboundMessage>, webhook_secret: Option<String>) -> Self {
        Self {
            inbound_tx,
            webhook_secret: webhook_secret.filter(|s| !s.is_empty()),
        }
    }
}

/// Router for the webhook listener. Updates are accepted on any path; `/health` answers probes.
pub fn webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/health", get(health_http))
        .fallback(telegram_webhook)
        .with_state(state)
}

/// Serve the webhook on a TCP listener until `shutdown` completes, then drain open connections.
pub async fn serve_webhook<F>(
    listener: tokio::net::TcpListener,
    state: WebhookState,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, webhook_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("webhook server exited")
}

/// Serve the webhook on a unix domain socket until `shutdown` completes.
#[cfg(unix)]
pub async fn serve_webhook_unix<F>(
    listener: tokio::net::UnixListener,
    state: WebhookState,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, webhook_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("webhook server exited")
}

/// Bind the listener described by `config` and serve until `shutdown` completes. A unix
/// socket file is removed again once the server has stopped.
pub async fn bind_and_serve<F>(config: &WebhookConfig, state: WebhookState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    match config.listen_network.as_str() {
        "" | "tcp" | "tcp4" | "tcp6" => {
            let listener = tokio::net::TcpListener::bind(&config.listen_address)
                .await
                .with_context(|| format!("binding to {}", config.listen_address))?;
            log::info!("webhook listening on tcp {}", config.listen_address);
            serve_webhook(listener, state, shutdown).await
        }
        #[cfg(unix)]
        "unix" => {
            let path = std::path::Path::new(&config.listen_address);
            let listener = unix_socket::bind(path, config)?;
            log::info!("webhook listening on unix socket {}", path.display());
            let result = serve_webhook_unix(listener, state, shutdown).await;
            if let Err(e) = std::fs::remove_file(path) {
                log::debug!("webhook: removing socket {}: {}", path.display(), e);
            }
            result
        }
        other => bail!("unsupported webhook listenNetwork {:?}", other),
    }
}

#[cfg(unix)]
mod unix_socket {
    use crate::config::{IdOrName, WebhookConfig};
    use anyhow::{Context, Result};
    use nix::unistd::{chown, Gid, Group, Uid, User};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    pub fn bind(path: &Path, config: &WebhookConfig) -> Result<tokio::net::UnixListener> {
        let listener = tokio::net::UnixListener::bind(path)
            .with_context(|| format!("binding unix socket {}", path.display()))?;
        if let Err(e) = configure(path, config) {
            let _ = std::fs::remove_file(path);
            return Err(e.context(format!("configuring unix socket {}", path.display())));
        }
        Ok(listener)
    }

    fn configure(path: &Path, config: &WebhookConfig) -> Result<()> {
        if config.listen_owner.is_some() || config.listen_group.is_some() {
            let uid = config.listen_owner.as_ref().map(resolve_uid).transpose()?;
            let gid = config.listen_group.as_ref().map(resolve_gid).transpose()?;
            chown(path, uid.map(Uid::from_raw), gid.map(Gid::from_raw))
                .with_context(|| format!("changing ownership to uid={:?} gid={:?}", uid, gid))?;
        }
        if let Some(mode) = config.listen_mode.filter(|m| *m != 0) {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .with_context(|| format!("changing mode to {:04o}", mode))?;
        }
        Ok(())
    }

    fn resolve_uid(owner: &IdOrName) -> Result<u32> {
        match owner {
            IdOrName::Id(id) => Ok(*id),
            IdOrName::Name(name) => User::from_name(name)
                .with_context(|| format!("looking up user {:?}", name))?
                .map(|u| u.uid.as_raw())
                .with_context(|| format!("user {:?} not found", name)),
        }
    }

    fn resolve_gid(group: &IdOrName) -> Result<u32> {
        match group {
            IdOrName::Id(id) => Ok(*id),
            IdOrName::Name(name) => Group::from_name(name)
                .with_context(|| format!("looking up group {:?}", name))?
                .map(|g| g.gid.as_raw())
                .with_context(|| format!("group {:?} not found", name)),
        }
    }
}

/// Receives Telegram update JSON; verifies the optional secret and queues the message.
async fn telegram_webhook(
    State(state): State<WebhookState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if method != Method::POST {
        return StatusCode::METHOD_NOT_ALLOWED;
    }
    if let Some(ref expected) = state.webhook_secret {
        let provided = headers
            .get(SECRET_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != expected.as_str() {
            log::debug!("webhook: rejected request with bad secret token");
            return StatusCode::FORBIDDEN;
        }
    }
    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(e) => {
            log::debug!("webhook: bad update body: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };
    let Some(inbound) = update.into_inbound() else {
        return StatusCode::OK;
    };
    if state.inbound_tx.send(inbound).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

/// GET /health returns a simple JSON status (for probes).
async fn health_http() -> Json<serde_json::Value> {
    Json(json!({ "runtime": "running" }))
}
