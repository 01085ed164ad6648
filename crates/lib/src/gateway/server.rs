//! Gateway runner: Telegram startup, inbound processing, reload and graceful shutdown.

use crate::auth::{AuthorizationTable, ConfigLoader, TableHandle};
use crate::channels::{ChannelHandle, InboundMessage, TelegramChannel, TelegramError};
use crate::config::{self, Config};
use crate::dispatch::{Dispatcher, BOT_COMMANDS};
use crate::exec::Executor;
use crate::gateway::webhook::{self, WebhookState};
use crate::gateway::reload;
use anyhow::{bail, Context, Result};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Delay between attempts of a failed startup call to the Bot API.
const STARTUP_RETRY_INTERVAL: Duration = Duration::from_secs(30);

const INBOUND_QUEUE: usize = 64;

/// Handles queued inbound messages: dispatch, then reply through the channel.
#[derive(Clone)]
pub struct InboundProcessor {
    pub dispatcher: Arc<Dispatcher>,
    /// Where replies go.
    pub channel: Arc<dyn ChannelHandle>,
    /// Per-message tasks; awaited during graceful shutdown.
    pub tasks: TaskTracker,
}

impl InboundProcessor {
    pub fn new(dispatcher: Arc<Dispatcher>, channel: Arc<dyn ChannelHandle>) -> Self {
        Self {
            dispatcher,
            channel,
            tasks: TaskTracker::new(),
        }
    }

    /// Receive until every sender is gone, handling each message in its own tracked task.
    /// Messages already queued when intake stops are still handled.
    pub fn spawn(self, mut inbound_rx: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = inbound_rx.recv().await {
                self.tasks.spawn(process_inbound_message(self.clone(), msg));
            }
            log::debug!("inbound: queue closed, processor stopped");
        })
    }

    /// Wait for every spawned message task to finish.
    pub async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Options for [`run_gateway`] that do not come from the config file.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Reload the config file on SIGUSR1.
    pub reload_on_signal: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            reload_on_signal: true,
        }
    }
}

/// Process one inbound message: dispatch it and send the reply, if any.
async fn process_inbound_message(processor: InboundProcessor, msg: InboundMessage) {
    log::debug!(
        "inbound: sender {} chat {}: {:?}",
        msg.sender_id,
        msg.target.chat_id,
        msg.text
    );
    let Some(reply) = processor.dispatcher.dispatch(&msg).await else {
        return;
    };
    if let Err(e) = processor.channel.send_reply(&msg.target, &reply).await {
        log::warn!(
            "inbound: failed to send reply to sender {} for {:?}: {}",
            msg.sender_id,
            msg.text,
            e
        );
        return;
    }
    log::info!(
        "handled bot command from sender {} in chat {}: {:?}",
        msg.sender_id,
        msg.target.chat_id,
        msg.text
    );
}

/// Retry a Bot API call until it succeeds or fails in a way retrying cannot fix.
async fn retry_startup_call<T, F, Fut>(what: &str, mut call: F) -> Result<T, TelegramError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TelegramError>>,
{
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                log::warn!(
                    "telegram: {} failed, retrying in {}s: {}",
                    what,
                    STARTUP_RETRY_INTERVAL.as_secs(),
                    e
                );
                tokio::time::sleep(STARTUP_RETRY_INTERVAL).await;
            }
        }
    }
}

/// Run the bot until SIGINT/SIGTERM.
pub async fn run_gateway(config: Config, config_path: PathBuf, options: RunOptions) -> Result<()> {
    // SIGUSR1 would otherwise terminate the process, including during the startup retries.
    let (reload_tx, reload_rx) = mpsc::channel(1);
    reload::forward_reload_signal(options.reload_on_signal.then_some(reload_tx))?;

    let table = AuthorizationTable::from_config(&config)
        .with_context(|| format!("validating config {}", config_path.display()))?;
    log::info!(
        "loaded {} user(s), {} command(s) from {}",
        table.user_count(),
        table.command_count(),
        config_path.display()
    );
    let table = TableHandle::new(table);
    tokio::spawn(reload::run_reload_loop(
        ConfigLoader::new(&config_path),
        table.clone(),
        reload_rx,
    ));

    let Some(token) = config::resolve_telegram_token(&config) else {
        bail!("telegram bot token not set (config \"token\" or TELEGRAM_BOT_TOKEN)");
    };
    let webhook_config = &config.webhook;
    if webhook_config.enabled && webhook_config.url.trim().is_empty() {
        bail!("webhook is enabled but webhook.url is empty");
    }

    let telegram = Arc::new(TelegramChannel::new(token, Some(config.url.as_str())));
    let me = retry_startup_call("getMe", || telegram.get_me())
        .await
        .context("fetching bot identity")?;
    let bot_username = me.username.clone().unwrap_or_default();
    log::info!("telegram: authorized as @{} ({})", bot_username, me.id);
    retry_startup_call("setMyCommands", || telegram.set_my_commands(BOT_COMMANDS))
        .await
        .context("publishing bot commands")?;

    let dispatcher = Arc::new(Dispatcher::new(table, Executor::new(), bot_username));
    let processor = InboundProcessor::new(dispatcher, telegram.clone());
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let processor_task = processor.clone().spawn(inbound_rx);

    if webhook_config.enabled {
        let secret = Some(webhook_config.secret_token.clone()).filter(|s| !s.is_empty());
        retry_startup_call("setWebhook", || {
            telegram.set_webhook(&webhook_config.url, secret.as_deref())
        })
        .await
        .context("registering webhook")?;
        log::info!("telegram: webhook registered: {}", webhook_config.url);

        let state = WebhookState::new(inbound_tx, secret);
        webhook::bind_and_serve(webhook_config, state, shutdown_signal()).await?;
    } else {
        retry_startup_call("deleteWebhook", || telegram.delete_webhook())
            .await
            .context("removing webhook")?;
        let poller = telegram.clone().start_inbound(inbound_tx);
        shutdown_signal().await;
        telegram.stop();
        let _ = poller.await;
    }

    // Intake has stopped and every sender is dropped; the processor drains what is queued.
    log::info!("shutdown signal received, handling queued messages");
    let _ = processor_task.await;
    log::info!("interrupting running commands");
    processor.dispatcher.executor().shutdown();
    processor.wait().await;
    log::info!("in-flight commands finished");

    if webhook_config.enabled {
        if let Err(e) = telegram.delete_webhook().await {
            log::debug!("telegram delete_webhook on shutdown: {}", e);
        }
    }
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn api_error(code: u16) -> TelegramError {
        TelegramError::Api {
            method: "getMe",
            status: StatusCode::from_u16(code).unwrap(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = retry_startup_call("getMe", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(api_error(401)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let calls = AtomicUsize::new(0);
        let result = retry_startup_call("getMe", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(api_error(502))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
