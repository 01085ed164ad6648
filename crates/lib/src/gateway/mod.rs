//! Gateway: connects the Telegram channel to the dispatcher.
//!
//! Updates arrive by long polling or on the webhook listener; each one is handled in its own
//! tracked task. SIGUSR1 reloads the authorization table; SIGINT/SIGTERM shut down after
//! queued messages are handled and in-flight executions have been interrupted and finished.

mod reload;
mod server;
mod webhook;

pub use reload::{forward_reload_signal, run_reload_loop};
pub use server::{run_gateway, InboundProcessor, RunOptions};
#[cfg(unix)]
pub use webhook::serve_webhook_unix;
pub use webhook::{bind_and_serve, serve_webhook, webhook_router, WebhookState};
