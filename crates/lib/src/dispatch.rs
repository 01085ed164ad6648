//! Dispatcher: route `/start`, `/list`, `/exec <i>` and `/cancel <i>` for a sender.

use std::sync::Arc;

use crate::auth::{AuthorizedCommand, TableHandle};
use crate::channels::{BotCommandInfo, InboundMessage, Reply};
use crate::command::ParsedCommand;
use crate::config::format_duration;
use crate::escape::escape_code_block;
use crate::exec::{CancelOutcome, ExecOutcome, Executor};

/// Commands advertised to Telegram clients via setMyCommands.
pub const BOT_COMMANDS: &[BotCommandInfo] = &[
    BotCommandInfo {
        command: "start",
        description: "Get started with the bot",
    },
    BotCommandInfo {
        command: "list",
        description: "List commands authorized for you to request execution",
    },
    BotCommandInfo {
        command: "exec",
        description: "Execute an authorized command at the specified index",
    },
    BotCommandInfo {
        command: "cancel",
        description: "Cancel a running command at the specified index",
    },
];

const START_TEXT: &str = "This bot allows you to execute commands on the host it is running on\\.
You can only execute commands authorized for your account in the configuration\\.

\\- To see the list of commands you can execute, use `/list`\\.
\\- To execute a command, use `/exec <index>`\\.
";

const NOT_AUTHORIZED_TEXT: &str = "You are not authorized to execute any commands.";
const INVALID_INDEX_TEXT: &str = "Invalid command index.";
const INDEX_OUT_OF_RANGE_TEXT: &str = "Index out of range\\. Use `/list` to see the list of commands\\.";
const SHUTTING_DOWN_TEXT: &str = "The bot is shutting down. Try again later.";

/// Resolves commands against the published authorization table and drives the executor.
pub struct Dispatcher {
    table: TableHandle,
    executor: Executor,
    bot_username: String,
}

impl Dispatcher {
    /// `bot_username` is compared against the `@target` of addressed commands.
    pub fn new(table: TableHandle, executor: Executor, bot_username: impl Into<String>) -> Self {
        Self {
            table,
            executor,
            bot_username: bot_username.into(),
        }
    }

    pub fn table(&self) -> &TableHandle {
        &self.table
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Handle one message. Returns the reply to send, or None when the message is not a
    /// command for this bot.
    pub async fn dispatch(&self, msg: &InboundMessage) -> Option<Reply> {
        let cmd = ParsedCommand::parse(&msg.text);
        if !cmd.target_suffix.is_empty() && !cmd.target_suffix.eq_ignore_ascii_case(&self.bot_username) {
            return None;
        }
        match cmd.name {
            "start" => return Some(Reply::markdown(START_TEXT)),
            "list" | "exec" | "cancel" => {}
            _ => return None,
        }

        let table = self.table.load();
        let commands = table.commands(msg.sender_id);
        if commands.is_empty() {
            log::info!(
                "dispatch: sender {} ({}) has no authorized commands",
                msg.sender_id,
                msg.sender_username.as_deref().unwrap_or("-")
            );
            return Some(Reply::plain(NOT_AUTHORIZED_TEXT));
        }
        if cmd.name == "list" {
            return Some(Reply::markdown(render_list(commands)));
        }

        let index = match parse_index(cmd.argument, commands.len()) {
            Ok(i) => i,
            Err(reply) => return Some(reply),
        };
        let command = Arc::clone(&commands[index]);
        drop(table);

        if cmd.name == "exec" {
            Some(self.exec(msg, index, command).await)
        } else {
            Some(self.cancel(msg, index, &command))
        }
    }

    async fn exec(&self, msg: &InboundMessage, index: usize, command: Arc<AuthorizedCommand>) -> Reply {
        log::info!(
            "exec: sender {} running [{}] {} {:?}",
            msg.sender_id,
            index,
            command.name,
            command.args
        );
        match self.executor.execute(Arc::clone(&command)).await {
            ExecOutcome::AlreadyRunning => Reply::markdown(format!(
                "The command is already running\\. Use `/cancel {}` to cancel it\\.",
                index
            )),
            ExecOutcome::ShuttingDown => Reply::plain(SHUTTING_DOWN_TEXT),
            ExecOutcome::Finished { reply, error } => {
                match error {
                    Some(e) => log::warn!(
                        "exec: sender {} command [{}] {} failed: {}",
                        msg.sender_id,
                        index,
                        command.name,
                        e
                    ),
                    None => log::info!(
                        "exec: sender {} command [{}] {} finished",
                        msg.sender_id,
                        index,
                        command.name
                    ),
                }
                Reply::markdown(reply)
            }
        }
    }

    fn cancel(&self, msg: &InboundMessage, index: usize, command: &AuthorizedCommand) -> Reply {
        match self.executor.cancel(command) {
            CancelOutcome::NotRunning => Reply::markdown(format!(
                "The command is not running\\. Use `/exec {}` to execute it\\.",
                index
            )),
            CancelOutcome::Requested => {
                log::info!(
                    "exec: sender {} canceled [{}] {}",
                    msg.sender_id,
                    index,
                    command.name
                );
                Reply::plain(format!(
                    "The command has been canceled. You may need to wait up to {} for it to be killed.",
                    format_duration(command.exit_timeout)
                ))
            }
        }
    }
}

/// Indexes are plain decimal digits; signs and whitespace are rejected.
fn parse_index(argument: &str, len: usize) -> Result<usize, Reply> {
    if argument.is_empty() || !argument.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Reply::plain(INVALID_INDEX_TEXT));
    }
    let index: usize = argument
        .parse()
        .map_err(|_| Reply::plain(INVALID_INDEX_TEXT))?;
    if index >= len {
        return Err(Reply::markdown(INDEX_OUT_OF_RANGE_TEXT));
    }
    Ok(index)
}

/// One line per command: `\[i\] ` followed by the command line as a code span.
fn render_list(commands: &[Arc<AuthorizedCommand>]) -> String {
    let mut out = String::new();
    for (i, command) in commands.iter().enumerate() {
        out.push_str(&format!("\\[{}\\] `", i));
        push_quoted_arg(&mut out, &command.name);
        for arg in &command.args {
            out.push(' ');
            push_quoted_arg(&mut out, arg);
        }
        out.push_str("`\n");
    }
    out
}

fn push_quoted_arg(out: &mut String, arg: &str) {
    let quote = arg.contains(' ');
    if quote {
        out.push('\'');
    }
    out.push_str(&escape_code_block(arg));
    if quote {
        out.push('\'');
    }
}
