//! Authorization table: sender id -> ordered list of commands the sender may run.
//!
//! A table is built from config in one go and never changed afterwards. Reloading builds a
//! new table and swaps it in; readers load the current `Arc` without locking.

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{self, CommandConfig, Config};
use crate::exec::Slot;

/// A command a sender may run, plus its execution slot.
#[derive(Debug)]
pub struct AuthorizedCommand {
    pub name: String,
    pub args: Vec<String>,
    pub exec_timeout: Duration,
    pub exit_timeout: Duration,
    slot: Slot,
}

impl AuthorizedCommand {
    /// Build from config, substituting default timeouts for absent or zero values.
    pub fn from_config(c: &CommandConfig) -> Self {
        Self {
            name: c.name.clone(),
            args: c.args.clone(),
            exec_timeout: c.exec_timeout(),
            exit_timeout: c.exit_timeout(),
            slot: Slot::default(),
        }
    }

    pub fn slot(&self) -> &Slot {
        &self.slot
    }
}

/// Immutable snapshot of who may run what. The position in a sender's list is the index
/// used by `/exec <i>` and `/cancel <i>`.
#[derive(Debug, Default)]
pub struct AuthorizationTable {
    users: HashMap<i64, Vec<Arc<AuthorizedCommand>>>,
}

impl AuthorizationTable {
    /// Build a table from config. Fails as a whole on an empty command name or a sender id
    /// listed twice.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut users = HashMap::with_capacity(config.users.len());
        for user in &config.users {
            let mut commands = Vec::with_capacity(user.commands.len());
            for (i, c) in user.commands.iter().enumerate() {
                if c.name.trim().is_empty() {
                    bail!("user {}: command {} has an empty name", user.id, i);
                }
                commands.push(Arc::new(AuthorizedCommand::from_config(c)));
            }
            if users.insert(user.id, commands).is_some() {
                bail!("user {} is listed more than once", user.id);
            }
        }
        Ok(Self { users })
    }

    /// Commands for the sender; empty when the sender is unknown.
    pub fn commands(&self, sender_id: i64) -> &[Arc<AuthorizedCommand>] {
        self.users.get(&sender_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn command_count(&self) -> usize {
        self.users.values().map(Vec::len).sum()
    }
}

/// Published reference to the current table. Cloning shares the same cell.
#[derive(Debug, Clone)]
pub struct TableHandle {
    inner: Arc<ArcSwap<AuthorizationTable>>,
}

impl TableHandle {
    pub fn new(table: AuthorizationTable) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(table)),
        }
    }

    /// Current table. Holding the returned `Arc` keeps that snapshot alive across reloads.
    pub fn load(&self) -> Arc<AuthorizationTable> {
        self.inner.load_full()
    }

    /// Replace the current table.
    pub fn publish(&self, table: AuthorizationTable) {
        self.inner.store(Arc::new(table));
    }
}

/// Builds tables from a config file path.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read, parse and validate the config file into a new table.
    pub fn load(&self) -> Result<AuthorizationTable> {
        let config = config::load_config(&self.path)?;
        AuthorizationTable::from_config(&config)
            .with_context(|| format!("validating config {}", self.path.display()))
    }

    /// Load and publish. On failure the published table is left as it was.
    pub fn reload(&self, handle: &TableHandle) -> Result<()> {
        let table = self.load()?;
        log::info!(
            "reload: published {} user(s), {} command(s) from {}",
            table.user_count(),
            table.command_count(),
            self.path.display()
        );
        handle.publish(table);
        Ok(())
    }
}
