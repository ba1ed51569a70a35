//! Fleet state owned by the daemon.
//!
//! One `FleetState` is built at startup and shared (behind an `Arc`) by every
//! connection thread and the liveness monitor. It wires the registry, ledger,
//! reconciler and monitor to one set of stores and one process handle.

use botfleet_daemon_protocol::{ActivityQuery, Heartbeat, LevelSnapshot};
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

use crate::bot::Bot;
use crate::db::Db;
use crate::error::{FleetError, Result};
use crate::heartbeat::{HeartbeatOutcome, HeartbeatReconciler};
use crate::ledger::ActivitySessionLedger;
use crate::monitor::{LivenessMonitor, MonitorSnapshot};
use crate::process::ProcessHandle;
use crate::registry::BotRegistry;
use crate::store::{Account, AccountStore, ActivitySession, ActivitySessionStore, ActivityXp};

#[derive(Debug, Clone, Serialize)]
pub struct FleetHealth {
    pub registered_bots: usize,
    pub tracked_senders: usize,
    pub monitor: MonitorSnapshot,
}

pub struct FleetState {
    accounts: Arc<dyn AccountStore>,
    sessions: Arc<dyn ActivitySessionStore>,
    registry: Arc<BotRegistry>,
    ledger: Arc<ActivitySessionLedger>,
    heartbeats: HeartbeatReconciler,
    monitor: Arc<LivenessMonitor>,
}

impl FleetState {
    pub fn new(
        db: Arc<Db>,
        processes: Arc<dyn ProcessHandle>,
        monitor_interval: Duration,
    ) -> Self {
        let accounts: Arc<dyn AccountStore> = db.clone();
        Self::with_stores(accounts, db, processes, monitor_interval)
    }

    pub fn with_stores(
        accounts: Arc<dyn AccountStore>,
        sessions: Arc<dyn ActivitySessionStore>,
        processes: Arc<dyn ProcessHandle>,
        monitor_interval: Duration,
    ) -> Self {
        let registry = Arc::new(BotRegistry::new(processes));
        let ledger = Arc::new(ActivitySessionLedger::new(Arc::clone(&sessions)));
        let heartbeats = HeartbeatReconciler::new(
            Arc::clone(&registry),
            Arc::clone(&accounts),
            Arc::clone(&ledger),
        );
        let monitor = Arc::new(LivenessMonitor::new(
            Arc::clone(&sessions),
            Arc::clone(&registry),
            Arc::clone(&ledger),
            monitor_interval,
        ));

        Self {
            accounts,
            sessions,
            registry,
            ledger,
            heartbeats,
            monitor,
        }
    }

    pub fn spawn_monitor(&self) -> Result<JoinHandle<()>> {
        Arc::clone(&self.monitor).spawn()
    }

    pub fn stop_monitor(&self) {
        self.monitor.stop();
    }

    /// Registers a bot for the account, starts its client and opens a session.
    pub fn register_and_start(
        &self,
        account_id: i64,
        script: &str,
        params: Vec<String>,
    ) -> Result<Bot> {
        let account = self
            .accounts
            .get_account(account_id)?
            .ok_or_else(|| FleetError::not_found("account", account_id))?;

        if self.ledger.active_session_id(account_id)?.is_some() {
            return Err(FleetError::AlreadyActive(account_id.to_string()));
        }

        let bot_id = account_id.to_string();
        match self.registry.find(&bot_id) {
            Some(existing) if existing.is_running() => {
                return Err(FleetError::AlreadyActive(bot_id));
            }
            // Heartbeat-only entry with no process; replaced by the launched bot.
            Some(_) => {
                self.registry.evict_dead(&bot_id, 0);
            }
            None => {}
        }

        self.registry.add(Bot::new(
            bot_id.clone(),
            account.email,
            account.username,
            script,
            params,
        ))?;

        let bot = match self.registry.start(&bot_id) {
            Ok(bot) => bot,
            Err(err) => {
                self.registry.evict_dead(&bot_id, 0);
                return Err(err);
            }
        };

        // A heartbeat may have adopted a session since the check above; the
        // update-else-insert write keeps that row instead of opening a second.
        if let Err(err) = self
            .ledger
            .record_or_update(account_id, &bot.command(), bot.pid)
        {
            warn!(
                account_id,
                pid = bot.pid,
                error = %err,
                "Failed to record session for started bot"
            );
            return Err(err);
        }

        info!(account_id, pid = bot.pid, command = %bot.command(), "Bot started");
        Ok(bot)
    }

    /// Stops and forgets the bot, closing its account's session. `false` when
    /// no bot with that id is registered.
    pub fn stop(&self, bot_id: &str) -> Result<bool> {
        let Some(bot) = self.registry.find(bot_id) else {
            return Ok(false);
        };
        if !self.registry.remove(bot_id) {
            return Ok(false);
        }

        if let Some(account_id) = bot.account_id() {
            self.ledger.close_latest_open(account_id)?;
        }
        info!(bot_id = %bot_id, email = %bot.email, "Bot stopped");
        Ok(true)
    }

    pub fn restart(&self, bot_id: &str) -> Result<Bot> {
        let existing = self
            .registry
            .find(bot_id)
            .ok_or_else(|| FleetError::not_found("bot", bot_id))?;
        if existing.script.is_empty() {
            return Err(FleetError::Validation(format!(
                "bot {} has no script to restart",
                bot_id
            )));
        }

        let bot = self.registry.restart(bot_id)?;
        if let Some(account_id) = bot.account_id() {
            self.ledger
                .record_or_update(account_id, &bot.command(), bot.pid)?;
        }
        info!(bot_id = %bot_id, pid = bot.pid, "Bot restarted");
        Ok(bot)
    }

    pub fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<HeartbeatOutcome> {
        self.heartbeats.handle(heartbeat)
    }

    pub fn list_active(&self) -> Result<Vec<Bot>> {
        self.sessions.list_active_bots()
    }

    pub fn list_inactive(&self) -> Result<Vec<Bot>> {
        self.sessions.list_inactive_bots()
    }

    pub fn activity(&self, query: &ActivityQuery) -> Result<Vec<ActivitySession>> {
        self.sessions
            .list_sessions(query.account_id, query.effective_limit())
    }

    pub fn activity_xp(&self, activity_id: i64) -> Result<Vec<ActivityXp>> {
        self.sessions.list_xp(activity_id)
    }

    pub fn bots(&self) -> Vec<Bot> {
        self.registry.list()
    }

    pub fn bot(&self, bot_id: &str) -> Result<Bot> {
        self.registry
            .find(bot_id)
            .ok_or_else(|| FleetError::not_found("bot", bot_id))
    }

    pub fn accounts(&self) -> Result<Vec<Account>> {
        self.accounts.list_accounts()
    }

    pub fn account(&self, account_id: i64) -> Result<Account> {
        self.accounts
            .get_account(account_id)?
            .ok_or_else(|| FleetError::not_found("account", account_id))
    }

    pub fn levels(&self, account_id: i64) -> Result<LevelSnapshot> {
        self.accounts
            .get_levels(account_id)?
            .ok_or_else(|| FleetError::not_found("levels", account_id))
    }

    pub fn health(&self) -> FleetHealth {
        FleetHealth {
            registered_bots: self.registry.len(),
            tracked_senders: self.heartbeats.tracked_senders(),
            monitor: self.monitor.snapshot(),
        }
    }
}
