//! In-memory bot handles.

use botfleet_daemon_protocol::Heartbeat;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::error::Result;
use crate::process::{LaunchSpec, ProcessHandle};

/// Lifecycle status of a bot, or the free-form status its agent last reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BotStatus {
    Stopped,
    Started,
    Restarting,
    Reported(String),
}

impl BotStatus {
    pub fn parse(value: &str) -> Self {
        match value {
            "Stopped" => BotStatus::Stopped,
            "Started" => BotStatus::Started,
            "Restarting" => BotStatus::Restarting,
            other => BotStatus::Reported(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BotStatus::Stopped => "Stopped",
            BotStatus::Started => "Started",
            BotStatus::Restarting => "Restarting",
            BotStatus::Reported(value) => value,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, BotStatus::Stopped)
    }
}

impl From<String> for BotStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Stopped" | "Started" | "Restarting" => BotStatus::parse(&value),
            _ => BotStatus::Reported(value),
        }
    }
}

impl From<BotStatus> for String {
    fn from(status: BotStatus) -> Self {
        match status {
            BotStatus::Reported(value) => value,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bot {
    /// Stable id; the decimal account id for bots tied to an account.
    pub id: String,
    /// Client login identity (email).
    pub email: String,
    /// In-game identity.
    pub username: String,
    pub script: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub status: BotStatus,
    /// 0 when not running.
    pub pid: u32,
}

impl Bot {
    pub fn new(
        id: impl Into<String>,
        email: impl Into<String>,
        username: impl Into<String>,
        script: impl Into<String>,
        params: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            username: username.into(),
            script: script.into(),
            params,
            status: BotStatus::Stopped,
            pid: 0,
        }
    }

    /// Bot for an agent first seen through a heartbeat. No process is attached.
    pub fn from_heartbeat(id: impl Into<String>, heartbeat: &Heartbeat) -> Self {
        Self {
            id: id.into(),
            email: heartbeat.email.clone(),
            username: heartbeat.username.clone(),
            script: String::new(),
            params: Vec::new(),
            status: BotStatus::parse(&heartbeat.status),
            pid: 0,
        }
    }

    /// Rebuilds a bot from a persisted session command (`script param...`).
    pub fn from_session(
        account_id: i64,
        email: impl Into<String>,
        username: impl Into<String>,
        command: &str,
        pid: u32,
    ) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        let script = parts.next().unwrap_or_default();
        Self {
            id: account_id.to_string(),
            email: email.into(),
            username: username.into(),
            script,
            params: parts.collect(),
            status: BotStatus::Started,
            pid,
        }
    }

    /// `script` and `params` joined by single spaces.
    pub fn command(&self) -> String {
        std::iter::once(self.script.as_str())
            .chain(self.params.iter().map(String::as_str))
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn account_id(&self) -> Option<i64> {
        self.id.parse().ok()
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            email: self.email.clone(),
            script: self.script.clone(),
            params: self.params.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.pid != 0 && !self.status.is_stopped()
    }

    pub fn start(&mut self, processes: &dyn ProcessHandle) -> Result<()> {
        if self.is_running() {
            debug!(bot_id = %self.id, pid = self.pid, "Bot already running; start skipped");
            return Ok(());
        }

        let pid = processes.start(&self.launch_spec())?;
        self.pid = pid;
        self.status = BotStatus::Started;
        Ok(())
    }

    pub fn stop(&mut self, processes: &dyn ProcessHandle) -> Result<()> {
        if self.pid != 0 {
            info!(
                bot_id = %self.id,
                email = %self.email,
                script = %self.script,
                pid = self.pid,
                "Stopping bot"
            );
            processes.stop(self.pid)?;
        }
        self.pid = 0;
        self.status = BotStatus::Stopped;
        Ok(())
    }

    pub fn restart(&mut self, processes: &dyn ProcessHandle) -> Result<()> {
        self.status = BotStatus::Restarting;
        if self.pid != 0 {
            processes.stop(self.pid)?;
            self.pid = 0;
        }
        self.start(processes)
    }
}
