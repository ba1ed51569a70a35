//! IPC protocol types and validation for botfleet-daemon.
//!
//! This crate is shared by the daemon and its clients (agents pushing
//! heartbeats, `fleetctl`) to prevent schema drift. The daemon remains the
//! authority on validation; payloads that fail here never reach the fleet core.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const DEFAULT_ACTIVITY_LIMIT: usize = 100;
pub const MAX_ACTIVITY_LIMIT: usize = 1000;

const MAX_EMAIL_LEN: usize = 254;
const MAX_STATUS_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Heartbeat,
    StartBot,
    StopBot,
    RestartBot,
    GetBots,
    GetBot,
    GetActiveBots,
    GetInactiveBots,
    GetActivity,
    GetActivityXp,
    GetAccounts,
    GetAccount,
    GetLevels,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Skill levels reported by an agent. Stored wholesale; the latest write wins.
///
/// Field order matches the `levels` table column order and [`LevelSnapshot::SKILLS`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelSnapshot {
    pub attack: i64,
    pub strength: i64,
    pub defence: i64,
    pub ranged: i64,
    pub magic: i64,
    pub prayer: i64,
    pub runecrafting: i64,
    pub hitpoints: i64,
    pub agility: i64,
    pub herblore: i64,
    pub thieving: i64,
    pub crafting: i64,
    pub fletching: i64,
    pub slayer: i64,
    pub hunter: i64,
    pub mining: i64,
    pub smithing: i64,
    pub fishing: i64,
    pub cooking: i64,
    pub firemaking: i64,
    pub woodcutting: i64,
    pub farming: i64,
}

impl LevelSnapshot {
    pub const SKILL_COUNT: usize = 22;

    pub const SKILLS: [&'static str; Self::SKILL_COUNT] = [
        "attack",
        "strength",
        "defence",
        "ranged",
        "magic",
        "prayer",
        "runecrafting",
        "hitpoints",
        "agility",
        "herblore",
        "thieving",
        "crafting",
        "fletching",
        "slayer",
        "hunter",
        "mining",
        "smithing",
        "fishing",
        "cooking",
        "firemaking",
        "woodcutting",
        "farming",
    ];

    pub fn values(&self) -> [i64; Self::SKILL_COUNT] {
        [
            self.attack,
            self.strength,
            self.defence,
            self.ranged,
            self.magic,
            self.prayer,
            self.runecrafting,
            self.hitpoints,
            self.agility,
            self.herblore,
            self.thieving,
            self.crafting,
            self.fletching,
            self.slayer,
            self.hunter,
            self.mining,
            self.smithing,
            self.fishing,
            self.cooking,
            self.firemaking,
            self.woodcutting,
            self.farming,
        ]
    }

    pub fn from_values(values: [i64; Self::SKILL_COUNT]) -> Self {
        let [
            attack,
            strength,
            defence,
            ranged,
            magic,
            prayer,
            runecrafting,
            hitpoints,
            agility,
            herblore,
            thieving,
            crafting,
            fletching,
            slayer,
            hunter,
            mining,
            smithing,
            fishing,
            cooking,
            firemaking,
            woodcutting,
            farming,
        ] = values;
        Self {
            attack,
            strength,
            defence,
            ranged,
            magic,
            prayer,
            runecrafting,
            hitpoints,
            agility,
            herblore,
            thieving,
            crafting,
            fletching,
            slayer,
            hunter,
            mining,
            smithing,
            fishing,
            cooking,
            firemaking,
            woodcutting,
            farming,
        }
    }
}

/// Periodic status report pushed by a running agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Agent login identity; the correlation key for heartbeats.
    pub email: String,
    pub status: String,
    /// In-game identity.
    #[serde(default)]
    pub username: String,
    #[serde(default, alias = "levels")]
    pub stats: LevelSnapshot,
    #[serde(default)]
    pub pid: u32,
    /// Cumulative XP gained this session, per skill. Partial maps are fine.
    #[serde(default)]
    pub gained_xp: BTreeMap<String, i64>,
}

impl Heartbeat {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_text(&self.email, "email")?;
        if self.email.len() > MAX_EMAIL_LEN {
            return Err(ErrorInfo::new(
                "invalid_email",
                format!("email must be {} characters or fewer", MAX_EMAIL_LEN),
            ));
        }
        require_text(&self.status, "status")?;
        if self.status.len() > MAX_STATUS_LEN {
            return Err(ErrorInfo::new(
                "invalid_status",
                format!("status must be {} characters or fewer", MAX_STATUS_LEN),
            ));
        }
        for (skill, xp) in &self.gained_xp {
            if skill.trim().is_empty() {
                return Err(ErrorInfo::new(
                    "invalid_gained_xp",
                    "gained_xp keys must be skill names",
                ));
            }
            if *xp < 0 {
                return Err(ErrorInfo::new(
                    "invalid_gained_xp",
                    format!("gained_xp for {} must not be negative", skill),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartBotParams {
    pub account_id: i64,
    pub script: String,
    #[serde(default)]
    pub params: Vec<String>,
}

impl StartBotParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_account_id(self.account_id)?;
        require_text(&self.script, "script")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BotIdParams {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountIdParams {
    pub account_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivityXpParams {
    pub activity_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivityQuery {
    #[serde(default)]
    pub account_id: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ActivityQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
            .min(MAX_ACTIVITY_LIMIT)
    }
}

pub fn parse_heartbeat(params: Value) -> Result<Heartbeat, ErrorInfo> {
    let heartbeat: Heartbeat = decode(params, "heartbeat")?;
    heartbeat.validate()?;
    Ok(heartbeat)
}

pub fn parse_start_bot(params: Option<Value>) -> Result<StartBotParams, ErrorInfo> {
    let parsed: StartBotParams = decode(require_params(params)?, "start_bot")?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_bot_id(params: Option<Value>) -> Result<BotIdParams, ErrorInfo> {
    let parsed: BotIdParams = decode(require_params(params)?, "bot id")?;
    require_text(&parsed.id, "id")?;
    Ok(parsed)
}

pub fn parse_account_id(params: Option<Value>) -> Result<AccountIdParams, ErrorInfo> {
    let parsed: AccountIdParams = decode(require_params(params)?, "account id")?;
    require_account_id(parsed.account_id)?;
    Ok(parsed)
}

pub fn parse_activity_xp(params: Option<Value>) -> Result<ActivityXpParams, ErrorInfo> {
    let parsed: ActivityXpParams = decode(require_params(params)?, "activity id")?;
    if parsed.activity_id <= 0 {
        return Err(ErrorInfo::new(
            "invalid_params",
            "activity_id must be positive",
        ));
    }
    Ok(parsed)
}

/// Activity params are optional; `None` means "all accounts, default limit".
pub fn parse_activity_query(params: Option<Value>) -> Result<ActivityQuery, ErrorInfo> {
    let query: ActivityQuery = match params {
        Some(Value::Null) | None => return Ok(ActivityQuery::default()),
        Some(value) => decode(value, "activity query")?,
    };
    if let Some(account_id) = query.account_id {
        require_account_id(account_id)?;
    }
    Ok(query)
}

fn decode<T: DeserializeOwned>(params: Value, label: &str) -> Result<T, ErrorInfo> {
    if !params.is_object() {
        return Err(ErrorInfo::new("invalid_params", "params must be an object"));
    }
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("{} payload is invalid: {}", label, err),
        )
    })
}

fn require_params(params: Option<Value>) -> Result<Value, ErrorInfo> {
    params.ok_or_else(|| ErrorInfo::new("invalid_params", "params are required"))
}

fn require_text(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

fn require_account_id(account_id: i64) -> Result<(), ErrorInfo> {
    if account_id <= 0 {
        return Err(ErrorInfo::new(
            "invalid_account_id",
            "account_id must be positive",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_heartbeat() -> Heartbeat {
        Heartbeat {
            email: "bot@example.com".to_string(),
            status: "Chopping".to_string(),
            username: "Lumberjack".to_string(),
            stats: LevelSnapshot::default(),
            pid: 4242,
            gained_xp: BTreeMap::new(),
        }
    }

    #[test]
    fn validates_heartbeat() {
        assert!(base_heartbeat().validate().is_ok());
    }

    #[test]
    fn rejects_heartbeat_without_email() {
        let mut heartbeat = base_heartbeat();
        heartbeat.email = "  ".to_string();
        let err = heartbeat.validate().expect_err("empty email");
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn rejects_heartbeat_without_status() {
        let mut heartbeat = base_heartbeat();
        heartbeat.status = String::new();
        assert!(heartbeat.validate().is_err());
    }

    #[test]
    fn rejects_negative_xp() {
        let mut heartbeat = base_heartbeat();
        heartbeat.gained_xp.insert("Woodcutting".to_string(), -5);
        let err = heartbeat.validate().expect_err("negative xp");
        assert_eq!(err.code, "invalid_gained_xp");
    }

    #[test]
    fn heartbeat_accepts_levels_alias_and_partial_stats() {
        let heartbeat = parse_heartbeat(json!({
            "email": "bot@example.com",
            "status": "Chopping",
            "levels": { "woodcutting": 41, "firemaking": 12 },
            "gained_xp": { "Woodcutting": 50 }
        }))
        .expect("parse heartbeat");

        assert_eq!(heartbeat.stats.woodcutting, 41);
        assert_eq!(heartbeat.stats.firemaking, 12);
        assert_eq!(heartbeat.stats.attack, 0);
        assert_eq!(heartbeat.pid, 0);
        assert_eq!(heartbeat.gained_xp.get("Woodcutting"), Some(&50));
    }

    #[test]
    fn heartbeat_rejects_non_object_params() {
        let err = parse_heartbeat(json!(["bot@example.com"])).expect_err("array params");
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn level_values_follow_skill_order() {
        let snapshot = LevelSnapshot {
            attack: 1,
            farming: 22,
            ..LevelSnapshot::default()
        };
        let values = snapshot.values();
        assert_eq!(values[0], 1);
        assert_eq!(values[LevelSnapshot::SKILL_COUNT - 1], 22);
        assert_eq!(LevelSnapshot::SKILLS[LevelSnapshot::SKILL_COUNT - 1], "farming");
        assert_eq!(LevelSnapshot::from_values(values), snapshot);
    }

    #[test]
    fn start_bot_requires_script() {
        let err = parse_start_bot(Some(json!({ "account_id": 42, "script": "" })))
            .expect_err("empty script");
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn start_bot_rejects_unknown_fields() {
        assert!(parse_start_bot(Some(json!({
            "account_id": 42,
            "script": "chop.js",
            "world": 301
        })))
        .is_err());
    }

    #[test]
    fn start_bot_defaults_params() {
        let parsed = parse_start_bot(Some(json!({ "account_id": 42, "script": "chop.js" })))
            .expect("parse start");
        assert!(parsed.params.is_empty());
    }

    #[test]
    fn bot_id_requires_params() {
        let err = parse_bot_id(None).expect_err("missing params");
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn activity_query_defaults_and_caps_limit() {
        let query = parse_activity_query(None).expect("default query");
        assert_eq!(query.account_id, None);
        assert_eq!(query.effective_limit(), DEFAULT_ACTIVITY_LIMIT);

        let query = parse_activity_query(Some(json!({ "account_id": 7, "limit": 50_000 })))
            .expect("capped query");
        assert_eq!(query.account_id, Some(7));
        assert_eq!(query.effective_limit(), MAX_ACTIVITY_LIMIT);
    }

    #[test]
    fn activity_query_rejects_non_positive_account() {
        assert!(parse_activity_query(Some(json!({ "account_id": 0 }))).is_err());
    }

    #[test]
    fn request_round_trips_method_names() {
        let request = Request::new(Method::GetActiveBots, None);
        let encoded = serde_json::to_value(&request).expect("encode");
        assert_eq!(encoded["method"], "get_active_bots");
        assert_eq!(encoded["protocol_version"], PROTOCOL_VERSION);
    }
}
