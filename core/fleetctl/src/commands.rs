//! Maps CLI subcommands onto daemon methods and renders their replies.

use botfleet_daemon_protocol::{parse_heartbeat, Method};
use clap::{Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::fmt::Write as _;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Launch a bot for an account
    Start {
        #[arg(value_name = "ACCOUNT_ID")]
        account_id: i64,

        /// Script passed to the client
        #[arg(value_name = "SCRIPT")]
        script: String,

        /// Extra script parameters, in order
        #[arg(value_name = "PARAMS", trailing_var_arg = true, allow_hyphen_values = true)]
        params: Vec<String>,
    },

    /// Stop a registered bot and close its session
    Stop {
        #[arg(value_name = "BOT_ID")]
        id: String,
    },

    /// Restart a registered bot with its last script
    Restart {
        #[arg(value_name = "BOT_ID")]
        id: String,
    },

    /// Show one registered bot
    Bot {
        #[arg(value_name = "BOT_ID")]
        id: String,
    },

    /// List bots
    List {
        #[arg(value_enum, default_value_t = ListView::Bots)]
        view: ListView,
    },

    /// Show recent activity sessions
    Activity {
        #[arg(long)]
        account: Option<i64>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show XP recorded for an activity session
    Xp {
        #[arg(value_name = "ACTIVITY_ID")]
        activity_id: i64,
    },

    /// List accounts, or show one
    Accounts {
        #[arg(value_name = "ACCOUNT_ID")]
        account_id: Option<i64>,
    },

    /// Show the latest skill levels for an account
    Levels {
        #[arg(value_name = "ACCOUNT_ID")]
        account_id: i64,
    },

    /// Push a heartbeat read as JSON from stdin
    Heartbeat,

    /// Daemon and monitor health
    Health,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListView {
    /// Bots held in the daemon's registry
    Bots,
    /// Accounts with an open activity session
    Active,
    /// Accounts without an open activity session
    Inactive,
}

/// Resolves a subcommand to the method and params it sends. `stdin` is only
/// read by `heartbeat`.
pub fn request_for(
    command: &Commands,
    stdin: impl FnOnce() -> Result<String, String>,
) -> Result<(Method, Option<Value>), String> {
    let request = match command {
        Commands::Start {
            account_id,
            script,
            params,
        } => (
            Method::StartBot,
            Some(json!({ "account_id": account_id, "script": script, "params": params })),
        ),
        Commands::Stop { id } => (Method::StopBot, Some(json!({ "id": id }))),
        Commands::Restart { id } => (Method::RestartBot, Some(json!({ "id": id }))),
        Commands::Bot { id } => (Method::GetBot, Some(json!({ "id": id }))),
        Commands::List { view } => {
            let method = match view {
                ListView::Bots => Method::GetBots,
                ListView::Active => Method::GetActiveBots,
                ListView::Inactive => Method::GetInactiveBots,
            };
            (method, None)
        }
        Commands::Activity { account, limit } => {
            let mut params = serde_json::Map::new();
            if let Some(account_id) = account {
                params.insert("account_id".to_string(), json!(account_id));
            }
            if let Some(limit) = limit {
                params.insert("limit".to_string(), json!(limit));
            }
            let params = (!params.is_empty()).then_some(Value::Object(params));
            (Method::GetActivity, params)
        }
        Commands::Xp { activity_id } => (
            Method::GetActivityXp,
            Some(json!({ "activity_id": activity_id })),
        ),
        Commands::Accounts { account_id: None } => (Method::GetAccounts, None),
        Commands::Accounts {
            account_id: Some(account_id),
        } => (
            Method::GetAccount,
            Some(json!({ "account_id": account_id })),
        ),
        Commands::Levels { account_id } => {
            (Method::GetLevels, Some(json!({ "account_id": account_id })))
        }
        Commands::Heartbeat => {
            let raw = stdin()?;
            let value: Value = serde_json::from_str(raw.trim())
                .map_err(|err| format!("heartbeat on stdin is not valid JSON: {}", err))?;
            // Catch obvious mistakes before bothering the daemon.
            parse_heartbeat(value.clone())
                .map_err(|err| format!("{}: {}", err.code, err.message))?;
            (Method::Heartbeat, Some(value))
        }
        Commands::Health => (Method::GetHealth, None),
    };
    Ok(request)
}

/// Human-readable rendering. Unknown shapes fall back to pretty JSON.
pub fn render(method: Method, data: &Value) -> String {
    match method {
        Method::GetBots | Method::GetActiveBots | Method::GetInactiveBots => {
            render_table(data, &["id", "email", "username", "status", "pid", "script"])
        }
        Method::GetActivity => render_table(
            data,
            &["id", "account_id", "pid", "started_at", "stopped_at", "command"],
        ),
        Method::GetActivityXp => render_table(data, &["skill", "xp_gained"]),
        Method::GetAccounts => render_table(data, &["id", "email", "username", "status"]),
        Method::StopBot => {
            let id = field(data, "id");
            if data["stopped"].as_bool() == Some(true) {
                format!("stopped {}", id)
            } else {
                format!("no bot registered as {}", id)
            }
        }
        Method::StartBot | Method::RestartBot => {
            format!("{} running as pid {}", field(data, "id"), field(data, "pid"))
        }
        _ => serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string()),
    }
}

fn render_table(data: &Value, columns: &[&str]) -> String {
    let Some(rows) = data.as_array() else {
        return data.to_string();
    };
    if rows.is_empty() {
        return "(none)".to_string();
    }

    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| columns.iter().map(|column| field(row, column)).collect())
        .collect();
    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(index, column)| {
            cells
                .iter()
                .map(|row| row[index].len())
                .chain(std::iter::once(column.len()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let mut out = String::new();
    write_row(&mut out, columns.iter().copied(), &widths);
    for row in &cells {
        write_row(&mut out, row.iter().map(String::as_str), &widths);
    }
    out.truncate(out.trim_end().len());
    out
}

fn write_row<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>, widths: &[usize]) {
    let line: Vec<String> = cells
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
        .collect();
    let _ = writeln!(out, "{}", line.join("  ").trim_end());
}

fn field(row: &Value, key: &str) -> String {
    match row.get(key) {
        None | Some(Value::Null) => "-".to_string(),
        Some(Value::String(text)) if text.is_empty() => "-".to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_stdin() -> Result<String, String> {
        panic!("stdin should not be read");
    }

    #[test]
    fn start_carries_params_in_order() {
        let command = Commands::Start {
            account_id: 42,
            script: "chop.js".to_string(),
            params: vec!["oak".to_string(), "--bank".to_string()],
        };
        let (method, params) = request_for(&command, no_stdin).expect("request");
        assert_eq!(method, Method::StartBot);
        assert_eq!(
            params,
            Some(json!({ "account_id": 42, "script": "chop.js", "params": ["oak", "--bank"] }))
        );
    }

    #[test]
    fn list_views_map_to_methods() {
        let cases = [
            (ListView::Bots, Method::GetBots),
            (ListView::Active, Method::GetActiveBots),
            (ListView::Inactive, Method::GetInactiveBots),
        ];
        for (view, expected) in cases {
            let (method, params) =
                request_for(&Commands::List { view }, no_stdin).expect("request");
            assert_eq!(method, expected);
            assert_eq!(params, None);
        }
    }

    #[test]
    fn activity_omits_params_when_unfiltered() {
        let (_, params) = request_for(
            &Commands::Activity {
                account: None,
                limit: None,
            },
            no_stdin,
        )
        .expect("request");
        assert_eq!(params, None);

        let (_, params) = request_for(
            &Commands::Activity {
                account: Some(7),
                limit: Some(5),
            },
            no_stdin,
        )
        .expect("request");
        assert_eq!(params, Some(json!({ "account_id": 7, "limit": 5 })));
    }

    #[test]
    fn accounts_switches_on_optional_id() {
        let (method, _) =
            request_for(&Commands::Accounts { account_id: None }, no_stdin).expect("all");
        assert_eq!(method, Method::GetAccounts);
        let (method, params) =
            request_for(&Commands::Accounts { account_id: Some(3) }, no_stdin).expect("one");
        assert_eq!(method, Method::GetAccount);
        assert_eq!(params, Some(json!({ "account_id": 3 })));
    }

    #[test]
    fn heartbeat_reads_and_validates_stdin() {
        let (method, params) = request_for(&Commands::Heartbeat, || {
            Ok(r#"{"email":"bot@example.com","status":"Chopping","pid":77}"#.to_string())
        })
        .expect("heartbeat");
        assert_eq!(method, Method::Heartbeat);
        assert_eq!(params.expect("params")["pid"], 77);

        let err = request_for(&Commands::Heartbeat, || {
            Ok(r#"{"email":"","status":"Chopping"}"#.to_string())
        })
        .expect_err("empty email");
        assert!(err.starts_with("missing_field"));

        let err = request_for(&Commands::Heartbeat, || Ok("not json".to_string()))
            .expect_err("bad json");
        assert!(err.contains("not valid JSON"));
    }

    #[test]
    fn bot_table_aligns_columns_and_marks_missing_values() {
        let data = json!([
            { "id": "42", "email": "a@example.com", "username": "", "status": "Started",
              "pid": 1234, "script": "chop.js" },
            { "id": "7", "email": "longer@example.com", "username": "Miner", "status": "Stopped",
              "pid": 0, "script": "" },
        ]);
        let rendered = render(Method::GetBots, &data);
        let lines: Vec<&str> = rendered.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id  email"));
        assert!(lines[1].starts_with("42  a@example.com       -"));
        assert!(lines[2].ends_with("0     -"));
    }

    #[test]
    fn empty_lists_and_stop_results_render_plainly() {
        assert_eq!(render(Method::GetActivity, &json!([])), "(none)");
        assert_eq!(
            render(Method::StopBot, &json!({ "id": "42", "stopped": true })),
            "stopped 42"
        );
        assert_eq!(
            render(Method::StopBot, &json!({ "id": "9", "stopped": false })),
            "no bot registered as 9"
        );
        assert_eq!(
            render(Method::StartBot, &json!({ "id": "42", "pid": 555 })),
            "42 running as pid 555"
        );
    }
}
