//! botfleet daemon entrypoint.
//!
//! A single long-lived control plane for the bot fleet: a socket listener with
//! strict request validation, a SQLite-backed account and session store, and a
//! background liveness monitor reconciling sessions against the process table.

use fs_err as fs;
use serde::Serialize;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use botfleet_daemon_protocol::{
    parse_account_id, parse_activity_query, parse_activity_xp, parse_bot_id, parse_heartbeat,
    parse_start_bot, ErrorInfo, Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod bot;
mod config;
mod db;
mod error;
mod heartbeat;
mod ledger;
mod monitor;
mod process;
mod registry;
mod state;
mod store;

use config::FleetConfig;
use db::Db;
use error::FleetError;
use process::ClientLauncher;
use state::FleetState;

const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

fn main() {
    init_logging();

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load fleet config; using defaults");
            FleetConfig::default()
        }
    };

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "Botfleet daemon started");

    let db_path = match daemon_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path) {
        Ok(db) => Arc::new(db),
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    info!(
        java = %config.client.java,
        client_jar = %config.client.client_jar.display(),
        world = %config.client.world,
        monitor_interval_secs = config.monitor.interval().as_secs(),
        "Fleet config loaded"
    );
    let processes = Arc::new(ClientLauncher::new(config.client.clone()));
    let shared_state = Arc::new(FleetState::new(db, processes, config.monitor.interval()));

    if let Err(err) = shared_state.spawn_monitor() {
        error!(error = %err, "Failed to start liveness monitor");
        std::process::exit(1);
    }

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }

    shared_state.stop_monitor();
}

fn init_logging() {
    let debug_enabled = env::var("BOTFLEET_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".botfleet").join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".botfleet").join("daemon").join("fleet.db"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<FleetState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: &FleetState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    let params = request.params;

    match request.method {
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
            });
            if let Ok(value) = serde_json::to_value(state.health()) {
                data["fleet"] = value;
            }
            Response::ok(id, data)
        }
        Method::Heartbeat => {
            let Some(params) = params else {
                return Response::error(id, "invalid_params", "heartbeat payload is required");
            };
            let heartbeat = match parse_heartbeat(params) {
                Ok(heartbeat) => heartbeat,
                Err(err) => return Response::error_with_info(id, err),
            };
            info!(
                email = %heartbeat.email,
                status = %heartbeat.status,
                pid = heartbeat.pid,
                gained_xp = heartbeat.gained_xp.len(),
                "Received heartbeat"
            );
            respond(id, "heartbeat", state.heartbeat(&heartbeat))
        }
        Method::StartBot => match parse_start_bot(params) {
            Ok(parsed) => respond(
                id,
                "bot",
                state.register_and_start(parsed.account_id, &parsed.script, parsed.params),
            ),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::StopBot => match parse_bot_id(params) {
            Ok(parsed) => respond(
                id,
                "stop result",
                state
                    .stop(&parsed.id)
                    .map(|stopped| serde_json::json!({ "id": parsed.id, "stopped": stopped })),
            ),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::RestartBot => match parse_bot_id(params) {
            Ok(parsed) => respond(id, "bot", state.restart(&parsed.id)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetBots => respond(id, "bots", Ok(state.bots())),
        Method::GetBot => match parse_bot_id(params) {
            Ok(parsed) => respond(id, "bot", state.bot(&parsed.id)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetActiveBots => respond(id, "active bots", state.list_active()),
        Method::GetInactiveBots => respond(id, "inactive bots", state.list_inactive()),
        Method::GetActivity => match parse_activity_query(params) {
            Ok(query) => {
                tracing::debug!(
                    account_id = ?query.account_id,
                    limit = query.effective_limit(),
                    "Activity snapshot request"
                );
                respond(id, "activity", state.activity(&query))
            }
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetActivityXp => match parse_activity_xp(params) {
            Ok(parsed) => respond(id, "activity xp", state.activity_xp(parsed.activity_id)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetAccounts => respond(id, "accounts", state.accounts()),
        Method::GetAccount => match parse_account_id(params) {
            Ok(parsed) => respond(id, "account", state.account(parsed.account_id)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetLevels => match parse_account_id(params) {
            Ok(parsed) => respond(id, "levels", state.levels(parsed.account_id)),
            Err(err) => Response::error_with_info(id, err),
        },
    }
}

fn respond<T: Serialize>(
    id: Option<String>,
    label: &str,
    result: Result<T, FleetError>,
) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => Response::ok(id, value),
            Err(err) => Response::error(
                id,
                "serialization_error",
                format!("Failed to serialize {}: {}", label, err),
            ),
        },
        Err(err) => {
            warn!(code = err.code(), error = %err, "Request failed");
            Response::error_with_info(id, err.into())
        }
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
