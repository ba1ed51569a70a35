//! Client helper for talking to the botfleet daemon.
//!
//! One request per connection. Daemon-side failures come back as
//! `"code: message"` strings for the caller to print.

use botfleet_daemon_protocol::{Method, Request, Response};
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const SOCKET_ENV: &str = "BOTFLEET_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
// Starting a bot spawns a JVM, so reads get more slack than writes.
const READ_TIMEOUT_MS: u64 = 10_000;
const WRITE_TIMEOUT_MS: u64 = 600;
// List replies grow with the fleet, so they get far more room than requests.
const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

fn build_request(method: Method, params: Option<Value>) -> Request {
    let mut request = Request::new(method, params);
    request.id = Some(format!("fleetctl-{}", std::process::id()));
    request
}

/// Sends one request and returns the response payload.
pub fn call(method: Method, params: Option<Value>) -> Result<Value, String> {
    let request = build_request(method, params);
    tracing::debug!(method = ?request.method, id = ?request.id, "Sending daemon request");
    let response = send_request(&request)?;
    into_data(response)
}

fn into_data(response: Response) -> Result<Value, String> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    let message = response
        .error
        .map(|err| format!("{}: {}", err.code, err.message))
        .unwrap_or_else(|| "Unknown daemon error".to_string());
    tracing::warn!(error = %message, "Daemon returned an error");
    Err(message)
}

fn socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".botfleet").join(SOCKET_NAME))
}

fn send_request(request: &Request) -> Result<Response, String> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        format!(
            "Failed to connect to daemon socket {}: {}",
            socket.display(),
            err
        )
    })?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_RESPONSE_BYTES {
                    return Err("Response exceeded maximum size".to_string());
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
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}
