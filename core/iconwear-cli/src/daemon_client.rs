//! Client helper for talking to the iconwear daemon over its Unix socket.

use iconwear_protocol::{Method, Notification, Request, Response, MAX_REQUEST_BYTES};
use serde_json::Value;
use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const SOCKET_ENV: &str = "ICONWEAR_SOCKET";
const BASE_DIR_NAME: &str = ".iconwear";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 2000;
const WRITE_TIMEOUT_MS: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("home directory not found")]
    NoHome,

    #[error("failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send request: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to read response: {0}")]
    Read(#[source] std::io::Error),

    #[error("timed out waiting for daemon response")]
    Timeout,

    #[error("daemon response exceeded maximum size")]
    TooLarge,

    #[error("daemon closed the connection without a response")]
    Empty,

    #[error("failed to parse daemon response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("daemon error {code}: {message}")]
    Daemon { code: String, message: String },
}

pub fn socket_path() -> Result<PathBuf, ClientError> {
    if let Some(path) = env::var_os(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(ClientError::NoHome)?;
    Ok(home.join(BASE_DIR_NAME).join(SOCKET_NAME))
}

/// Sends one request and returns the response payload, or the daemon's error.
pub fn call(method: Method, params: Option<Value>) -> Result<Value, ClientError> {
    let response = send_request(Request::new(method, params))?;
    into_data(response)
}

/// Subscribes to wear notifications and hands each one to `on_notification`
/// until the daemon closes the stream or the callback returns `false`.
pub fn watch<F>(mut on_notification: F) -> Result<(), ClientError>
where
    F: FnMut(Notification) -> bool,
{
    let mut stream = connect()?;
    write_request(&mut stream, &Request::new(Method::Subscribe, None))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    if reader.read_line(&mut line).map_err(ClientError::Read)? == 0 {
        return Err(ClientError::Empty);
    }
    into_data(serde_json::from_str::<Response>(line.trim_end())?)?;
    tracing::debug!("Subscribed to wear notifications");

    loop {
        line.clear();
        if reader.read_line(&mut line).map_err(ClientError::Read)? == 0 {
            return Ok(());
        }
        let trimmed = line.trim();
        // Heartbeats are blank lines.
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Notification>(trimmed) {
            Ok(notification) => {
                if !on_notification(notification) {
                    return Ok(());
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Ignoring unreadable notification line");
            }
        }
    }
}

fn connect() -> Result<UnixStream, ClientError> {
    let path = socket_path()?;
    UnixStream::connect(&path).map_err(|source| ClientError::Connect { path, source })
}

fn into_data(response: Response) -> Result<Value, ClientError> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    let (code, message) = match response.error {
        Some(err) => (err.code, err.message),
        None => ("unknown".to_string(), "unknown daemon error".to_string()),
    };
    Err(ClientError::Daemon { code, message })
}

fn write_request(stream: &mut UnixStream, request: &Request) -> Result<(), ClientError> {
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
    serde_json::to_writer(&mut *stream, request)?;
    stream.write_all(b"\n").map_err(ClientError::Write)?;
    stream.flush().map_err(ClientError::Write)
}

fn send_request(request: Request) -> Result<Response, ClientError> {
    let mut stream = connect()?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    write_request(&mut stream, &request)?;
    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ClientError::TooLarge);
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(ClientError::Timeout);
            }
            Err(err) => return Err(ClientError::Read(err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err(ClientError::Empty);
    }

    Ok(serde_json::from_slice(response_bytes)?)
}
