//! iconwear daemon entrypoint.
//!
//! A small, single-writer service that owns per-application wear state. It
//! listens on a Unix socket for launch events and queries, ages active
//! sessions on a timer, persists to SQLite and pushes change notifications to
//! subscribed clients.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use iconwear_protocol::{
    parse_app_params, parse_launch, ErrorInfo, Method, Request, Response,
    ERROR_TOO_MANY_CONNECTIONS, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde_json::Value;

mod config;
mod db;
mod engine;
mod error;
mod monitor;
mod notify;
mod persist;
mod store;
mod wear;

use db::SqliteBackend;
use engine::WearEngine;
use monitor::{spawn_session_monitor, MonitorHandle};
use notify::{Broadcaster, NotificationSink};
use persist::{MemoryBackend, WearBackend};

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const MAX_ACTIVE_CONNECTIONS: usize = 64;
const SUBSCRIBER_HEARTBEAT_SECS: u64 = 15;
const SUBSCRIBER_WRITE_TIMEOUT_SECS: u64 = 5;

struct Daemon {
    engine: Arc<WearEngine>,
    notifications: Arc<Broadcaster>,
    active_connections: AtomicUsize,
    rejected_connections: AtomicU64,
}

/// Holds one of the [`MAX_ACTIVE_CONNECTIONS`] slots until dropped.
struct ConnectionSlot {
    daemon: Arc<Daemon>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.daemon.active_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Daemon {
    fn new(engine: Arc<WearEngine>, notifications: Arc<Broadcaster>) -> Self {
        Self {
            engine,
            notifications,
            active_connections: AtomicUsize::new(0),
            rejected_connections: AtomicU64::new(0),
        }
    }

    fn acquire_slot(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let previous = self.active_connections.fetch_add(1, Ordering::SeqCst);
        let slot = ConnectionSlot {
            daemon: Arc::clone(self),
        };
        if previous >= MAX_ACTIVE_CONNECTIONS {
            self.rejected_connections.fetch_add(1, Ordering::SeqCst);
            return None;
        }
        Some(slot)
    }
}

fn main() {
    init_logging();

    let daemon_config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load iconwear config; using defaults");
            config::DaemonConfig::default()
        }
    };

    let socket_path = match config::socket_path() {
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

    let backend = open_backend();
    let notifications = Arc::new(Broadcaster::new());
    let sink: Arc<dyn NotificationSink> = Arc::clone(&notifications) as Arc<dyn NotificationSink>;
    let engine = Arc::new(WearEngine::start(daemon_config, backend, sink));
    info!(
        launch_factor = daemon_config.wear.launch_factor,
        time_factor = daemon_config.wear.time_factor,
        max_wear = daemon_config.wear.max_wear,
        tick_interval_secs = daemon_config.monitor.tick_interval_secs,
        inactivity_timeout_secs = daemon_config.monitor.inactivity_timeout_secs,
        "Wear engine ready"
    );

    let monitor = match spawn_session_monitor(
        Arc::clone(&engine),
        engine.monitor_settings().tick_interval(),
    ) {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(error = %err, "Failed to start session monitor; active time will not accrue");
            None
        }
    };

    install_shutdown_handler(Arc::clone(&engine), monitor, socket_path.clone());

    info!(path = %socket_path.display(), "iconwear daemon started");

    let daemon = Arc::new(Daemon::new(engine, notifications));

    for stream in listener.incoming() {
        match stream {
            Ok(mut stream) => match daemon.acquire_slot() {
                Some(slot) => {
                    thread::spawn(move || handle_connection(stream, slot));
                }
                None => {
                    warn!("Rejecting connection: too many active connections");
                    let response = Response::error(
                        None,
                        ERROR_TOO_MANY_CONNECTIONS,
                        "daemon is at its connection limit",
                    );
                    let _ = write_response(&mut stream, response);
                }
            },
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("ICONWEAR_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_backend() -> Box<dyn WearBackend> {
    let db_path = match config::db_path() {
        Ok(path) => path,
        Err(err) => {
            warn!(error = %err, "Failed to resolve wear database path; keeping state in memory");
            return Box::new(MemoryBackend::default());
        }
    };

    match SqliteBackend::new(db_path) {
        Ok(db) => Box::new(db),
        Err(err) => {
            warn!(error = %err, "Failed to open wear database; keeping state in memory");
            Box::new(MemoryBackend::default())
        }
    }
}

fn install_shutdown_handler(
    engine: Arc<WearEngine>,
    monitor: Option<MonitorHandle>,
    socket_path: PathBuf,
) {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(err) => {
            warn!(
                error = %err,
                "Failed to install signal handlers; shutdown will skip final persist"
            );
            return;
        }
    };

    let spawned = thread::Builder::new()
        .name("shutdown".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "Shutdown signal received");
                if let Some(monitor) = monitor {
                    monitor.stop();
                }
                engine.shutdown();
                if let Err(err) = remove_existing_socket(&socket_path) {
                    warn!(error = %err, "Failed to remove daemon socket on shutdown");
                }
                info!("iconwear daemon stopped");
                std::process::exit(0);
            }
        });

    if let Err(err) = spawned {
        warn!(error = %err, "Failed to spawn shutdown thread");
    }
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

fn handle_connection(mut stream: UnixStream, slot: ConnectionSlot) {
    let daemon = &slot.daemon;

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

    if request.protocol_version == PROTOCOL_VERSION && request.method == Method::Subscribe {
        serve_subscription(
            stream,
            request.id,
            daemon,
            Duration::from_secs(SUBSCRIBER_WRITE_TIMEOUT_SECS),
        );
        return;
    }

    let response = handle_request(request, daemon);
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
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
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

fn handle_request(request: Request, daemon: &Daemon) -> Response {
    let engine = &daemon.engine;
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
            });
            if let Ok(value) = serde_json::to_value(engine.health()) {
                data["engine"] = value;
            }
            data["connections"] = serde_json::json!({
                "active": daemon.active_connections.load(Ordering::SeqCst),
                "limit": MAX_ACTIVE_CONNECTIONS,
                "rejected": daemon.rejected_connections.load(Ordering::SeqCst),
                "subscribers": daemon.notifications.subscriber_count(),
            });
            Response::ok(request.id, data)
        }
        Method::Launch => {
            let params = match request.params {
                Some(params) => params,
                None => {
                    return Response::error(request.id, "invalid_params", "resource is required")
                }
            };
            let launch = match parse_launch(params) {
                Ok(launch) => launch,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            tracing::debug!(app_id = %launch.app_id, agent = ?launch.agent, "Launch event");
            engine.on_launch(&launch.app_id);
            Response::ok(
                request.id,
                serde_json::json!({
                    "accepted": true,
                    "app_id": launch.app_id,
                    "wear_level": engine.get_wear_level(&launch.app_id),
                }),
            )
        }
        Method::GetWearLevel => match app_id_param(request.params) {
            Ok(app_id) => Response::ok(
                request.id,
                serde_json::json!({
                    "app_id": app_id,
                    "wear_level": engine.get_wear_level(&app_id),
                }),
            ),
            Err(err) => Response::error_with_info(request.id, err),
        },
        Method::GetMetrics => match app_id_param(request.params) {
            Ok(app_id) => serialize_response(request.id, &engine.get_metrics(&app_id), "metrics"),
            Err(err) => Response::error_with_info(request.id, err),
        },
        Method::ListMetrics => {
            let metrics = engine.list_metrics();
            tracing::debug!(apps = metrics.len(), "Metrics snapshot");
            serialize_response(request.id, &metrics, "metrics")
        }
        Method::ResetWearLevel => match app_id_param(request.params) {
            Ok(app_id) => {
                engine.reset_wear_level(&app_id);
                Response::ok(
                    request.id,
                    serde_json::json!({
                        "app_id": app_id,
                        "reconstructions": engine.get_reconstructions(&app_id),
                    }),
                )
            }
            Err(err) => Response::error_with_info(request.id, err),
        },
        Method::GetReconstructions => match app_id_param(request.params) {
            Ok(app_id) => Response::ok(
                request.id,
                serde_json::json!({
                    "app_id": app_id,
                    "reconstructions": engine.get_reconstructions(&app_id),
                }),
            ),
            Err(err) => Response::error_with_info(request.id, err),
        },
        Method::Subscribe => Response::error(
            request.id,
            "invalid_method",
            "subscribe must be the only request on its connection",
        ),
    }
}

fn app_id_param(params: Option<Value>) -> Result<String, ErrorInfo> {
    match params {
        Some(params) => parse_app_params(params),
        None => Err(ErrorInfo::new("invalid_params", "app_id is required")),
    }
}

fn serialize_response<T: serde::Serialize>(id: Option<String>, value: &T, what: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        ),
    }
}

/// Streams notifications to one client until it disconnects or stops reading.
///
/// A write that blocks longer than `write_timeout` ends the stream, which drops
/// the receiver so the broadcaster prunes it on the next publish.
fn serve_subscription(
    mut stream: UnixStream,
    id: Option<String>,
    daemon: &Daemon,
    write_timeout: Duration,
) {
    if let Err(err) = stream.set_write_timeout(Some(write_timeout)) {
        warn!(error = %err, "Failed to set subscriber write timeout");
        return;
    }
    let receiver = daemon.notifications.subscribe();
    let ack = Response::ok(id, serde_json::json!({ "subscribed": true }));
    if write_response(&mut stream, ack).is_err() {
        return;
    }
    info!(
        subscribers = daemon.notifications.subscriber_count(),
        "Notification subscriber attached"
    );

    loop {
        match receiver.recv_timeout(Duration::from_secs(SUBSCRIBER_HEARTBEAT_SECS)) {
            Ok(notification) => {
                if let Err(err) = write_line(&mut stream, &notification) {
                    tracing::debug!(error = %err, "Subscriber write failed");
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                // Blank line; lets us notice peers that went away quietly.
                if stream.write_all(b"\n").and_then(|_| stream.flush()).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::debug!("Notification subscriber detached");
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    write_line(stream, &response)
}

fn write_line<T: serde::Serialize>(stream: &mut UnixStream, value: &T) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, value)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
