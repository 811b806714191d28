use iconwear_protocol::{Method, Notification, Request, Response, PROTOCOL_VERSION};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn temp_home() -> TempDir {
    tempfile::Builder::new()
        .prefix("iconwear-smoke")
        .tempdir_in("/tmp")
        .expect("Failed to create temp HOME")
}

fn spawn_daemon(home: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_iconwear-daemon"))
        .env("HOME", home)
        .env_remove("ICONWEAR_SOCKET")
        .env_remove("ICONWEAR_CONFIG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn iconwear-daemon")
}

fn socket_path(home: &Path) -> PathBuf {
    home.join(".iconwear").join("daemon.sock")
}

fn db_path(home: &Path) -> PathBuf {
    home.join(".iconwear").join("daemon").join("wear.db")
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for daemon socket at {}", path.display());
}

fn send_request(socket: &Path, method: Method, params: Option<serde_json::Value>) -> Response {
    let mut stream = UnixStream::connect(socket).expect("Failed to connect to daemon socket");
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(format!("{:?}", method)),
        params,
    };
    serde_json::to_writer(&mut stream, &request).expect("Failed to serialize request");
    stream.write_all(b"\n").expect("Failed to write request");
    stream.flush().ok();
    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("Failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    serde_json::from_slice(response_bytes).expect("Failed to parse response JSON")
}

fn data(response: Response) -> serde_json::Value {
    assert!(response.ok, "response was not ok: {:?}", response.error);
    response.data.expect("response payload")
}

fn app(app_id: &str) -> Option<serde_json::Value> {
    Some(serde_json::json!({ "app_id": app_id }))
}

fn launch(socket: &Path, resource: &str) -> serde_json::Value {
    data(send_request(
        socket,
        Method::Launch,
        Some(serde_json::json!({ "resource": resource, "agent": "smoke-test" })),
    ))
}

#[test]
fn daemon_ipc_launch_query_and_reset_smoke() {
    let home = temp_home();
    let socket = socket_path(home.path());
    let _guard = DaemonGuard {
        child: spawn_daemon(home.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(5));

    let health = data(send_request(&socket, Method::GetHealth, None));
    assert_eq!(health["status"], "ok");
    assert_eq!(health["protocol_version"], PROTOCOL_VERSION);
    assert_eq!(health["engine"]["tracked_apps"], 0);

    let launched = launch(&socket, "/usr/share/applications/org.kde.kate.desktop");
    assert_eq!(launched["app_id"], "org.kde.kate.desktop");
    assert_eq!(launched["wear_level"], 1);

    for _ in 0..3 {
        launch(&socket, "org.kde.kate.desktop");
    }
    let level = data(send_request(
        &socket,
        Method::GetWearLevel,
        app("org.kde.kate.desktop"),
    ));
    assert_eq!(level["wear_level"], 4);

    let metrics = data(send_request(
        &socket,
        Method::GetMetrics,
        app("org.kde.kate.desktop"),
    ));
    assert_eq!(metrics["launches"], 4);
    assert_eq!(metrics["active_minutes"], 0);
    assert_eq!(metrics["reconstructions"], 0);
    assert!(metrics["last_open_time"].is_string());
    assert!(metrics.get("last_reset_time").is_none());

    let unknown = data(send_request(&socket, Method::GetMetrics, app("never-seen")));
    assert_eq!(unknown["wear_level"], 0);
    assert_eq!(unknown["launches"], 0);
    assert!(unknown.get("last_open_time").is_none());

    let reset = data(send_request(
        &socket,
        Method::ResetWearLevel,
        app("org.kde.kate.desktop"),
    ));
    assert_eq!(reset["reconstructions"], 1);
    let level = data(send_request(
        &socket,
        Method::GetWearLevel,
        app("org.kde.kate.desktop"),
    ));
    assert_eq!(level["wear_level"], 0);
    let reconstructions = data(send_request(
        &socket,
        Method::GetReconstructions,
        app("org.kde.kate.desktop"),
    ));
    assert_eq!(reconstructions["reconstructions"], 1);

    launch(&socket, "org.kde.dolphin.desktop");
    let all = data(send_request(&socket, Method::ListMetrics, None));
    let ids: Vec<&str> = all
        .as_array()
        .expect("metrics list")
        .iter()
        .filter_map(|entry| entry["app_id"].as_str())
        .collect();
    assert_eq!(ids, vec!["org.kde.dolphin.desktop", "org.kde.kate.desktop"]);
}

#[test]
fn daemon_subscribe_streams_wear_notifications() {
    let home = temp_home();
    let socket = socket_path(home.path());
    let _guard = DaemonGuard {
        child: spawn_daemon(home.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(5));

    let mut stream = UnixStream::connect(&socket).expect("Failed to connect subscriber");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set read timeout");
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::Subscribe,
        id: Some("watch".to_string()),
        params: None,
    };
    serde_json::to_writer(&mut stream, &request).expect("serialize subscribe");
    stream.write_all(b"\n").expect("write subscribe");

    let mut reader = BufReader::new(stream);
    let mut next_line = || {
        let mut line = String::new();
        loop {
            line.clear();
            reader.read_line(&mut line).expect("read subscriber line");
            if !line.trim().is_empty() {
                return line;
            }
        }
    };

    let ack: Response = serde_json::from_str(next_line().trim()).expect("parse ack");
    assert!(ack.ok);
    assert_eq!(ack.data.expect("ack payload")["subscribed"], true);

    launch(&socket, "kate");
    data(send_request(&socket, Method::ResetWearLevel, app("kate")));

    let received: Vec<Notification> = (0..3)
        .map(|_| serde_json::from_str(next_line().trim()).expect("parse notification"))
        .collect();
    assert_eq!(
        received,
        vec![
            Notification::WearLevelChanged {
                app_id: "kate".to_string(),
                new_level: 1,
            },
            Notification::WearLevelChanged {
                app_id: "kate".to_string(),
                new_level: 0,
            },
            Notification::WearLevelReset {
                app_id: "kate".to_string(),
            },
        ]
    );
}

#[test]
fn daemon_restart_restores_persisted_wear() {
    let home = temp_home();
    let socket = socket_path(home.path());

    {
        let _guard = DaemonGuard {
            child: spawn_daemon(home.path()),
        };
        wait_for_socket(&socket, Duration::from_secs(5));
        for _ in 0..5 {
            launch(&socket, "org.kde.konsole.desktop");
        }
        data(send_request(&socket, Method::ResetWearLevel, app("gimp")));
    }
    assert!(db_path(home.path()).exists(), "wear database was not created");

    let _guard = DaemonGuard {
        child: spawn_daemon(home.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(5));

    let konsole = data(send_request(
        &socket,
        Method::GetMetrics,
        app("org.kde.konsole.desktop"),
    ));
    assert_eq!(konsole["wear_level"], 5);
    assert_eq!(konsole["launches"], 5);

    let gimp = data(send_request(&socket, Method::GetMetrics, app("gimp")));
    assert_eq!(gimp["reconstructions"], 1);
    assert_eq!(gimp["wear_level"], 0);
    assert!(gimp["last_reset_time"].is_string());
}

#[test]
fn daemon_sigterm_shuts_down_cleanly() {
    let home = temp_home();
    let socket = socket_path(home.path());
    let mut guard = DaemonGuard {
        child: spawn_daemon(home.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(5));
    launch(&socket, "kate");

    let status = Command::new("kill")
        .arg("-TERM")
        .arg(guard.child.id().to_string())
        .status()
        .expect("Failed to run kill");
    assert!(status.success());

    let deadline = Instant::now() + Duration::from_secs(5);
    let exit = loop {
        if let Some(exit) = guard.child.try_wait().expect("poll daemon") {
            break exit;
        }
        assert!(Instant::now() < deadline, "daemon did not exit after SIGTERM");
        sleep(Duration::from_millis(25));
    };
    assert!(exit.success(), "daemon exited with {exit}");
    assert!(!socket.exists(), "socket was not removed on shutdown");
}
