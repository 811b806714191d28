//! IPC protocol types and validation for iconwear-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests and decode responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_APP_ID_LEN: usize = 512;
pub const ERROR_TOO_MANY_CONNECTIONS: &str = "too_many_connections";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Launch,
    GetWearLevel,
    GetMetrics,
    ListMetrics,
    ResetWearLevel,
    GetReconstructions,
    Subscribe,
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

/// Usage metrics for one application, as returned by `get_metrics`.
///
/// Unknown applications are reported with zero counters and no timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WearMetrics {
    pub app_id: String,
    pub wear_level: u32,
    pub launches: u64,
    pub active_minutes: u64,
    pub reconstructions: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_open_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reset_time: Option<String>,
}

/// Change notifications pushed to `subscribe` connections, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Notification {
    WearLevelChanged { app_id: String, new_level: u32 },
    WearLevelReset { app_id: String },
}

impl Notification {
    pub fn app_id(&self) -> &str {
        match self {
            Notification::WearLevelChanged { app_id, .. } => app_id,
            Notification::WearLevelReset { app_id } => app_id,
        }
    }
}

// `activity` is part of the launch feed but carries no meaning for wear.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchParams {
    pub resource: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub activity: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppParams {
    pub app_id: String,
}

/// A validated launch with its identifier already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEvent {
    pub app_id: String,
    pub agent: Option<String>,
}

/// Reduces a raw resource (a desktop-file path or `scheme:name` URI) to the
/// application identifier used as the tracking key: the final `/` segment.
pub fn normalize_app_id(resource: &str) -> Option<String> {
    let trimmed = resource.trim();
    let candidate = match trimmed.rsplit_once('/') {
        Some((_, last)) => last,
        None => trimmed,
    };
    if candidate.is_empty() {
        None
    } else {
        Some(candidate.to_string())
    }
}

pub fn parse_launch(params: Value) -> Result<LaunchEvent, ErrorInfo> {
    let parsed: LaunchParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("launch payload is invalid: {}", err),
        )
    })?;
    let app_id = normalize_app_id(&parsed.resource)
        .ok_or_else(|| ErrorInfo::new("invalid_params", "resource is required"))?;
    require_length(&app_id)?;
    Ok(LaunchEvent {
        app_id,
        agent: parsed.agent.filter(|agent| !agent.trim().is_empty()),
    })
}

pub fn parse_app_params(params: Value) -> Result<String, ErrorInfo> {
    let parsed: AppParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("app payload is invalid: {}", err),
        )
    })?;
    let app_id = parsed.app_id.trim();
    if app_id.is_empty() {
        return Err(ErrorInfo::new("missing_field", "app_id is required"));
    }
    require_length(app_id)?;
    Ok(app_id.to_string())
}

fn require_length(app_id: &str) -> Result<(), ErrorInfo> {
    if app_id.len() > MAX_APP_ID_LEN {
        return Err(ErrorInfo::new(
            "invalid_app_id",
            format!("app_id must be {} bytes or fewer", MAX_APP_ID_LEN),
        ));
    }
    Ok(())
}
