use crate::error::Error;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::debug;

/// Delimiter between a node tag and the owning call id inside every remote
/// resource id this process creates.
pub const CALL_ID_DELIM: &str = "-call-";

/// Event types that are never correlated (operationally noisy).
const DISABLED_EVENT_TYPES: &[&str] = &["ChannelDialplan"];

/// Derived statuses that are filtered out before dispatch (noisy or
/// privacy-sensitive).
const DISABLED_STATUSES: &[&str] = &["ChannelVarset#SIPCALLID"];

const CHANNEL_EVENTS: &[&str] = &[
    "ChannelCreated",
    "ChannelVarset",
    "ChannelDtmfReceived",
    "ChannelStateChange",
    "ChannelDestroyed",
    "ChannelHangupRequest",
    "StasisStart",
    "StasisEnd",
];

const BRIDGE_EVENTS: &[&str] = &[
    "BridgeCreated",
    "ChannelEnteredBridge",
    "ChannelLeftBridge",
    "BridgeDestroyed",
];

const PLAYBACK_EVENTS: &[&str] = &["PlaybackStarted", "PlaybackFinished"];

pub fn resource_id(tag: &str, call_id: &str) -> String {
    format!("{}{}{}", tag, CALL_ID_DELIM, call_id)
}

pub fn split_resource_id(id: &str) -> Option<(&str, &str)> {
    id.split_once(CALL_ID_DELIM)
}

/// Normalized internal representation of one raw protocol notification.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub app: String,
    pub event_type: String,
    pub call_id: String,
    pub tag: String,
    pub status: String,
    pub value: String,
    pub external_time: Option<DateTime<Utc>>,
    pub correlation_time: DateTime<Utc>,
}

impl TriggerEvent {
    /// Correlation lag in seconds; negative under clock skew, which is
    /// diagnostic data, not an error.
    pub fn delay(&self) -> Option<f64> {
        self.external_time
            .map(|external| (self.correlation_time - external).num_milliseconds() as f64 / 1000.0)
    }

    /// Event injected by the control API rather than the PBX (hangup etc.).
    pub fn synthetic(call_id: &str, tag: &str, status: &str, value: &str) -> Self {
        let now = Utc::now();
        Self {
            app: "api".to_string(),
            event_type: "ApiEvent".to_string(),
            call_id: call_id.to_string(),
            tag: tag.to_string(),
            status: status.to_string(),
            value: value.to_string(),
            external_time: Some(now),
            correlation_time: now,
        }
    }
}

/// Map a raw ARI event to a TriggerEvent, or drop it: deny-listed, or no
/// owning call can be extracted from its resource id.
pub fn correlate(raw: &Value) -> Option<TriggerEvent> {
    let event_type = raw.get("type").and_then(Value::as_str).unwrap_or("UNKNOWN");
    if DISABLED_EVENT_TYPES.contains(&event_type) {
        debug!(event_type, "skip deny-listed event type");
        return None;
    }

    let (tag, call_id) = match extract_ids(raw, event_type) {
        Ok(ids) => ids,
        Err(e) => {
            debug!(event_type, "drop event: {}", e);
            return None;
        }
    };

    let status = extract_status(raw, event_type);
    if DISABLED_STATUSES.contains(&status.as_str()) {
        debug!(status, "skip deny-listed status");
        return None;
    }

    Some(TriggerEvent {
        app: raw
            .get("application")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string(),
        event_type: event_type.to_string(),
        call_id,
        tag,
        status,
        value: extract_value(raw, event_type),
        external_time: raw
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp),
        correlation_time: Utc::now(),
    })
}

fn scoped_id<'a>(raw: &'a Value, scope: &str) -> Option<&'a str> {
    raw.get(scope)?.get("id")?.as_str()
}

fn extract_ids(raw: &Value, event_type: &str) -> Result<(String, String), Error> {
    if event_type == "ExternalEvent" {
        let tag = raw.get("tag").and_then(Value::as_str);
        let call_id = raw.get("call_id").and_then(Value::as_str);
        return match (tag, call_id) {
            (Some(tag), Some(call_id)) => Ok((tag.to_string(), call_id.to_string())),
            _ => Err(Error::Correlation(
                "external event without tag/call_id".to_string(),
            )),
        };
    }

    let scope = if CHANNEL_EVENTS.contains(&event_type) {
        "channel"
    } else if event_type == "Dial" {
        "peer"
    } else if BRIDGE_EVENTS.contains(&event_type) {
        "bridge"
    } else if PLAYBACK_EVENTS.contains(&event_type) {
        "playback"
    } else {
        return Err(Error::Correlation(format!(
            "unhandled event type {}",
            event_type
        )));
    };

    let id = scoped_id(raw, scope)
        .ok_or_else(|| Error::Correlation(format!("{} event without {} id", event_type, scope)))?;
    split_resource_id(id)
        .map(|(tag, call_id)| (tag.to_string(), call_id.to_string()))
        .ok_or_else(|| Error::Correlation(format!("resource id {} has no owning call", id)))
}

fn extract_status(raw: &Value, event_type: &str) -> String {
    let str_at = |path: &[&str]| -> String {
        let mut cur = raw;
        for key in path {
            match cur.get(key) {
                Some(next) => cur = next,
                None => return String::new(),
            }
        }
        cur.as_str().unwrap_or("").to_string()
    };

    match event_type {
        "ExternalEvent" => str_at(&["status"]),
        "ChannelStateChange" => format!("{}#{}", event_type, str_at(&["channel", "state"])),
        "Dial" => {
            let dialstatus = str_at(&["dialstatus"]);
            if dialstatus.is_empty() {
                event_type.to_string()
            } else {
                format!("{}#{}", event_type, dialstatus)
            }
        }
        "ChannelEnteredBridge" | "ChannelLeftBridge" => {
            format!("{}#{}", event_type, str_at(&["channel", "id"]))
        }
        "ChannelVarset" => format!("{}#{}", event_type, str_at(&["variable"])),
        "ChannelDtmfReceived" => format!("{}#{}", event_type, str_at(&["digit"])),
        _ => event_type.to_string(),
    }
}

fn extract_value(raw: &Value, event_type: &str) -> String {
    let str_at = |path: &[&str]| -> String {
        let mut cur = raw;
        for key in path {
            match cur.get(key) {
                Some(next) => cur = next,
                None => return String::new(),
            }
        }
        match cur {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    };

    match event_type {
        "ExternalEvent" => str_at(&["value"]),
        "ChannelDtmfReceived" => str_at(&["digit"]),
        "ChannelStateChange" => str_at(&["channel", "name"]),
        "ChannelHangupRequest" => str_at(&["cause"]),
        "ChannelDestroyed" => format!("{}#{}", str_at(&["cause_txt"]), str_at(&["cause"])),
        "ChannelVarset" => str_at(&["value"]),
        "Dial" => str_at(&["dialstring"]),
        "PlaybackStarted" => str_at(&["playback", "media_uri"]),
        "PlaybackFinished" => str_at(&["playback", "state"]),
        _ => String::new(),
    }
}

/// Tolerant ISO-8601 parsing: Asterisk emits `+0300`-style offsets and some
/// upstreams use a space instead of `T`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    let normalized = if !raw.contains('T') && raw.contains(' ') {
        raw.replacen(' ', "T", 1)
    } else {
        raw.to_string()
    };

    for format in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%z"] {
        if let Ok(parsed) = DateTime::parse_from_str(&normalized, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Some(parsed.and_utc());
        }
    }
    None
}
