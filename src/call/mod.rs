use crate::correlator::TriggerEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

pub mod bridge;
pub mod chan;
pub mod clip;
pub mod dispatcher;
pub mod room;
#[cfg(test)]
mod tests;

pub use dispatcher::Dispatcher;
pub use room::{Room, RoomHandle};

/// Dial parameters for one named option of a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialOption {
    pub gate: String,
    pub phone: String,
    #[serde(default)]
    pub phone_prefix: String,
    #[serde(default)]
    pub callerid: String,
    #[serde(default = "DialOption::default_dial_timeout")]
    pub dial_timeout: u32,
}

impl DialOption {
    fn default_dial_timeout() -> u32 {
        60
    }

    pub fn endpoint(&self) -> String {
        format!("SIP/{}/{}{}", self.gate, self.phone_prefix, self.phone)
    }
}

/// Everything needed to build a Room; immutable once admitted.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub call_id: String,
    pub flow: String,
    pub dial_options: HashMap<String, DialOption>,
}

/// One (tag, status) occurrence on its way into a call's ledger.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub tag: String,
    pub status: String,
    pub external_time: Option<DateTime<Utc>>,
    pub correlation_time: Option<DateTime<Utc>>,
    pub value: String,
}

impl StatusUpdate {
    pub fn new(tag: &str, status: &str, value: &str) -> Self {
        Self {
            tag: tag.to_string(),
            status: status.to_string(),
            external_time: None,
            correlation_time: None,
            value: value.to_string(),
        }
    }

    pub fn from_event(event: TriggerEvent) -> Self {
        Self {
            tag: event.tag,
            status: event.status,
            external_time: event.external_time,
            correlation_time: Some(event.correlation_time),
            value: event.value,
        }
    }
}

/// Messages consumed by a room actor. Status writes are fire-and-forget:
/// senders enqueue and return, the actor applies them in FIFO order.
#[derive(Debug)]
pub enum RoomMsg {
    Status(StatusUpdate),
    /// A spawned start task gave up; the node is removed from the live tree.
    StartFailed { tag: String },
    Reap,
}

pub type RoomSender = mpsc::UnboundedSender<RoomMsg>;

/// Read-only view of a room's live tree, shared with the HTTP layer.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RoomProjection {
    pub room_id: String,
    pub bridges: Vec<BridgeProjection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeProjection {
    pub bridge_id: String,
    pub tag: String,
    pub chans: Vec<ChanProjection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChanProjection {
    pub chan_id: String,
    pub tag: String,
    pub kind: String,
    pub clips: Vec<String>,
}
