use super::clip::ClipNode;
use super::{RoomMsg, RoomSender, StatusUpdate};
use crate::ari::AriClient;
use crate::plan::NodeId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Hangup cause sent when a channel is deleted during teardown.
const HANGUP_REASON_CODE: u16 = 21;

/// The closed set of channel behaviors. The plan declares the variant as a
/// type string; anything unrecognized degrades to the most generic one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanKind {
    Outbound,
    Inbound,
    Snoop,
    ExternalMedia,
}

impl ChanKind {
    pub fn from_plan(kind: &str, tag: &str) -> Self {
        match kind {
            "chan_outbound" => ChanKind::Outbound,
            "chan_inbound" => ChanKind::Inbound,
            "chan_snoop" => ChanKind::Snoop,
            "chan_emedia" => ChanKind::ExternalMedia,
            other => {
                warn!(tag, kind = other, "unrecognized chan type, using chan_outbound");
                ChanKind::Outbound
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChanKind::Outbound => "chan_outbound",
            ChanKind::Inbound => "chan_inbound",
            ChanKind::Snoop => "chan_snoop",
            ChanKind::ExternalMedia => "chan_emedia",
        }
    }
}

/// Start parameters with every call-dependent precondition already
/// resolved; the room checks those before the task is spawned.
#[derive(Debug, Clone)]
pub enum ChanStart {
    Outbound {
        endpoint: String,
        callerid: String,
        dial_timeout: u32,
    },
    Inbound,
    Snoop {
        target_chan_id: String,
    },
    ExternalMedia {
        external_host: String,
    },
}

/// A live channel, mirroring one chan plan node.
#[derive(Debug)]
pub struct ChanNode {
    pub node: NodeId,
    pub tag: String,
    pub chan_id: String,
    pub kind: ChanKind,
    pub clips: HashMap<String, ClipNode>,
    destroyed: bool,
}

impl ChanNode {
    pub fn new(node: NodeId, tag: &str, chan_id: &str, kind: ChanKind) -> Self {
        Self {
            node,
            tag: tag.to_string(),
            chan_id: chan_id.to_string(),
            kind,
            clips: HashMap::new(),
            destroyed: false,
        }
    }

    /// Tear down this channel and everything it owns, top-down. Idempotent.
    pub async fn destroy(&mut self, ari: &dyn AriClient, out: &mut Vec<StatusUpdate>) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        info!(chan_id = self.chan_id, "destroy chan");

        for (_, mut clip) in self.clips.drain() {
            clip.stop(ari, out).await;
        }
        let response = ari.delete_chan(&self.chan_id, HANGUP_REASON_CODE).await;
        out.push(StatusUpdate::new(
            &self.tag,
            "api_delete_chan",
            &response.code_value(),
        ));
    }
}

/// Remote side of Start(): create the channel per variant, then wire it into
/// its bridge. Every step reports into the room queue; a failed create is
/// terminal for this subtree only.
pub async fn start_chan(
    ari: Arc<dyn AriClient>,
    room: RoomSender,
    tag: String,
    chan_id: String,
    bridge_id: String,
    start: ChanStart,
) {
    info!(chan_id, bridge_id, "start chan");
    let send = |msg: RoomMsg| {
        room.send(msg).ok();
    };

    let create = match &start {
        ChanStart::Outbound {
            endpoint, callerid, ..
        } => ari.create_chan(&chan_id, endpoint, callerid).await,
        ChanStart::Inbound => ari.answer_chan(&chan_id).await,
        ChanStart::Snoop { target_chan_id } => {
            ari.create_snoop_chan(target_chan_id, &chan_id, "in", "none")
                .await
        }
        ChanStart::ExternalMedia { external_host } => {
            ari.create_emedia_chan(&chan_id, external_host).await
        }
    };
    send(RoomMsg::Status(StatusUpdate::new(
        &tag,
        "api_create_chan",
        &create.code_value(),
    )));

    if let Err(e) = create.as_result() {
        send(RoomMsg::Status(StatusUpdate::new(
            &tag,
            "error_create_chan",
            &e.to_string(),
        )));
        send(RoomMsg::Status(StatusUpdate::new(&tag, "stop", "")));
        send(RoomMsg::StartFailed { tag });
        return;
    }

    ari.subscribe(&format!("channel:{}", chan_id)).await;

    let added = ari.add_channel_to_bridge(&bridge_id, &chan_id).await;
    send(RoomMsg::Status(StatusUpdate::new(
        &tag,
        "api_chan2bridge",
        &added.code_value(),
    )));

    if let ChanStart::Outbound { dial_timeout, .. } = start {
        let dialed = ari.dial_chan(&chan_id, dial_timeout).await;
        send(RoomMsg::Status(StatusUpdate::new(
            &tag,
            "api_dial_chan",
            &dialed.code_value(),
        )));
    }
}
