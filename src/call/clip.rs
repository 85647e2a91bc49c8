use super::{RoomMsg, RoomSender, StatusUpdate};
use crate::ari::AriClient;
use crate::ledger::StatusLedger;
use crate::plan::NodeId;
use std::sync::Arc;
use tracing::info;

/// A media playback on a channel, mirroring one clip plan node.
#[derive(Debug)]
pub struct ClipNode {
    pub node: NodeId,
    pub tag: String,
    pub clip_id: String,
    pub chan_id: String,
    stopped: bool,
}

impl ClipNode {
    pub fn new(node: NodeId, tag: &str, clip_id: &str, chan_id: &str) -> Self {
        Self {
            node,
            tag: tag.to_string(),
            clip_id: clip_id.to_string(),
            chan_id: chan_id.to_string(),
            stopped: false,
        }
    }

    /// Stop the remote playback. Idempotent: the second call is a no-op.
    pub async fn stop(&mut self, ari: &dyn AriClient, out: &mut Vec<StatusUpdate>) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!(clip_id = self.clip_id, "stop clip");
        let response = ari.stop_playback(&self.clip_id).await;
        out.push(StatusUpdate::new(
            &self.tag,
            "api_stop_playback",
            &response.code_value(),
        ));
    }

    /// "Fully played" is computed, not asserted: a finish was recorded, it
    /// did not fail, and nobody stopped the playback explicitly.
    pub fn fully_playback_update(&self, ledger: &StatusLedger) -> Option<StatusUpdate> {
        if !ledger.has(&self.tag, "PlaybackFinished") {
            return None;
        }
        if ledger.first_value(&self.tag, "PlaybackFinished") == Some("failed") {
            return None;
        }
        if ledger.has(&self.tag, "api_stop_playback") {
            return None;
        }
        Some(StatusUpdate::new(&self.tag, "fully_playback", "true"))
    }
}

/// Remote side of Start(): issue the playback call and report through the
/// room queue.
pub async fn start_clip(
    ari: Arc<dyn AriClient>,
    room: RoomSender,
    tag: String,
    clip_id: String,
    chan_id: String,
    media: String,
) {
    info!(clip_id, chan_id, media, "start clip");
    let send = |msg: RoomMsg| {
        room.send(msg).ok();
    };

    let response = ari.start_chan_playback(&chan_id, &clip_id, &media).await;
    send(RoomMsg::Status(StatusUpdate::new(
        &tag,
        "api_start_playback",
        &response.code_value(),
    )));

    if let Err(e) = response.as_result() {
        send(RoomMsg::Status(StatusUpdate::new(
            &tag,
            "error_start_playback",
            &e.to_string(),
        )));
        send(RoomMsg::Status(StatusUpdate::new(&tag, "stop", "")));
        send(RoomMsg::StartFailed { tag });
    }
}
