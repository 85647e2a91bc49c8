use super::chan::ChanNode;
use super::{RoomMsg, RoomSender, StatusUpdate};
use crate::ari::AriClient;
use crate::plan::NodeId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// A live mixing bridge, mirroring one bridge plan node. Each instance owns
/// its own children map.
#[derive(Debug)]
pub struct BridgeNode {
    pub node: NodeId,
    pub tag: String,
    pub bridge_id: String,
    pub chans: HashMap<String, ChanNode>,
    destroyed: bool,
}

impl BridgeNode {
    pub fn new(node: NodeId, tag: &str, bridge_id: &str) -> Self {
        Self {
            node,
            tag: tag.to_string(),
            bridge_id: bridge_id.to_string(),
            chans: HashMap::new(),
            destroyed: false,
        }
    }

    /// Tear down the whole subtree: clips, then channels, then the bridge
    /// itself. Idempotent: the second call is a no-op.
    pub async fn destroy(&mut self, ari: &dyn AriClient, out: &mut Vec<StatusUpdate>) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        info!(bridge_id = self.bridge_id, "destroy bridge");

        for (_, mut chan) in self.chans.drain() {
            chan.destroy(ari, out).await;
        }
        let response = ari.destroy_bridge(&self.bridge_id).await;
        out.push(StatusUpdate::new(
            &self.tag,
            "api_destroy_bridge",
            &response.code_value(),
        ));
    }
}

/// Remote side of Start(): create the mixing bridge and report the result
/// through the room queue.
pub async fn start_bridge(
    ari: Arc<dyn AriClient>,
    room: RoomSender,
    tag: String,
    bridge_id: String,
) {
    info!(bridge_id, "start bridge");
    let send = |msg: RoomMsg| {
        room.send(msg).ok();
    };

    let response = ari.create_bridge(&bridge_id).await;
    send(RoomMsg::Status(StatusUpdate::new(
        &tag,
        "api_create_bridge",
        &response.code_value(),
    )));

    if let Err(e) = response.as_result() {
        send(RoomMsg::Status(StatusUpdate::new(
            &tag,
            "error_create_bridge",
            &e.to_string(),
        )));
        send(RoomMsg::Status(StatusUpdate::new(&tag, "stop", "")));
        send(RoomMsg::StartFailed { tag });
        return;
    }

    ari.subscribe(&format!("bridge:{}", bridge_id)).await;
}
