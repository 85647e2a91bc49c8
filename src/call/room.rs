use super::bridge::{self, BridgeNode};
use super::chan::{self, ChanKind, ChanNode, ChanStart};
use super::clip::{self, ClipNode};
use super::{
    BridgeProjection, CallRequest, ChanProjection, RoomMsg, RoomProjection, RoomSender,
    StatusUpdate,
};
use crate::ari::AriClient;
use crate::correlator::resource_id;
use crate::error::Error;
use crate::ledger::StatusLedger;
use crate::plan::{NodeId, Plan, TriggerAction};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const STATUS_READY: &str = "ready";
pub const STATUS_STOP: &str = "stop";

/// Handle the dispatcher and the HTTP layer keep for a live room. The ledger
/// and projection are read-only views; the actor is their sole writer.
#[derive(Clone)]
pub struct RoomHandle {
    pub call_id: String,
    pub room_id: String,
    pub tag: String,
    pub sender: RoomSender,
    pub ledger: Arc<RwLock<StatusLedger>>,
    pub projection: Arc<RwLock<RoomProjection>>,
}

/// One live call: an actor task owning the per-call plan clone, the status
/// ledger and the live resource tree. Every status write flows through its
/// queue, so each record and the trigger set it fires are atomic with
/// respect to other writers on the same call.
pub struct Room {
    call_id: String,
    tag: String,
    room_id: String,
    plan: Plan,
    root: NodeId,
    request: CallRequest,
    ledger: Arc<RwLock<StatusLedger>>,
    projection: Arc<RwLock<RoomProjection>>,
    bridges: HashMap<String, BridgeNode>,
    ari: Arc<dyn AriClient>,
    tx: RoomSender,
    rx: mpsc::UnboundedReceiver<RoomMsg>,
    token: CancellationToken,
    pending: VecDeque<StatusUpdate>,
}

/// Side effects produced by one trigger-evaluation pass. Trigger flags are
/// flipped while collecting, before any effect runs (flip-then-act).
enum Action {
    RoomStatus {
        status: &'static str,
        value: String,
    },
    StartBridge(NodeId),
    DestroyBridge {
        tag: String,
    },
    StartChan {
        bridge_tag: String,
        node: NodeId,
    },
    DestroyChan {
        bridge_tag: String,
        tag: String,
    },
    StartClip {
        bridge_tag: String,
        chan_tag: String,
        node: NodeId,
    },
    StopClip {
        bridge_tag: String,
        chan_tag: String,
        tag: String,
    },
    ClipFunc {
        bridge_tag: String,
        chan_tag: String,
        tag: String,
        func: String,
    },
}

impl Room {
    pub fn new(
        ari: Arc<dyn AriClient>,
        plan: &Plan,
        request: CallRequest,
        token: CancellationToken,
    ) -> (Room, RoomHandle) {
        let plan = plan.clone_for_call();
        let root = plan.root();
        let tag = plan.node(root).tag.clone();
        let room_id = resource_id(&tag, &request.call_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let ledger = Arc::new(RwLock::new(StatusLedger::default()));
        let projection = Arc::new(RwLock::new(RoomProjection {
            room_id: room_id.clone(),
            bridges: Vec::new(),
        }));

        let handle = RoomHandle {
            call_id: request.call_id.clone(),
            room_id: room_id.clone(),
            tag: tag.clone(),
            sender: tx.clone(),
            ledger: ledger.clone(),
            projection: projection.clone(),
        };
        let room = Room {
            call_id: request.call_id.clone(),
            tag,
            room_id,
            plan,
            root,
            request,
            ledger,
            projection,
            bridges: HashMap::new(),
            ari,
            tx,
            rx,
            token,
            pending: VecDeque::new(),
        };
        (room, handle)
    }

    pub async fn run(mut self) {
        info!(room_id = %self.room_id, "room created");

        let initial = self.plan.node(self.root).initial_status.clone();
        let room_id = self.room_id.clone();
        self.pending
            .push_back(StatusUpdate::new(&self.tag, &initial, &room_id));

        // a room with no start trigger of its own becomes ready immediately
        let gated = self
            .plan
            .node(self.root)
            .triggers
            .iter()
            .any(|t| t.active && t.action == TriggerAction::Start);
        if !gated {
            self.pending
                .push_back(StatusUpdate::new(&self.tag, STATUS_READY, ""));
        }
        self.drain().await;

        let token = self.token.clone();
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(RoomMsg::Status(update)) => {
                        self.pending.push_back(update);
                        self.drain().await;
                    }
                    Some(RoomMsg::StartFailed { tag }) => {
                        self.remove_failed(&tag);
                        self.refresh_projection();
                    }
                    Some(RoomMsg::Reap) | None => break,
                },
                _ = token.cancelled() => break,
            }
        }

        self.shutdown().await;
    }

    /// Apply queued updates until the cascade settles: record one update,
    /// evaluate every level of the live tree, run the fired actions (which
    /// may queue further updates), repeat.
    async fn drain(&mut self) {
        while let Some(update) = self.pending.pop_front() {
            self.record(&update);
            let actions = self.collect_actions();
            self.execute(actions).await;
        }
        self.refresh_projection();
    }

    fn record(&mut self, update: &StatusUpdate) {
        info!(
            room_id = %self.room_id,
            tag = %update.tag,
            status = %update.status,
            "record status"
        );
        self.ledger.write().unwrap().record(
            &update.tag,
            &update.status,
            update.external_time,
            update.correlation_time,
            &update.value,
        );
    }

    /// One trigger-evaluation pass over the room, its bridge slots, each live
    /// bridge's chan slots and each live chan's clip slots. Terminate checks
    /// for existing children run before start checks for absent ones at the
    /// same level, so a tag torn down here is eligible for recreation later
    /// in the same cascade.
    fn collect_actions(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let root = self.root;
        let ledger = self.ledger.read().unwrap();

        for trigger in self.plan.node_mut(root).triggers.iter_mut() {
            if trigger.active
                && trigger.action == TriggerAction::Terminate
                && ledger.has(&trigger.watch_tag, &trigger.watch_status)
            {
                trigger.active = false;
                actions.push(Action::RoomStatus {
                    status: STATUS_STOP,
                    value: String::new(),
                });
            }
        }
        for trigger in self.plan.node_mut(root).triggers.iter_mut() {
            if trigger.active
                && trigger.action == TriggerAction::Start
                && ledger.has(&trigger.watch_tag, &trigger.watch_status)
            {
                trigger.active = false;
                actions.push(Action::RoomStatus {
                    status: STATUS_READY,
                    value: String::new(),
                });
            }
        }

        for slot in self.plan.children(root) {
            let tag = self.plan.node(slot).tag.clone();
            if !self.bridges.contains_key(&tag) {
                continue;
            }
            let mut fired = false;
            for trigger in self.plan.node_mut(slot).triggers.iter_mut() {
                if trigger.active
                    && trigger.action == TriggerAction::Terminate
                    && ledger.has(&trigger.watch_tag, &trigger.watch_status)
                {
                    trigger.active = false;
                    fired = true;
                }
            }
            if fired {
                actions.push(Action::DestroyBridge { tag });
            }
        }
        for slot in self.plan.children(root) {
            let tag = self.plan.node(slot).tag.clone();
            if self.bridges.contains_key(&tag) {
                continue;
            }
            let mut fired = false;
            for trigger in self.plan.node_mut(slot).triggers.iter_mut() {
                if trigger.active
                    && trigger.action == TriggerAction::Start
                    && ledger.has(&trigger.watch_tag, &trigger.watch_status)
                {
                    trigger.active = false;
                    fired = true;
                }
            }
            if fired {
                actions.push(Action::StartBridge(slot));
            }
        }

        let bridge_infos: Vec<(String, NodeId, Vec<String>)> = self
            .bridges
            .values()
            .map(|b| (b.tag.clone(), b.node, b.chans.keys().cloned().collect()))
            .collect();
        for (bridge_tag, bridge_node, chan_tags) in &bridge_infos {
            for slot in self.plan.children(*bridge_node) {
                let tag = self.plan.node(slot).tag.clone();
                if !chan_tags.contains(&tag) {
                    continue;
                }
                let mut fired = false;
                for trigger in self.plan.node_mut(slot).triggers.iter_mut() {
                    if trigger.active
                        && trigger.action == TriggerAction::Terminate
                        && ledger.has(&trigger.watch_tag, &trigger.watch_status)
                    {
                        trigger.active = false;
                        fired = true;
                    }
                }
                if fired {
                    actions.push(Action::DestroyChan {
                        bridge_tag: bridge_tag.clone(),
                        tag,
                    });
                }
            }
            for slot in self.plan.children(*bridge_node) {
                let tag = self.plan.node(slot).tag.clone();
                if chan_tags.contains(&tag) {
                    continue;
                }
                let mut fired = false;
                for trigger in self.plan.node_mut(slot).triggers.iter_mut() {
                    if trigger.active
                        && trigger.action == TriggerAction::Start
                        && ledger.has(&trigger.watch_tag, &trigger.watch_status)
                    {
                        trigger.active = false;
                        fired = true;
                    }
                }
                if fired {
                    actions.push(Action::StartChan {
                        bridge_tag: bridge_tag.clone(),
                        node: slot,
                    });
                }
            }
        }

        let chan_infos: Vec<(String, String, NodeId, Vec<String>)> = self
            .bridges
            .values()
            .flat_map(|b| {
                b.chans.values().map(|c| {
                    (
                        b.tag.clone(),
                        c.tag.clone(),
                        c.node,
                        c.clips.keys().cloned().collect(),
                    )
                })
            })
            .collect();
        for (bridge_tag, chan_tag, chan_node, clip_tags) in &chan_infos {
            for slot in self.plan.children(*chan_node) {
                let tag = self.plan.node(slot).tag.clone();
                if !clip_tags.contains(&tag) {
                    continue;
                }
                let mut fired = false;
                for trigger in self.plan.node_mut(slot).triggers.iter_mut() {
                    if trigger.active
                        && trigger.action == TriggerAction::Terminate
                        && ledger.has(&trigger.watch_tag, &trigger.watch_status)
                    {
                        trigger.active = false;
                        fired = true;
                    }
                }
                if fired {
                    actions.push(Action::StopClip {
                        bridge_tag: bridge_tag.clone(),
                        chan_tag: chan_tag.clone(),
                        tag,
                    });
                }
            }
            for slot in self.plan.children(*chan_node) {
                let tag = self.plan.node(slot).tag.clone();
                if clip_tags.contains(&tag) {
                    continue;
                }
                let mut fired = false;
                for trigger in self.plan.node_mut(slot).triggers.iter_mut() {
                    if trigger.active
                        && trigger.action == TriggerAction::Start
                        && ledger.has(&trigger.watch_tag, &trigger.watch_status)
                    {
                        trigger.active = false;
                        fired = true;
                    }
                }
                if fired {
                    actions.push(Action::StartClip {
                        bridge_tag: bridge_tag.clone(),
                        chan_tag: chan_tag.clone(),
                        node: slot,
                    });
                }
            }

            // invoke-style triggers on live clips
            for clip_tag in clip_tags {
                let clip_node = match self
                    .bridges
                    .get(bridge_tag)
                    .and_then(|b| b.chans.get(chan_tag))
                    .and_then(|c| c.clips.get(clip_tag))
                {
                    Some(clip) => clip.node,
                    None => continue,
                };
                for trigger in self.plan.node_mut(clip_node).triggers.iter_mut() {
                    if trigger.active
                        && trigger.action == TriggerAction::Func
                        && ledger.has(&trigger.watch_tag, &trigger.watch_status)
                    {
                        trigger.active = false;
                        actions.push(Action::ClipFunc {
                            bridge_tag: bridge_tag.clone(),
                            chan_tag: chan_tag.clone(),
                            tag: clip_tag.clone(),
                            func: trigger.func.clone().unwrap_or_default(),
                        });
                    }
                }
            }
        }

        actions
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::RoomStatus { status, value } => {
                    self.pending
                        .push_back(StatusUpdate::new(&self.tag, status, &value));
                }
                Action::StartBridge(node) => self.start_bridge(node),
                Action::DestroyBridge { tag } => {
                    if let Some(mut bridge) = self.bridges.remove(&tag) {
                        let mut out = Vec::new();
                        bridge.destroy(self.ari.as_ref(), &mut out).await;
                        self.pending.extend(out);
                    }
                }
                Action::StartChan { bridge_tag, node } => self.start_chan(&bridge_tag, node),
                Action::DestroyChan { bridge_tag, tag } => {
                    let chan = self
                        .bridges
                        .get_mut(&bridge_tag)
                        .and_then(|b| b.chans.remove(&tag));
                    if let Some(mut chan) = chan {
                        let mut out = Vec::new();
                        chan.destroy(self.ari.as_ref(), &mut out).await;
                        self.pending.extend(out);
                    }
                }
                Action::StartClip {
                    bridge_tag,
                    chan_tag,
                    node,
                } => self.start_clip(&bridge_tag, &chan_tag, node),
                Action::StopClip {
                    bridge_tag,
                    chan_tag,
                    tag,
                } => {
                    let clip = self
                        .bridges
                        .get_mut(&bridge_tag)
                        .and_then(|b| b.chans.get_mut(&chan_tag))
                        .and_then(|c| c.clips.remove(&tag));
                    if let Some(mut clip) = clip {
                        let mut out = Vec::new();
                        clip.stop(self.ari.as_ref(), &mut out).await;
                        self.pending.extend(out);
                    }
                }
                Action::ClipFunc {
                    bridge_tag,
                    chan_tag,
                    tag,
                    func,
                } => self.run_clip_func(&bridge_tag, &chan_tag, &tag, &func),
            }
        }
    }

    fn start_bridge(&mut self, node: NodeId) {
        let plan_node = self.plan.node(node);
        let tag = plan_node.tag.clone();
        let initial = plan_node.initial_status.clone();
        if self.bridges.contains_key(&tag) {
            return;
        }
        let bridge_id = resource_id(&tag, &self.call_id);
        self.bridges
            .insert(tag.clone(), BridgeNode::new(node, &tag, &bridge_id));
        self.pending
            .push_back(StatusUpdate::new(&tag, &initial, &bridge_id));
        tokio::spawn(bridge::start_bridge(
            self.ari.clone(),
            self.tx.clone(),
            tag,
            bridge_id,
        ));
    }

    fn start_chan(&mut self, bridge_tag: &str, node: NodeId) {
        let plan_node = self.plan.node(node);
        let tag = plan_node.tag.clone();
        let initial = plan_node.initial_status.clone();
        let kind = ChanKind::from_plan(&plan_node.kind, &tag);
        let chan_id = resource_id(&tag, &self.call_id);
        self.pending
            .push_back(StatusUpdate::new(&tag, &initial, &chan_id));

        let start = match self.resolve_chan_start(node, kind) {
            Ok(start) => start,
            Err(e) => {
                warn!(tag = %tag, chan_id = %chan_id, "{}", e);
                self.pending
                    .push_back(StatusUpdate::new(&tag, "dialplan_error", &e.to_string()));
                self.pending
                    .push_back(StatusUpdate::new(&tag, STATUS_STOP, ""));
                return;
            }
        };

        let Some(bridge) = self.bridges.get_mut(bridge_tag) else {
            return;
        };
        let bridge_id = bridge.bridge_id.clone();
        bridge
            .chans
            .insert(tag.clone(), ChanNode::new(node, &tag, &chan_id, kind));
        tokio::spawn(chan::start_chan(
            self.ari.clone(),
            self.tx.clone(),
            tag,
            chan_id,
            bridge_id,
            start,
        ));
    }

    fn resolve_chan_start(&self, node: NodeId, kind: ChanKind) -> Result<ChanStart, Error> {
        let plan_node = self.plan.node(node);
        match kind {
            ChanKind::Outbound => {
                let name = plan_node.str_param("dial_option_name").unwrap_or_default();
                let option = self.request.dial_options.get(name).ok_or_else(|| {
                    Error::Dialplan(format!("no dial option named {:?}", name))
                })?;
                Ok(ChanStart::Outbound {
                    endpoint: option.endpoint(),
                    callerid: option.callerid.clone(),
                    dial_timeout: option.dial_timeout,
                })
            }
            ChanKind::Inbound => Ok(ChanStart::Inbound),
            ChanKind::Snoop => {
                let target = plan_node.str_param("target_chan_tag").unwrap_or_default();
                let known = !target.is_empty() && self.ledger.read().unwrap().has_tag(target);
                if !known {
                    return Err(Error::Dialplan(format!(
                        "snoop target tag {:?} has no recorded status",
                        target
                    )));
                }
                Ok(ChanStart::Snoop {
                    target_chan_id: resource_id(target, &self.call_id),
                })
            }
            ChanKind::ExternalMedia => {
                let host = plan_node.str_param("external_host").unwrap_or_default();
                if host.is_empty() {
                    return Err(Error::Dialplan(
                        "external_host is missing or empty".to_string(),
                    ));
                }
                Ok(ChanStart::ExternalMedia {
                    external_host: host.to_string(),
                })
            }
        }
    }

    fn start_clip(&mut self, bridge_tag: &str, chan_tag: &str, node: NodeId) {
        let plan_node = self.plan.node(node);
        let tag = plan_node.tag.clone();
        let initial = plan_node.initial_status.clone();
        let audio = plan_node
            .str_param("audio_name")
            .unwrap_or_default()
            .to_string();
        let clip_id = resource_id(&tag, &self.call_id);
        self.pending
            .push_back(StatusUpdate::new(&tag, &initial, &clip_id));

        if audio.is_empty() {
            warn!(tag = %tag, "clip without audio_name");
            self.pending
                .push_back(StatusUpdate::new(&tag, "error_in_audio_name", ""));
            self.pending
                .push_back(StatusUpdate::new(&tag, STATUS_STOP, ""));
            return;
        }

        let chan = self
            .bridges
            .get_mut(bridge_tag)
            .and_then(|b| b.chans.get_mut(chan_tag));
        let Some(chan) = chan else {
            return;
        };
        let chan_id = chan.chan_id.clone();
        chan.clips
            .insert(tag.clone(), ClipNode::new(node, &tag, &clip_id, &chan_id));
        tokio::spawn(clip::start_clip(
            self.ari.clone(),
            self.tx.clone(),
            tag,
            clip_id,
            chan_id,
            format!("sound:{}", audio),
        ));
    }

    fn run_clip_func(&mut self, bridge_tag: &str, chan_tag: &str, tag: &str, func: &str) {
        match func {
            "check_fully_playback" => {
                let clip = self
                    .bridges
                    .get(bridge_tag)
                    .and_then(|b| b.chans.get(chan_tag))
                    .and_then(|c| c.clips.get(tag));
                if let Some(clip) = clip {
                    let update = {
                        let ledger = self.ledger.read().unwrap();
                        clip.fully_playback_update(&ledger)
                    };
                    if let Some(update) = update {
                        self.pending.push_back(update);
                    }
                }
            }
            other => warn!(func = other, tag = %tag, "unknown trigger func, ignoring"),
        }
    }

    fn remove_failed(&mut self, tag: &str) {
        debug!(room_id = %self.room_id, tag = %tag, "remove failed node");
        if self.bridges.remove(tag).is_some() {
            return;
        }
        for bridge in self.bridges.values_mut() {
            if bridge.chans.remove(tag).is_some() {
                return;
            }
            for chan in bridge.chans.values_mut() {
                if chan.clips.remove(tag).is_some() {
                    return;
                }
            }
        }
    }

    /// Fan-out cleanup at end of life: destroy every remaining live resource
    /// top-down and record the results without re-running the cascade (no
    /// transitions are defined out of `stop`).
    async fn shutdown(&mut self) {
        let tags: Vec<String> = self.bridges.keys().cloned().collect();
        for tag in tags {
            if let Some(mut bridge) = self.bridges.remove(&tag) {
                let mut out = Vec::new();
                bridge.destroy(self.ari.as_ref(), &mut out).await;
                for update in out {
                    self.record(&update);
                }
            }
        }
        self.refresh_projection();
        info!(room_id = %self.room_id, "room closed");
    }

    fn refresh_projection(&self) {
        let mut bridges: Vec<BridgeProjection> = self
            .bridges
            .values()
            .map(|bridge| {
                let mut chans: Vec<ChanProjection> = bridge
                    .chans
                    .values()
                    .map(|chan| ChanProjection {
                        chan_id: chan.chan_id.clone(),
                        tag: chan.tag.clone(),
                        kind: chan.kind.as_str().to_string(),
                        clips: chan.clips.values().map(|c| c.clip_id.clone()).collect(),
                    })
                    .collect();
                chans.sort_by(|a, b| a.tag.cmp(&b.tag));
                BridgeProjection {
                    bridge_id: bridge.bridge_id.clone(),
                    tag: bridge.tag.clone(),
                    chans,
                }
            })
            .collect();
        bridges.sort_by(|a, b| a.tag.cmp(&b.tag));
        *self.projection.write().unwrap() = RoomProjection {
            room_id: self.room_id.clone(),
            bridges,
        };
    }
}
