use super::room::{Room, RoomHandle, STATUS_STOP};
use super::{CallRequest, RoomMsg, RoomProjection, StatusUpdate};
use crate::ari::AriClient;
use crate::correlator::TriggerEvent;
use crate::error::Error;
use crate::plan::Plan;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REAP_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Owns the set of live rooms keyed by call id: admits new calls, routes
/// inbound trigger events to the owning room and reaps terminated rooms
/// after a grace window.
pub struct Dispatcher {
    ari: Arc<dyn AriClient>,
    plans: HashMap<String, Plan>,
    rooms: RwLock<HashMap<String, RoomHandle>>,
    closed: AtomicBool,
    grace: ChronoDuration,
    token: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        ari: Arc<dyn AriClient>,
        plans: HashMap<String, Plan>,
        grace_period_secs: u64,
        token: CancellationToken,
    ) -> Self {
        Self {
            ari,
            plans,
            rooms: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            grace: ChronoDuration::seconds(grace_period_secs as i64),
            token,
        }
    }

    /// Admit one call: clone the named plan, build a Room and start it. No
    /// two live rooms may share a call id.
    pub fn admit(&self, request: CallRequest) -> Result<RoomHandle, Error> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::AdmissionClosed);
        }
        let plan = self
            .plans
            .get(&request.flow)
            .ok_or_else(|| Error::MalformedPlan(format!("unknown call flow {:?}", request.flow)))?;

        let mut rooms = self.rooms.write().unwrap();
        if rooms.contains_key(&request.call_id) {
            return Err(Error::DuplicateCall(request.call_id));
        }

        let call_id = request.call_id.clone();
        let (room, handle) = Room::new(
            self.ari.clone(),
            plan,
            request,
            self.token.child_token(),
        );
        info!(call_id = %call_id, room_id = %handle.room_id, "call admitted");
        tokio::spawn(room.run());
        rooms.insert(call_id, handle.clone());
        Ok(handle)
    }

    /// Route one event to the owning room. Unknown call ids are dropped
    /// silently: the call may have been reaped already, or the resource was
    /// never ours.
    pub fn route(&self, event: TriggerEvent) {
        let rooms = self.rooms.read().unwrap();
        match rooms.get(&event.call_id) {
            Some(handle) => {
                handle
                    .sender
                    .send(RoomMsg::Status(StatusUpdate::from_event(event)))
                    .ok();
            }
            None => {
                debug!(call_id = %event.call_id, status = %event.status, "drop event for unknown call");
            }
        }
    }

    /// Inject a terminal status for one call from the control API.
    pub fn hangup(&self, call_id: &str) -> Result<(), Error> {
        let rooms = self.rooms.read().unwrap();
        let handle = rooms
            .get(call_id)
            .ok_or_else(|| Error::UnknownCall(call_id.to_string()))?;
        let event = TriggerEvent::synthetic(call_id, &handle.tag, STATUS_STOP, "api_hangup");
        handle
            .sender
            .send(RoomMsg::Status(StatusUpdate::from_event(event)))
            .ok();
        Ok(())
    }

    pub fn close_admission(&self) {
        self.closed.store(true, Ordering::Relaxed);
        info!("admission closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap().len()
    }

    /// Remove every room whose own tag reached `stop` more than a grace
    /// window ago, giving in-flight side effects tied to that status time to
    /// complete first.
    pub fn reap_terminated(&self) {
        let deadline = Utc::now() - self.grace;
        let expired: Vec<(String, RoomHandle)> = {
            let rooms = self.rooms.read().unwrap();
            rooms
                .iter()
                .filter(|(_, handle)| {
                    handle
                        .ledger
                        .read()
                        .unwrap()
                        .first_time(&handle.tag, STATUS_STOP)
                        .map(|stopped| stopped < deadline)
                        .unwrap_or(false)
                })
                .map(|(call_id, handle)| (call_id.clone(), handle.clone()))
                .collect()
        };

        if expired.is_empty() {
            return;
        }
        let mut rooms = self.rooms.write().unwrap();
        for (call_id, handle) in expired {
            info!(call_id = %call_id, room_id = %handle.room_id, "reap terminated room");
            handle.sender.send(RoomMsg::Reap).ok();
            rooms.remove(&call_id);
        }
    }

    /// Consume the inbound event queue and run the periodic reaper sweep
    /// until cancelled.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<TriggerEvent>) {
        let mut sweep = tokio::time::interval(REAP_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.route(event),
                    None => break,
                },
                _ = sweep.tick() => self.reap_terminated(),
                _ = self.token.cancelled() => break,
            }
        }
        info!("dispatcher stopped");
    }

    /// Stop admitting and give live calls a bounded window to drain before
    /// the caller force-cancels everything.
    pub async fn shutdown(&self, wait: Duration) {
        self.close_admission();
        let deadline = tokio::time::Instant::now() + wait;
        while self.room_count() > 0 && tokio::time::Instant::now() < deadline {
            self.reap_terminated();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        let remaining = self.room_count();
        if remaining > 0 {
            warn!(remaining, "shutdown wait elapsed with live calls");
        }
    }

    // read-only projections for the control API

    pub fn rooms_view(&self) -> Value {
        let rooms = self.rooms.read().unwrap();
        let view: serde_json::Map<String, Value> = rooms
            .values()
            .map(|handle| {
                let ledger = handle.ledger.read().unwrap();
                (
                    handle.room_id.clone(),
                    serde_json::to_value(&*ledger).unwrap_or(Value::Null),
                )
            })
            .collect();
        Value::Object(view)
    }

    pub fn bridges_view(&self) -> Vec<String> {
        let rooms = self.rooms.read().unwrap();
        let mut bridges: Vec<String> = rooms
            .values()
            .flat_map(|handle| {
                let projection: RoomProjection = handle.projection.read().unwrap().clone();
                projection
                    .bridges
                    .into_iter()
                    .map(|bridge| bridge.bridge_id)
            })
            .collect();
        bridges.sort();
        bridges
    }

    pub fn chans_view(&self) -> Vec<Value> {
        let rooms = self.rooms.read().unwrap();
        let mut chans: Vec<Value> = Vec::new();
        for handle in rooms.values() {
            let projection: RoomProjection = handle.projection.read().unwrap().clone();
            for bridge in projection.bridges {
                for chan in bridge.chans {
                    chans.push(json!({
                        "chan_id": chan.chan_id,
                        "tag": chan.tag,
                        "kind": chan.kind,
                        "bridge_id": bridge.bridge_id,
                        "clips": chan.clips,
                    }));
                }
            }
        }
        chans
    }

    /// Max and mean correlator delay in seconds across every live room's
    /// ledger records that carry both timestamps.
    pub fn delay_stats(&self) -> (f64, f64) {
        let rooms = self.rooms.read().unwrap();
        let mut delays: Vec<f64> = Vec::new();
        for handle in rooms.values() {
            let ledger = handle.ledger.read().unwrap();
            for (_, _, record) in ledger.records() {
                if let (Some(external), Some(correlation)) =
                    (record.external_time, record.correlation_time)
                {
                    delays.push((correlation - external).num_milliseconds() as f64 / 1000.0);
                }
            }
        }
        if delays.is_empty() {
            return (0.0, 0.0);
        }
        let max = delays.iter().cloned().fold(f64::MIN, f64::max);
        let avg = delays.iter().sum::<f64>() / delays.len() as f64;
        (max, avg)
    }
}
