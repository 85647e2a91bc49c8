use super::bridge::BridgeNode;
use super::room::{Room, STATUS_STOP};
use super::{CallRequest, DialOption, Dispatcher, RoomMsg, StatusUpdate};
use crate::ari::{AriResponse, MockAriClient};
use crate::correlator::{resource_id, TriggerEvent};
use crate::plan::Plan;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

fn ok_response() -> AriResponse {
    AriResponse {
        http_code: 200,
        success: true,
        message: String::new(),
        body: Value::Null,
    }
}

fn err_response(code: u16) -> AriResponse {
    AriResponse {
        http_code: code,
        success: false,
        message: "Allocation failed".to_string(),
        body: Value::Null,
    }
}

fn request(call_id: &str) -> CallRequest {
    let mut dial_options = HashMap::new();
    for name in ["intphone", "extphone"] {
        dial_options.insert(
            name.to_string(),
            DialOption {
                gate: "asterisk_extapi-1".to_string(),
                phone: "5551000".to_string(),
                phone_prefix: String::new(),
                callerid: "12345".to_string(),
                dial_timeout: 50,
            },
        );
    }
    CallRequest {
        call_id: call_id.to_string(),
        flow: "test".to_string(),
        dial_options,
    }
}

fn room_with_bridge_plan() -> Plan {
    Plan::from_value(&json!({
        "tag": "room",
        "type": "room",
        "status": "init",
        "content": [
            {
                "tag": "main-bridge",
                "type": "bridge",
                "status": "init",
                "triggers": [
                    {"trigger_tag": "room", "trigger_status": "ready", "action": "start"}
                ]
            }
        ]
    }))
    .unwrap()
}

fn room_bridge_chan_plan() -> Plan {
    Plan::from_value(&json!({
        "tag": "room",
        "type": "room",
        "status": "init",
        "content": [
            {
                "tag": "main-bridge",
                "type": "bridge",
                "status": "init",
                "triggers": [
                    {"trigger_tag": "room", "trigger_status": "ready", "action": "start"}
                ],
                "content": [
                    {
                        "tag": "oper",
                        "type": "chan_outbound",
                        "status": "init",
                        "params": {"dial_option_name": "intphone"},
                        "triggers": [
                            {"trigger_tag": "main-bridge", "trigger_status": "api_create_bridge", "action": "start"}
                        ]
                    }
                ]
            }
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn room_ready_starts_exactly_one_bridge() {
    let mut ari = MockAriClient::new();
    ari.expect_create_bridge()
        .times(1)
        .returning(|_| ok_response());
    ari.expect_subscribe().returning(|_| ok_response());
    ari.expect_destroy_bridge().returning(|_| ok_response());

    let plan = room_with_bridge_plan();
    let (room, handle) = Room::new(
        Arc::new(ari),
        &plan,
        request("X100"),
        CancellationToken::new(),
    );
    let task = tokio::spawn(room.run());
    sleep(Duration::from_millis(100)).await;

    {
        let ledger = handle.ledger.read().unwrap();
        assert!(ledger.has("room", "init"));
        assert!(ledger.has("room", "ready"));
        assert!(ledger.has("main-bridge", "init"));
    }
    let projection = handle.projection.read().unwrap().clone();
    assert_eq!(projection.bridges.len(), 1);
    assert_eq!(projection.bridges[0].bridge_id, "main-bridge-call-X100");

    // a duplicate notification must not create a second bridge: the mock's
    // times(1) fails the test if create_bridge is issued again
    handle
        .sender
        .send(RoomMsg::Status(StatusUpdate::new("room", "ready", "")))
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let projection = handle.projection.read().unwrap().clone();
    assert_eq!(projection.bridges.len(), 1);

    handle.sender.send(RoomMsg::Reap).unwrap();
    sleep(Duration::from_millis(50)).await;
    task.abort();
}

#[tokio::test]
async fn failed_chan_create_is_terminal_for_the_chan_only() {
    let mut ari = MockAriClient::new();
    ari.expect_create_bridge().returning(|_| ok_response());
    ari.expect_subscribe().returning(|_| ok_response());
    ari.expect_create_chan()
        .times(1)
        .returning(|_, _, _| err_response(500));
    ari.expect_destroy_bridge().returning(|_| ok_response());

    let plan = room_bridge_chan_plan();
    let (room, handle) = Room::new(
        Arc::new(ari),
        &plan,
        request("X200"),
        CancellationToken::new(),
    );
    let task = tokio::spawn(room.run());
    sleep(Duration::from_millis(200)).await;

    {
        let ledger = handle.ledger.read().unwrap();
        assert_eq!(ledger.first_value("oper", "api_create_chan"), Some("500"));
        assert!(ledger.has("oper", "error_create_chan"));
        assert!(ledger.has("oper", STATUS_STOP));
        // the room itself is unaffected
        assert!(!ledger.has("room", STATUS_STOP));
    }

    // the failed chan never stays in the bridge's live-children map
    let projection = handle.projection.read().unwrap().clone();
    assert_eq!(projection.bridges.len(), 1);
    assert!(projection.bridges[0].chans.is_empty());

    handle.sender.send(RoomMsg::Reap).unwrap();
    sleep(Duration::from_millis(50)).await;
    task.abort();
}

#[tokio::test]
async fn live_resource_ids_derive_from_tag_and_call_id() {
    let mut ari = MockAriClient::new();
    ari.expect_create_bridge().returning(|_| ok_response());
    ari.expect_subscribe().returning(|_| ok_response());
    ari.expect_create_chan().returning(|_, _, _| ok_response());
    ari.expect_add_channel_to_bridge()
        .returning(|_, _| ok_response());
    ari.expect_dial_chan().returning(|_, _| ok_response());

    let plan = room_bridge_chan_plan();
    let (room, handle) = Room::new(
        Arc::new(ari),
        &plan,
        request("X300"),
        CancellationToken::new(),
    );
    let task = tokio::spawn(room.run());
    sleep(Duration::from_millis(200)).await;

    let projection = handle.projection.read().unwrap().clone();
    let mut seen = Vec::new();
    for bridge in &projection.bridges {
        assert_eq!(bridge.bridge_id, resource_id(&bridge.tag, "X300"));
        seen.push(bridge.bridge_id.clone());
        for chan in &bridge.chans {
            assert_eq!(chan.chan_id, resource_id(&chan.tag, "X300"));
            seen.push(chan.chan_id.clone());
        }
    }
    assert!(!seen.is_empty());
    let unique: std::collections::HashSet<_> = seen.iter().collect();
    assert_eq!(unique.len(), seen.len());

    task.abort();
}

#[tokio::test]
async fn snoop_without_known_target_is_a_dialplan_error() {
    let mut ari = MockAriClient::new();
    ari.expect_create_bridge().returning(|_| ok_response());
    ari.expect_subscribe().returning(|_| ok_response());
    // create_snoop_chan must never be issued

    let plan = Plan::from_value(&json!({
        "tag": "room",
        "type": "room",
        "content": [
            {
                "tag": "main-bridge",
                "type": "bridge",
                "triggers": [
                    {"trigger_tag": "room", "trigger_status": "ready", "action": "start"}
                ],
                "content": [
                    {
                        "tag": "spy",
                        "type": "chan_snoop",
                        "params": {"target_chan_tag": "nobody"},
                        "triggers": [
                            {"trigger_tag": "main-bridge", "trigger_status": "api_create_bridge", "action": "start"}
                        ]
                    }
                ]
            }
        ]
    }))
    .unwrap();

    let (room, handle) = Room::new(
        Arc::new(ari),
        &plan,
        request("X400"),
        CancellationToken::new(),
    );
    let task = tokio::spawn(room.run());
    sleep(Duration::from_millis(200)).await;

    {
        let ledger = handle.ledger.read().unwrap();
        assert!(ledger.has("spy", "dialplan_error"));
        assert!(ledger.has("spy", STATUS_STOP));
    }
    let projection = handle.projection.read().unwrap().clone();
    assert!(projection.bridges[0].chans.is_empty());

    task.abort();
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let mut ari = MockAriClient::new();
    ari.expect_destroy_bridge()
        .times(1)
        .returning(|_| ok_response());

    let mut bridge = BridgeNode::new(1, "main-bridge", "main-bridge-call-X1");
    let mut out = Vec::new();
    bridge.destroy(&ari, &mut out).await;
    bridge.destroy(&ari, &mut out).await;

    let destroys: Vec<_> = out
        .iter()
        .filter(|u| u.status == "api_destroy_bridge")
        .collect();
    assert_eq!(destroys.len(), 1);
}

#[tokio::test]
async fn duplicate_admission_is_rejected() {
    let mut ari = MockAriClient::new();
    ari.expect_create_bridge().returning(|_| ok_response());
    ari.expect_subscribe().returning(|_| ok_response());

    let mut plans = HashMap::new();
    plans.insert("test".to_string(), room_with_bridge_plan());
    let dispatcher = Dispatcher::new(Arc::new(ari), plans, 60, CancellationToken::new());

    dispatcher.admit(request("X500")).unwrap();
    match dispatcher.admit(request("X500")) {
        Err(crate::Error::DuplicateCall(id)) => assert_eq!(id, "X500"),
        other => panic!("expected DuplicateCall, got {:?}", other.map(|h| h.room_id)),
    }
    assert_eq!(dispatcher.room_count(), 1);
}

#[tokio::test]
async fn closed_admission_is_rejected() {
    let ari = MockAriClient::new();
    let mut plans = HashMap::new();
    plans.insert("test".to_string(), room_with_bridge_plan());
    let dispatcher = Dispatcher::new(Arc::new(ari), plans, 60, CancellationToken::new());

    dispatcher.close_admission();
    match dispatcher.admit(request("X600")) {
        Err(crate::Error::AdmissionClosed) => {}
        other => panic!("expected AdmissionClosed, got {:?}", other.map(|h| h.room_id)),
    }
}

#[tokio::test]
async fn events_for_unknown_calls_are_dropped() {
    let ari = MockAriClient::new();
    let mut plans = HashMap::new();
    plans.insert("test".to_string(), room_with_bridge_plan());
    let dispatcher = Dispatcher::new(Arc::new(ari), plans, 60, CancellationToken::new());

    let event = TriggerEvent::synthetic("X999", "room", "stop", "");
    dispatcher.route(event);
    assert_eq!(dispatcher.room_count(), 0);
}

#[tokio::test]
async fn hangup_stops_the_room_and_reaper_removes_it() {
    let mut ari = MockAriClient::new();
    ari.expect_create_bridge().returning(|_| ok_response());
    ari.expect_subscribe().returning(|_| ok_response());
    ari.expect_destroy_bridge().returning(|_| ok_response());

    let mut plans = HashMap::new();
    plans.insert("test".to_string(), room_with_bridge_plan());
    // zero grace so the sweep reaps immediately after the stop record
    let dispatcher = Dispatcher::new(Arc::new(ari), plans, 0, CancellationToken::new());

    let handle = dispatcher.admit(request("X700")).unwrap();
    sleep(Duration::from_millis(100)).await;

    dispatcher.hangup("X700").unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(handle.ledger.read().unwrap().has("room", STATUS_STOP));

    sleep(Duration::from_millis(50)).await;
    dispatcher.reap_terminated();
    assert_eq!(dispatcher.room_count(), 0);

    match dispatcher.hangup("X700") {
        Err(crate::Error::UnknownCall(_)) => {}
        other => panic!("expected UnknownCall, got {:?}", other),
    }
}

#[tokio::test]
async fn terminate_trigger_tears_down_and_allows_recreation() {
    let mut ari = MockAriClient::new();
    ari.expect_create_bridge()
        .times(2)
        .returning(|_| ok_response());
    ari.expect_subscribe().returning(|_| ok_response());
    ari.expect_destroy_bridge()
        .times(1)
        .returning(|_| ok_response());

    let plan = Plan::from_value(&json!({
        "tag": "room",
        "type": "room",
        "content": [
            {
                "tag": "main-bridge",
                "type": "bridge",
                "triggers": [
                    {"trigger_tag": "room", "trigger_status": "ready", "action": "start"},
                    {"trigger_tag": "room", "trigger_status": "retry", "action": "terminate"},
                    {"trigger_tag": "main-bridge", "trigger_status": "api_destroy_bridge", "action": "start"}
                ]
            }
        ]
    }))
    .unwrap();

    let (room, handle) = Room::new(
        Arc::new(ari),
        &plan,
        request("X800"),
        CancellationToken::new(),
    );
    let task = tokio::spawn(room.run());
    sleep(Duration::from_millis(100)).await;

    // the terminate fires, the tag is torn down and the second start trigger
    // recreates it within the same cascade
    handle
        .sender
        .send(RoomMsg::Status(StatusUpdate::new("room", "retry", "")))
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    {
        let ledger = handle.ledger.read().unwrap();
        assert!(ledger.has("main-bridge", "api_destroy_bridge"));
    }
    let projection = handle.projection.read().unwrap().clone();
    assert_eq!(projection.bridges.len(), 1);

    task.abort();
}

#[tokio::test]
async fn clip_full_playback_is_computed_from_the_ledger() {
    let mut ari = MockAriClient::new();
    ari.expect_create_bridge().returning(|_| ok_response());
    ari.expect_subscribe().returning(|_| ok_response());
    ari.expect_create_chan().returning(|_, _, _| ok_response());
    ari.expect_add_channel_to_bridge()
        .returning(|_, _| ok_response());
    ari.expect_dial_chan().returning(|_, _| ok_response());
    ari.expect_start_chan_playback()
        .returning(|_, _, _| ok_response());

    let plan = Plan::from_value(&json!({
        "tag": "room",
        "type": "room",
        "content": [
            {
                "tag": "main-bridge",
                "type": "bridge",
                "triggers": [
                    {"trigger_tag": "room", "trigger_status": "ready", "action": "start"}
                ],
                "content": [
                    {
                        "tag": "oper",
                        "type": "chan_outbound",
                        "params": {"dial_option_name": "intphone"},
                        "triggers": [
                            {"trigger_tag": "main-bridge", "trigger_status": "api_create_bridge", "action": "start"}
                        ],
                        "content": [
                            {
                                "tag": "greet",
                                "type": "clip",
                                "params": {"audio_name": "hello-world"},
                                "triggers": [
                                    {"trigger_tag": "oper", "trigger_status": "api_dial_chan", "action": "start"},
                                    {"trigger_tag": "greet", "trigger_status": "PlaybackFinished", "action": "func", "func": "check_fully_playback"}
                                ]
                            }
                        ]
                    }
                ]
            }
        ]
    }))
    .unwrap();

    let (room, handle) = Room::new(
        Arc::new(ari),
        &plan,
        request("X900"),
        CancellationToken::new(),
    );
    let task = tokio::spawn(room.run());
    sleep(Duration::from_millis(300)).await;

    assert!(handle.ledger.read().unwrap().has("greet", "api_start_playback"));

    handle
        .sender
        .send(RoomMsg::Status(StatusUpdate::new(
            "greet",
            "PlaybackFinished",
            "done",
        )))
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let ledger = handle.ledger.read().unwrap();
    assert_eq!(ledger.first_value("greet", "fully_playback"), Some("true"));

    task.abort();
}
