use crate::app::AppState;
use crate::call::{CallRequest, DialOption};
use crate::error::Error;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;


pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_root))
        .route("/diag", get(get_diag))
        .route("/stats", get(get_stats))
        .route("/call/originate", post(originate))
        .route("/call/{call_id}", delete(hangup))
        .route("/call/rooms", get(list_rooms))
        .route("/call/bridges", get(list_bridges))
        .route("/call/chans", get(list_chans))
        .route("/restart", post(restart))
}

async fn get_root(State(state): State<AppState>) -> Response {
    Json(json!({
        "app": state.config.ari.app,
        "addr": state.config.http_addr,
    }))
    .into_response()
}

async fn get_diag(State(state): State<AppState>) -> Response {
    Json(json!({
        "app": state.config.ari.app,
        "alive": !state.dispatcher.is_closed(),
        "rooms": state.dispatcher.room_count(),
    }))
    .into_response()
}

async fn get_stats(State(state): State<AppState>) -> Response {
    let (max, avg) = state.dispatcher.delay_stats();
    Json(json!({
        "max": max,
        "avg": avg,
        "alive": !state.dispatcher.is_closed(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct OriginateParams {
    /// Correlation id; generated when absent.
    pub call_id: Option<String>,
    /// Named call flow; the configured default when absent.
    pub flow: Option<String>,
    /// Client-side number, dialed as the `extphone` dial option.
    pub extphone: String,
    /// Internal/specialist number, dialed as the `intphone` dial option.
    pub intphone: String,
    pub phone_prefix: Option<String>,
}

async fn originate(State(state): State<AppState>, Json(params): Json<OriginateParams>) -> Response {
    let call_id = params
        .call_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let flow = params
        .flow
        .unwrap_or_else(|| state.config.default_flow.clone());
    let prefix = params.phone_prefix.unwrap_or_default();

    let mut dial_options = HashMap::new();
    dial_options.insert(
        "extphone".to_string(),
        DialOption {
            gate: state.config.default_gate.clone(),
            phone: params.extphone.clone(),
            phone_prefix: prefix.clone(),
            callerid: params.intphone.clone(),
            dial_timeout: 50,
        },
    );
    dial_options.insert(
        "intphone".to_string(),
        DialOption {
            gate: state.config.default_gate.clone(),
            phone: params.intphone.clone(),
            phone_prefix: prefix,
            callerid: params.intphone.clone(),
            dial_timeout: 50,
        },
    );

    let request = CallRequest {
        call_id: call_id.clone(),
        flow,
        dial_options,
    };
    match state.dispatcher.admit(request) {
        Ok(handle) => Json(json!({
            "call_id": call_id,
            "room_id": handle.room_id,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn hangup(State(state): State<AppState>, Path(call_id): Path<String>) -> Response {
    match state.dispatcher.hangup(&call_id) {
        Ok(()) => {
            info!(call_id = %call_id, "hangup requested");
            Json(json!({"call_id": call_id})).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn list_rooms(State(state): State<AppState>) -> Response {
    Json(json!({"rooms": state.dispatcher.rooms_view()})).into_response()
}

async fn list_bridges(State(state): State<AppState>) -> Response {
    Json(json!({"bridges": state.dispatcher.bridges_view()})).into_response()
}

async fn list_chans(State(state): State<AppState>) -> Response {
    Json(json!({"chans": state.dispatcher.chans_view()})).into_response()
}

async fn restart(State(state): State<AppState>) -> Response {
    state.dispatcher.close_admission();
    Json(json!({
        "app": state.config.ari.app,
        "alive": false,
        "msg": "admission closed, draining calls",
    }))
    .into_response()
}

fn error_response(error: Error) -> Response {
    let status = match &error {
        Error::DuplicateCall(_) => StatusCode::CONFLICT,
        Error::AdmissionClosed => StatusCode::SERVICE_UNAVAILABLE,
        Error::UnknownCall(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({"res": "ERROR", "msg": error.to_string()}))).into_response()
}
