use crate::error::Error;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

pub mod client;
pub mod ws;

pub use client::HttpAriClient;

/// Outcome of one ARI REST call, after retries. `http_code` is 0 when the
/// request never reached the PBX.
#[derive(Debug, Clone, Serialize)]
pub struct AriResponse {
    pub http_code: u16,
    pub success: bool,
    pub message: String,
    pub body: Value,
}

impl AriResponse {
    pub fn failed(message: String) -> Self {
        Self {
            http_code: 0,
            success: false,
            message,
            body: Value::Null,
        }
    }

    /// The result code as a ledger value.
    pub fn code_value(&self) -> String {
        self.http_code.to_string()
    }

    pub fn as_result(&self) -> Result<(), Error> {
        if self.success {
            Ok(())
        } else {
            Err(Error::RemoteResource {
                code: self.http_code,
                message: self.message.clone(),
            })
        }
    }
}

/// The slice of the ARI REST surface the resource nodes drive. The process
/// owns one implementation; nodes share it and never manage its lifecycle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AriClient: Send + Sync {
    async fn create_bridge(&self, bridge_id: &str) -> AriResponse;
    async fn destroy_bridge(&self, bridge_id: &str) -> AriResponse;
    async fn create_chan(&self, chan_id: &str, endpoint: &str, callerid: &str) -> AriResponse;
    async fn answer_chan(&self, chan_id: &str) -> AriResponse;
    async fn dial_chan(&self, chan_id: &str, timeout_secs: u32) -> AriResponse;
    async fn delete_chan(&self, chan_id: &str, reason_code: u16) -> AriResponse;
    async fn create_snoop_chan(
        &self,
        target_chan_id: &str,
        snoop_id: &str,
        spy: &str,
        whisper: &str,
    ) -> AriResponse;
    async fn create_emedia_chan(&self, chan_id: &str, external_host: &str) -> AriResponse;
    async fn add_channel_to_bridge(&self, bridge_id: &str, chan_id: &str) -> AriResponse;
    async fn start_chan_playback(
        &self,
        chan_id: &str,
        playback_id: &str,
        media: &str,
    ) -> AriResponse;
    async fn stop_playback(&self, playback_id: &str) -> AriResponse;
    async fn get_chan_var(&self, chan_id: &str, variable: &str) -> AriResponse;
    async fn subscribe(&self, event_source: &str) -> AriResponse;
    async fn custom_event(&self, event_name: &str, source: &str) -> AriResponse;
}
