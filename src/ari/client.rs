use super::{AriClient, AriResponse};
use crate::config::AriConfig;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// ARI REST client. Every call applies the configured timeout and at most
/// `attempts` tries: first try, one immediate retry, then increasing backoff.
/// 4xx responses are definitive and returned as-is; 5xx and transport errors
/// are retried.
pub struct HttpAriClient {
    base_url: String,
    app: String,
    username: String,
    password: String,
    attempts: u32,
    client: Client,
}

impl HttpAriClient {
    pub fn new(config: &AriConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            base_url: format!("http://{}:{}/ari", config.host, config.port),
            app: config.app.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            attempts: config.attempts.max(1),
            client,
        }
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> AriResponse {
        let url = format!("{}{}", self.base_url, path);
        let mut last = AriResponse::failed("no attempt made".to_string());

        for attempt in 0..self.attempts {
            if attempt >= 2 {
                sleep(Duration::from_millis(500 * (attempt as u64 - 1))).await;
            }
            let mut request = self
                .client
                .request(method.clone(), &url)
                .basic_auth(&self.username, Some(&self.password));
            if let Some(body) = &body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.json::<Value>().await.unwrap_or(Value::Null);
                    let message = body
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_else(|| status.canonical_reason().unwrap_or(""))
                        .to_string();
                    last = AriResponse {
                        http_code: status.as_u16(),
                        success: status.is_success(),
                        message,
                        body,
                    };
                    if status.is_success() || !retryable(status) {
                        debug!(%method, url, code = last.http_code, attempt, "ari call");
                        return last;
                    }
                    warn!(%method, url, code = last.http_code, attempt, "ari call failed");
                }
                Err(e) => {
                    warn!(%method, url, attempt, "ari call error: {}", e);
                    last = AriResponse::failed(e.to_string());
                }
            }
        }
        last
    }
}

fn retryable(status: StatusCode) -> bool {
    status.is_server_error()
}

#[async_trait]
impl AriClient for HttpAriClient {
    async fn create_bridge(&self, bridge_id: &str) -> AriResponse {
        self.send(
            Method::POST,
            "/bridges",
            Some(json!({"type": "mixing", "bridgeId": bridge_id, "name": bridge_id})),
        )
        .await
    }

    async fn destroy_bridge(&self, bridge_id: &str) -> AriResponse {
        self.send(Method::DELETE, &format!("/bridges/{}", bridge_id), None)
            .await
    }

    async fn create_chan(&self, chan_id: &str, endpoint: &str, callerid: &str) -> AriResponse {
        self.send(
            Method::POST,
            "/channels/create",
            Some(json!({
                "channelId": chan_id,
                "endpoint": endpoint,
                "app": self.app,
                "variables": {
                    "CALLERID(num)": callerid,
                    "CALLERID(name)": callerid,
                    "CONNECTED(num)": callerid,
                },
            })),
        )
        .await
    }

    async fn answer_chan(&self, chan_id: &str) -> AriResponse {
        self.send(Method::POST, &format!("/channels/{}/answer", chan_id), None)
            .await
    }

    async fn dial_chan(&self, chan_id: &str, timeout_secs: u32) -> AriResponse {
        self.send(
            Method::POST,
            &format!("/channels/{}/dial", chan_id),
            Some(json!({"timeout": timeout_secs})),
        )
        .await
    }

    async fn delete_chan(&self, chan_id: &str, reason_code: u16) -> AriResponse {
        self.send(
            Method::DELETE,
            &format!("/channels/{}", chan_id),
            Some(json!({"reason_code": reason_code.to_string()})),
        )
        .await
    }

    async fn create_snoop_chan(
        &self,
        target_chan_id: &str,
        snoop_id: &str,
        spy: &str,
        whisper: &str,
    ) -> AriResponse {
        self.send(
            Method::POST,
            &format!("/channels/{}/snoop", target_chan_id),
            Some(json!({
                "spy": spy,
                "whisper": whisper,
                "app": self.app,
                "snoopId": snoop_id,
            })),
        )
        .await
    }

    async fn create_emedia_chan(&self, chan_id: &str, external_host: &str) -> AriResponse {
        self.send(
            Method::POST,
            "/channels/externalMedia",
            Some(json!({
                "channelId": chan_id,
                "app": self.app,
                "external_host": external_host,
                "encapsulation": "rtp",
                "transport": "udp",
                "connection_type": "client",
                "format": "slin",
                "direction": "both",
            })),
        )
        .await
    }

    async fn add_channel_to_bridge(&self, bridge_id: &str, chan_id: &str) -> AriResponse {
        self.send(
            Method::POST,
            &format!("/bridges/{}/addChannel", bridge_id),
            Some(json!({"channel": chan_id})),
        )
        .await
    }

    async fn start_chan_playback(
        &self,
        chan_id: &str,
        playback_id: &str,
        media: &str,
    ) -> AriResponse {
        self.send(
            Method::POST,
            &format!("/channels/{}/play", chan_id),
            Some(json!({
                "media": media,
                "lang": "en",
                "offsetms": 0,
                "skipms": 3000,
                "playbackId": playback_id,
            })),
        )
        .await
    }

    async fn stop_playback(&self, playback_id: &str) -> AriResponse {
        self.send(Method::DELETE, &format!("/playbacks/{}", playback_id), None)
            .await
    }

    async fn get_chan_var(&self, chan_id: &str, variable: &str) -> AriResponse {
        self.send(
            Method::GET,
            &format!("/channels/{}/variable?variable={}", chan_id, variable),
            None,
        )
        .await
    }

    async fn subscribe(&self, event_source: &str) -> AriResponse {
        self.send(
            Method::POST,
            &format!("/applications/{}/subscription", self.app),
            Some(json!({"eventSource": event_source})),
        )
        .await
    }

    async fn custom_event(&self, event_name: &str, source: &str) -> AriResponse {
        self.send(
            Method::POST,
            &format!("/events/user/{}", event_name),
            Some(json!({"application": self.app, "source": source})),
        )
        .await
    }
}
