use crate::config::AriConfig;
use crate::correlator::{self, TriggerEvent};
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

/// Owns the process-wide `/ari/events` WebSocket: reconnect with increasing
/// backoff, correlate each frame and feed the bounded dispatcher queue. The
/// bounded `send` applies backpressure to this read loop when the dispatcher
/// falls behind.
pub async fn run_event_stream(
    config: AriConfig,
    events: mpsc::Sender<TriggerEvent>,
    token: CancellationToken,
) {
    let mut url = match Url::parse(&format!("ws://{}:{}/ari/events", config.host, config.port)) {
        Ok(url) => url,
        Err(e) => {
            warn!("invalid ari event url: {}", e);
            return;
        }
    };
    url.query_pairs_mut()
        .append_pair("api_key", &format!("{}:{}", config.username, config.password))
        .append_pair("app", &config.app)
        .append_pair("subscribeAll", "true");
    let mut failures: u64 = 0;

    while !token.is_cancelled() {
        match connect_async(url.as_str()).await {
            Ok((mut stream, _)) => {
                failures = 0;
                info!(host = config.host, port = config.port, "ari event stream connected");
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        frame = stream.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                let raw: Value = match serde_json::from_str(text.as_str()) {
                                    Ok(raw) => raw,
                                    Err(e) => {
                                        warn!("unparseable ari event: {}", e);
                                        continue;
                                    }
                                };
                                if let Some(event) = correlator::correlate(&raw) {
                                    if events.send(event).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("ari event stream error: {}", e);
                                break;
                            }
                            None => {
                                warn!("ari event stream closed");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                failures += 1;
                warn!(failures, "ari connect failed, check host/port/credentials: {}", e);
            }
        }

        let backoff = failures.clamp(1, 60);
        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(Duration::from_secs(backoff)) => {}
        }
    }
}
