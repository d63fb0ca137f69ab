// Live feed of environment changes over graphql-transport-ws
//
// One task owns the websocket. It reconnects with the shared backoff and
// always resubscribes from the newest filesVersion it has delivered, so a
// dropped connection neither loses nor repeats batches.

use super::backoff::Backoff;
use super::classify::{classify, Verdict};
use super::graphql::{parse_errors, parse_response, WireBatch, REMOTE_FILE_SYNC_EVENTS};
use super::{ClientError, RemoteBatch};
use crate::error::{Result, SyncError};
use crate::shutdown::Shutdown;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;

const PROTOCOL: &str = "graphql-transport-ws";
const SUBSCRIPTION_ID: &str = "1";
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub url: String,
    pub token: Option<String>,
    pub backoff: Backoff,
}

/// Start the subscription task
///
/// The receiver yields batches newer than `local_files_version`. A fatal
/// error is sent as the last item; the channel also closes on shutdown.
pub fn spawn(
    config: SubscriptionConfig,
    local_files_version: u64,
    shutdown: Shutdown,
) -> mpsc::Receiver<Result<RemoteBatch>> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(run(config, local_files_version, shutdown, tx));
    rx
}

/// Why one connection ended without an error
enum Stop {
    Shutdown,
    ReceiverGone,
}

async fn run(
    config: SubscriptionConfig,
    mut version: u64,
    mut shutdown: Shutdown,
    tx: mpsc::Sender<Result<RemoteBatch>>,
) {
    let max_attempts = config.backoff.max_attempts.max(1);
    let mut failures = 0u32;

    loop {
        let mut delivered = false;
        let err = match connect_and_stream(&config, &mut version, &mut delivered, &mut shutdown, &tx).await {
            Ok(Stop::Shutdown) => {
                tracing::debug!("Subscription stopped by shutdown");
                return;
            }
            Ok(Stop::ReceiverGone) => {
                tracing::debug!("Subscription receiver dropped");
                return;
            }
            Err(err) => err,
        };

        if delivered {
            failures = 0;
        }

        let fatal = match classify(&err) {
            Verdict::Unauthenticated => Some(SyncError::AuthenticationRequired),
            Verdict::Fatal => Some(SyncError::Client(err)),
            Verdict::Retry => {
                failures += 1;
                if failures >= max_attempts {
                    tracing::warn!("Subscription failed {} times in a row: {}", failures, err);
                    Some(SyncError::TooManySyncAttempts { attempts: failures })
                } else {
                    let delay = config.backoff.delay(failures - 1);
                    tracing::warn!(
                        "Subscription dropped (attempt {}/{}): {}, reconnecting in {:?}",
                        failures,
                        max_attempts,
                        err,
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait() => return,
                    }
                    None
                }
            }
        };

        if let Some(fatal) = fatal {
            let _ = tx.send(Err(fatal)).await;
            return;
        }
    }
}

async fn connect_and_stream(
    config: &SubscriptionConfig,
    version: &mut u64,
    delivered: &mut bool,
    shutdown: &mut Shutdown,
    tx: &mpsc::Sender<Result<RemoteBatch>>,
) -> std::result::Result<Stop, ClientError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(ClientError::from)?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(PROTOCOL));
    if let Some(token) = &config.token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ClientError::Unrecognized(format!("invalid token: {}", e)))?;
        request.headers_mut().insert("Authorization", value);
    }

    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    let (mut sink, mut stream) = ws.split();
    tracing::debug!("Subscription connected to {}", config.url);

    let mut init = json!({ "type": "connection_init" });
    if let Some(token) = &config.token {
        init["payload"] = json!({ "Authorization": format!("Bearer {}", token) });
    }
    sink.send(Message::Text(init.to_string())).await?;

    // Wait for the ack before subscribing
    let ack = tokio::time::timeout(ACK_TIMEOUT, async {
        while let Some(message) = stream.next().await {
            match message? {
                Message::Text(text) => {
                    let value = parse_message(&text)?;
                    match message_type(&value) {
                        "connection_ack" => return Ok(()),
                        "ping" => {
                            sink.send(Message::Text(json!({ "type": "pong" }).to_string()))
                                .await?;
                        }
                        other => {
                            tracing::debug!("Ignoring '{}' before connection_ack", other);
                        }
                    }
                }
                Message::Close(frame) => return Err(closed(frame)),
                _ => {}
            }
        }
        Err::<(), ClientError>(connection_reset("connection ended before connection_ack"))
    });
    ack.await.map_err(|_| ClientError::Network {
        code: "ETIMEDOUT".to_string(),
        message: "no connection_ack from server".to_string(),
    })??;

    let subscribe = json!({
        "id": SUBSCRIPTION_ID,
        "type": "subscribe",
        "payload": {
            "query": REMOTE_FILE_SYNC_EVENTS,
            "variables": { "localFilesVersion": version.to_string() },
        },
    });
    sink.send(Message::Text(subscribe.to_string())).await?;
    tracing::info!("Subscribed to environment changes after version {}", version);

    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = shutdown.wait() => {
                let complete = json!({ "id": SUBSCRIPTION_ID, "type": "complete" });
                let _ = sink.send(Message::Text(complete.to_string())).await;
                let _ = sink.close().await;
                return Ok(Stop::Shutdown);
            }
        };

        let Some(message) = message else {
            return Err(connection_reset("connection ended"));
        };

        let text = match message? {
            Message::Text(text) => text,
            Message::Close(frame) => return Err(closed(frame)),
            _ => continue,
        };

        let value = parse_message(&text)?;
        match message_type(&value) {
            "next" => {
                let batch = decode_next(&value)?;
                if batch.remote_files_version <= *version {
                    tracing::debug!("Skipping stale batch {}", batch);
                    continue;
                }
                *version = batch.remote_files_version;
                *delivered = true;
                if tx.send(Ok(batch)).await.is_err() {
                    let _ = sink.close().await;
                    return Ok(Stop::ReceiverGone);
                }
            }
            "error" => {
                let errors = value
                    .get("payload")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                return Err(parse_errors(&errors));
            }
            "complete" => {
                return Err(ClientError::Closed {
                    code: 1000,
                    reason: "subscription completed by server".to_string(),
                });
            }
            "ping" => {
                sink.send(Message::Text(json!({ "type": "pong" }).to_string()))
                    .await?;
            }
            "pong" | "connection_ack" => {}
            other => {
                return Err(ClientError::Unrecognized(format!(
                    "unexpected message type '{}'",
                    other
                )));
            }
        }
    }
}

fn parse_message(text: &str) -> std::result::Result<Value, ClientError> {
    serde_json::from_str(text).map_err(|_| ClientError::Unrecognized(text.chars().take(256).collect()))
}

fn message_type(value: &Value) -> &str {
    value.get("type").and_then(Value::as_str).unwrap_or("")
}

fn decode_next(value: &Value) -> std::result::Result<RemoteBatch, ClientError> {
    let payload = value.get("payload").cloned().unwrap_or(Value::Null);
    let data = parse_response(payload)?;
    let events = data
        .get("remoteFileSyncEvents")
        .cloned()
        .ok_or_else(|| ClientError::Unrecognized(data.to_string()))?;
    let batch: WireBatch =
        serde_json::from_value(events).map_err(|e| ClientError::Unrecognized(e.to_string()))?;
    batch.decode()
}

fn closed(
    frame: Option<tokio_tungstenite::tungstenite::protocol::CloseFrame<'static>>,
) -> ClientError {
    match frame {
        Some(frame) => ClientError::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.into_owned(),
        },
        // No close code means the connection was dropped abnormally
        None => ClientError::Closed {
            code: 1006,
            reason: String::new(),
        },
    }
}

fn connection_reset(message: &str) -> ClientError {
    ClientError::Network {
        code: "ECONNRESET".to_string(),
        message: message.to_string(),
    }
}
