//! Client for the frame's art channel.
//!
//! Requests travel as `ms.channel.emit` envelopes whose `data` is a JSON
//! string; answers come back as `d2d_service_message` events carrying the
//! request id. Upload payloads go over a separate TCP socket the device opens
//! on demand (`ready_to_use`), framed as a 4-byte big-endian header length,
//! a JSON header, then the raw bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use gallery_model::ContentId;
use serde_json::{Map, Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::{
    CONTENT_DATE_FORMAT, Credentials, DeviceCommand, DeviceNotification, DeviceResponse,
    FrameSession, FrameTransport, commands,
};
use crate::error::DeviceError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<StdMutex<HashMap<String, mpsc::Sender<Value>>>>;

const ART_CHANNEL: &str = "com.samsung.art-app";
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub struct WebSocketTransport {
    host: String,
    port: u16,
}

impl WebSocketTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn url(&self, credentials: &Credentials) -> String {
        let name = BASE64.encode(credentials.client_name.as_bytes());
        let mut url = format!(
            "ws://{}:{}/api/v2/channels/{ART_CHANNEL}?name={name}",
            self.host, self.port
        );
        if let Some(token) = &credentials.token {
            url.push_str("&token=");
            url.push_str(token);
        }
        url
    }
}

#[async_trait]
impl FrameTransport for WebSocketTransport {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn FrameSession>, DeviceError> {
        let url = self.url(credentials);
        debug!(host = %self.host, port = self.port, "opening art channel");
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| DeviceError::Unreachable(err.to_string()))?;
        let (write, mut read) = stream.split();

        let token = handshake(&mut read).await?;
        info!(host = %self.host, paired = token.is_some(), "art channel connected");

        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let (notify_tx, notify_rx) = mpsc::channel(16);
        let reader = tokio::spawn(read_loop(read, Arc::clone(&pending), notify_tx));

        Ok(Box::new(WebSocketSession {
            host: self.host.clone(),
            write: Mutex::new(write),
            pending,
            reader,
            notifications: StdMutex::new(Some(notify_rx)),
            token: token.or_else(|| credentials.token.clone()),
            next_id: AtomicU64::new(1),
        }))
    }
}

/// Wait for the channel to accept or refuse us; returns the issued token.
async fn handshake(read: &mut SplitStream<WsStream>) -> Result<Option<String>, DeviceError> {
    while let Some(frame) = read.next().await {
        let message = frame.map_err(|err| DeviceError::Unreachable(err.to_string()))?;
        if message.is_close() {
            return Err(DeviceError::Unreachable("channel closed during handshake".into()));
        }
        let Ok(text) = message.to_text() else {
            continue;
        };
        let Ok(envelope) = serde_json::from_str::<Value>(text) else {
            continue;
        };
        match envelope.get("event").and_then(Value::as_str) {
            Some("ms.channel.connect") => {
                let token = envelope
                    .pointer("/data/token")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                return Ok(token);
            }
            Some("ms.channel.unauthorized") => {
                return Err(DeviceError::Unauthorized(
                    "connection was not accepted on the device".into(),
                ));
            }
            Some("ms.channel.timeOut") => {
                return Err(DeviceError::Unreachable(
                    "device did not confirm the connection".into(),
                ));
            }
            other => debug!(event = ?other, "ignoring handshake message"),
        }
    }
    Err(DeviceError::Unreachable("channel closed during handshake".into()))
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    pending: Pending,
    notify_tx: mpsc::Sender<DeviceNotification>,
) {
    while let Some(frame) = read.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "art channel read failed");
                break;
            }
        };
        if message.is_close() {
            debug!("art channel closed by device");
            break;
        }
        let Ok(text) = message.to_text() else {
            continue;
        };
        match serde_json::from_str::<Value>(text) {
            Ok(envelope) => route(envelope, &pending, &notify_tx).await,
            Err(err) => debug!(error = %err, "ignoring malformed channel message"),
        }
    }
    // Dropping the waiters fails every outstanding request.
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clear();
}

async fn route(envelope: Value, pending: &Pending, notify_tx: &mpsc::Sender<DeviceNotification>) {
    let event = envelope.get("event").and_then(Value::as_str).unwrap_or_default();
    if event != "d2d_service_message" {
        debug!(event, "ignoring channel event");
        return;
    }
    let inner = match envelope.get("data") {
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    };
    let inner_event = inner
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let request_id = inner
        .get("request_id")
        .or_else(|| inner.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let waiter = {
        let pending = pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        request_id
            .as_deref()
            .and_then(|id| pending.get(id))
            .or_else(|| pending.get(&inner_event))
            .cloned()
    };
    if let Some(waiter) = waiter {
        let _ = waiter.send(inner).await;
        return;
    }

    let notification = if inner_event == "go_to_standby" {
        DeviceNotification::Standby
    } else {
        DeviceNotification::Other { event: inner_event }
    };
    if notify_tx.try_send(notification).is_err() {
        debug!("notification dropped; nobody is listening");
    }
}

struct WebSocketSession {
    host: String,
    write: Mutex<SplitSink<WsStream, Message>>,
    pending: Pending,
    reader: JoinHandle<()>,
    notifications: StdMutex<Option<mpsc::Receiver<DeviceNotification>>>,
    token: Option<String>,
    next_id: AtomicU64,
}

/// Deregisters a waiter when the request finishes or is abandoned.
struct Waiter {
    key: String,
    pending: Pending,
    rx: mpsc::Receiver<Value>,
}

impl Waiter {
    async fn next(&mut self) -> Result<Value, DeviceError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| DeviceError::ConnectionLost("art channel closed".into()))
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}

impl WebSocketSession {
    fn register(&self, key: &str) -> Waiter {
        let (tx, rx) = mpsc::channel(4);
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), tx);
        Waiter {
            key: key.to_string(),
            pending: Arc::clone(&self.pending),
            rx,
        }
    }

    async fn emit(&self, data: &Value) -> Result<(), DeviceError> {
        let envelope = json!({
            "method": "ms.channel.emit",
            "params": {
                "event": "art_app_request",
                "to": "host",
                "data": data.to_string(),
            },
        });
        self.write
            .lock()
            .await
            .send(Message::Text(envelope.to_string().into()))
            .await
            .map_err(|err| DeviceError::ConnectionLost(err.to_string()))
    }

    fn request_body(&self, command: &DeviceCommand) -> (String, Value) {
        let id = format!("fg-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut body = match &command.args {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        body.insert("request".into(), Value::String(command.name.clone()));
        body.insert("id".into(), Value::String(id.clone()));
        body.insert("request_id".into(), Value::String(id.clone()));
        (id, Value::Object(body))
    }

    async fn upload(&self, command: &DeviceCommand, payload: &[u8]) -> Result<DeviceResponse, DeviceError> {
        let (id, mut body) = self.request_body(command);
        let file_type = command
            .args
            .get("file_type")
            .and_then(Value::as_str)
            .unwrap_or("jpg")
            .to_string();
        if let Value::Object(map) = &mut body {
            map.insert("file_size".into(), json!(payload.len()));
            map.insert(
                "image_date".into(),
                json!(Utc::now().format(CONTENT_DATE_FORMAT).to_string()),
            );
            map.insert(
                "conn_info".into(),
                json!({ "d2d_mode": "socket", "connection_id": rand::random::<u32>(), "id": &id }),
            );
        }

        let mut ready = self.register(&id);
        let mut added = self.register("image_added");
        self.emit(&body).await?;
        let answer = ready.next().await?;
        drop(ready);
        check_error(&command.name, &command.args, &answer)?;

        let conn_info = match answer.get("conn_info") {
            Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or(Value::Null),
            Some(other) => other.clone(),
            None => Value::Null,
        };
        if conn_info.get("secured").and_then(Value::as_bool).unwrap_or(false) {
            return Err(DeviceError::Rejected {
                command: command.name.clone(),
                reason: "device requested a secured transfer".into(),
            });
        }
        let ip = conn_info
            .get("ip")
            .and_then(Value::as_str)
            .unwrap_or(self.host.as_str())
            .to_string();
        let port = match conn_info.get("port") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
        .ok_or_else(|| DeviceError::Rejected {
            command: command.name.clone(),
            reason: "upload socket port missing".into(),
        })?;
        let key = conn_info.get("key").and_then(Value::as_str).unwrap_or_default();

        let header = json!({
            "num": 0,
            "total": 1,
            "fileLength": payload.len(),
            "fileName": "frame-gallery",
            "fileType": file_type,
            "secKey": key,
            "version": "0.0.1",
        })
        .to_string();

        let mut socket = TcpStream::connect((ip.as_str(), port as u16))
            .await
            .map_err(|err| DeviceError::ConnectionLost(format!("upload socket: {err}")))?;
        let header_len = u32::try_from(header.len()).map_err(|_| DeviceError::Rejected {
            command: command.name.clone(),
            reason: "upload header too large".into(),
        })?;
        let transfer = async {
            socket.write_all(&header_len.to_be_bytes()).await?;
            socket.write_all(header.as_bytes()).await?;
            socket.write_all(payload).await?;
            socket.flush().await
        };
        transfer
            .await
            .map_err(|err| DeviceError::ConnectionLost(format!("upload transfer: {err}")))?;
        debug!(bytes = payload.len(), "upload payload sent");

        let confirmation = added.next().await?;
        check_error(&command.name, &command.args, &confirmation)?;
        let content_id = confirmation
            .get("content_id")
            .and_then(Value::as_str)
            .ok_or_else(|| DeviceError::Rejected {
                command: command.name.clone(),
                reason: "upload finished without a content id".into(),
            })?;
        Ok(DeviceResponse::new(json!({ "content_id": content_id })))
    }
}

/// Map an `error` answer onto the error taxonomy.
fn check_error(command: &str, args: &Value, answer: &Value) -> Result<(), DeviceError> {
    if answer.get("event").and_then(Value::as_str) != Some("error") {
        return Ok(());
    }
    let reason = answer
        .get("error_code")
        .map(|code| match code {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "unknown error".into());
    let lowered = reason.to_ascii_lowercase();

    if ["not found", "does not exist", "invalid"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        if let Some(id) = args.get("content_id").and_then(Value::as_str) {
            return Err(DeviceError::StaleContent(ContentId::new(id)));
        }
    }
    if lowered.contains("full") || lowered.contains("storage") {
        return Err(DeviceError::Capacity);
    }
    Err(DeviceError::Rejected {
        command: command.to_string(),
        reason,
    })
}

#[async_trait]
impl FrameSession for WebSocketSession {
    async fn send(&self, command: &DeviceCommand) -> Result<DeviceResponse, DeviceError> {
        if self.reader.is_finished() {
            return Err(DeviceError::ConnectionLost("art channel closed".into()));
        }
        if command.name == commands::SEND_IMAGE {
            let payload = command.payload.as_deref().unwrap_or_default();
            return self.upload(command, payload).await;
        }

        let (id, body) = self.request_body(command);
        let mut waiter = self.register(&id);
        self.emit(&body).await?;
        let mut answer = waiter.next().await?;
        check_error(&command.name, &command.args, &answer)?;

        // Lists arrive as JSON documents embedded in a string.
        for key in ["content_list", "content_id_list"] {
            if let Some(Value::String(raw)) = answer.get(key) {
                let list = serde_json::from_str(raw).unwrap_or(Value::Array(Vec::new()));
                answer[key] = list;
            }
        }
        Ok(DeviceResponse::new(answer))
    }

    fn take_notifications(&self) -> Option<mpsc::Receiver<DeviceNotification>> {
        self.notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn token(&self) -> Option<String> {
        self.token.clone()
    }

    async fn close(&self) {
        let mut write = self.write.lock().await;
        if tokio::time::timeout(CLOSE_GRACE, write.send(Message::Close(None)))
            .await
            .is_err()
        {
            debug!("art channel close frame timed out");
        }
        self.reader.abort();
    }
}
