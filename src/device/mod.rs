//! Connectivity to the display device.
//!
//! [`FrameTransport`] and [`FrameSession`] are the injected capability: a real
//! WebSocket client lives in [`websocket`], a deterministic fake in
//! [`scripted`]. [`DeviceLink`] owns the connection state machine on top.

pub mod backoff;
pub mod link;
pub mod scripted;
pub mod websocket;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::DeviceError;

pub use backoff::{Backoff, BackoffPolicy};
pub use link::{DeviceLink, LinkOptions};

/// Command names understood by the art channel.
pub mod commands {
    /// Cheap round-trip used by the health probe.
    pub const GET_API_VERSION: &str = "get_api_version";
    pub const SEND_IMAGE: &str = "send_image";
    pub const SELECT_IMAGE: &str = "select_image";
    pub const GET_CONTENT_LIST: &str = "get_content_list";
    pub const DELETE_IMAGE_LIST: &str = "delete_image_list";
}

/// Timestamp layout the device uses for content dates (`2025:09:08 17:58:00`).
pub const CONTENT_DATE_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// One request to the device. The link treats name and arguments as opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCommand {
    pub name: String,
    pub args: Value,
    /// Bulk bytes carried out-of-band (uploads).
    pub payload: Option<Vec<u8>>,
}

impl DeviceCommand {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceResponse {
    pub data: Value,
}

impl DeviceResponse {
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Unsolicited messages pushed by the device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceNotification {
    /// The device is powering down its display; the session will not survive.
    Standby,
    Other { event: String },
}

/// What the link presents when opening a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub client_name: String,
    /// Pairing token from a previous session, if any.
    pub token: Option<String>,
}

/// Opens sessions to the device.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn FrameSession>, DeviceError>;
}

/// One live, handshaken connection.
#[async_trait]
pub trait FrameSession: Send + Sync {
    /// Issue one command and wait for its response. Callers serialize.
    async fn send(&self, command: &DeviceCommand) -> Result<DeviceResponse, DeviceError>;

    /// Hand out the notification stream. Only the first call returns it.
    fn take_notifications(&self) -> Option<mpsc::Receiver<DeviceNotification>>;

    /// Pairing token granted by the device during the handshake.
    fn token(&self) -> Option<String>;

    async fn close(&self);
}
