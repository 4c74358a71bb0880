//! Deterministic in-process stand-in for the display device.
//!
//! Without a script it behaves like a small, well-mannered frame: uploads get
//! sequential content ids, `select_image` checks the id exists, content can be
//! listed and deleted. Tests queue connect outcomes and per-command behaviours
//! on top to simulate slowness, rejections and drops. The `simulated` device
//! kind runs the binary against it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gallery_model::ContentId;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::debug;

use super::{
    CONTENT_DATE_FORMAT, Credentials, DeviceCommand, DeviceNotification, DeviceResponse,
    FrameSession, FrameTransport, commands,
};
use crate::error::DeviceError;

const API_VERSION: &str = "4.3.4.0";
const ISSUED_TOKEN: &str = "scripted-pairing-token";

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    Accept,
    /// Transient failure, as if the device were off the network.
    Refuse,
    /// Pairing rejected.
    Unauthorized,
    /// Never answers the handshake.
    Hang,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Behaviour {
    Respond(Value),
    Fail(DeviceError),
    /// Wait, then answer as the simulated device would.
    Delay(Duration),
    Hang,
    /// Kill the session mid-command.
    Drop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub session: u64,
    pub name: String,
    pub args: Value,
    pub payload_len: Option<usize>,
}

#[derive(Debug, Clone)]
struct StoredContent {
    category: String,
    added_at: DateTime<Utc>,
}

struct DeviceState {
    connect_outcomes: VecDeque<ConnectOutcome>,
    behaviours: HashMap<String, VecDeque<Behaviour>>,
    latency: Duration,
    capacity: Option<usize>,
    content: BTreeMap<ContentId, StoredContent>,
    next_content: u32,
    selected: Option<ContentId>,
    calls: Vec<RecordedCall>,
    connect_attempts: u32,
    last_credentials: Option<Credentials>,
    sessions: u64,
    live_session: Option<u64>,
    notifier: Option<mpsc::Sender<DeviceNotification>>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            connect_outcomes: VecDeque::new(),
            behaviours: HashMap::new(),
            latency: Duration::ZERO,
            capacity: None,
            content: BTreeMap::new(),
            next_content: 1,
            selected: None,
            calls: Vec::new(),
            connect_attempts: 0,
            last_credentials: None,
            sessions: 0,
            live_session: None,
            notifier: None,
        }
    }
}

impl DeviceState {
    fn kill_session(&mut self) {
        self.live_session = None;
        self.notifier = None;
    }

    fn add_content(&mut self, category: &str, added_at: DateTime<Utc>) -> ContentId {
        let id = ContentId::new(format!("MY_F{:04}", self.next_content));
        self.next_content += 1;
        self.content.insert(
            id.clone(),
            StoredContent {
                category: category.to_string(),
                added_at,
            },
        );
        id
    }

    fn simulate(&mut self, command: &DeviceCommand) -> Result<DeviceResponse, DeviceError> {
        match command.name.as_str() {
            commands::GET_API_VERSION => Ok(DeviceResponse::new(json!({ "version": API_VERSION }))),
            commands::SEND_IMAGE => {
                if command.payload.as_ref().is_none_or(Vec::is_empty) {
                    return Err(DeviceError::Rejected {
                        command: command.name.clone(),
                        reason: "empty upload".into(),
                    });
                }
                if self.capacity.is_some_and(|cap| self.content.len() >= cap) {
                    return Err(DeviceError::Capacity);
                }
                let category = command
                    .args
                    .get("category")
                    .and_then(Value::as_str)
                    .unwrap_or("MY-C0002")
                    .to_string();
                let id = self.add_content(&category, Utc::now());
                Ok(DeviceResponse::new(json!({ "content_id": id })))
            }
            commands::SELECT_IMAGE => {
                let Some(id) = command.args.get("content_id").and_then(Value::as_str) else {
                    return Err(DeviceError::Rejected {
                        command: command.name.clone(),
                        reason: "missing content_id".into(),
                    });
                };
                let id = ContentId::new(id);
                if !self.content.contains_key(&id) {
                    return Err(DeviceError::StaleContent(id));
                }
                self.selected = Some(id);
                Ok(DeviceResponse::default())
            }
            commands::GET_CONTENT_LIST => {
                let category = command.args.get("category").and_then(Value::as_str);
                let list: Vec<Value> = self
                    .content
                    .iter()
                    .filter(|(_, item)| category.is_none_or(|c| c == item.category))
                    .map(|(id, item)| {
                        json!({
                            "content_id": id,
                            "category_id": item.category,
                            "image_date": item.added_at.format(CONTENT_DATE_FORMAT).to_string(),
                        })
                    })
                    .collect();
                Ok(DeviceResponse::new(json!({ "content_list": list })))
            }
            commands::DELETE_IMAGE_LIST => {
                let ids: Vec<ContentId> = command
                    .args
                    .get("content_id_list")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|item| item.get("content_id").and_then(Value::as_str))
                            .map(ContentId::new)
                            .collect()
                    })
                    .unwrap_or_default();
                let mut deleted = Vec::new();
                for id in ids {
                    if self.content.remove(&id).is_some() {
                        if self.selected.as_ref() == Some(&id) {
                            self.selected = None;
                        }
                        deleted.push(json!({ "content_id": id }));
                    }
                }
                Ok(DeviceResponse::new(json!({ "content_id_list": deleted })))
            }
            other => Err(DeviceError::Rejected {
                command: other.to_string(),
                reason: "unknown command".into(),
            }),
        }
    }
}

/// Handle for scripting and inspecting the fake device.
#[derive(Clone, Default)]
pub struct ScriptedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl ScriptedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn transport(&self) -> Arc<dyn FrameTransport> {
        Arc::new(ScriptedTransport {
            device: self.clone(),
        })
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.lock().capacity = capacity;
    }

    /// Outcomes are consumed one per connection attempt; `Accept` once empty.
    pub fn push_connect_outcome(&self, outcome: ConnectOutcome) {
        self.lock().connect_outcomes.push_back(outcome);
    }

    /// Behaviours are consumed one per call of `command`.
    pub fn push_behaviour(&self, command: &str, behaviour: Behaviour) {
        self.lock()
            .behaviours
            .entry(command.to_string())
            .or_default()
            .push_back(behaviour);
    }

    /// Sever the live session; its next command fails with `ConnectionLost`.
    pub fn drop_connection(&self) {
        self.lock().kill_session();
    }

    /// Push a notification to the live session. Returns whether one was open.
    pub fn notify(&self, notification: DeviceNotification) -> bool {
        let notifier = self.lock().notifier.clone();
        match notifier {
            Some(tx) => tx.try_send(notification).is_ok(),
            None => false,
        }
    }

    /// Remove content behind the coordinator's back, as a factory reset would.
    pub fn forget_content(&self, id: &ContentId) {
        let mut state = self.lock();
        state.content.remove(id);
        if state.selected.as_ref() == Some(id) {
            state.selected = None;
        }
    }

    /// Seed device storage with content added at `added_at`.
    pub fn preload_content(&self, category: &str, added_at: DateTime<Utc>) -> ContentId {
        self.lock().add_content(category, added_at)
    }

    pub fn content_ids(&self) -> Vec<ContentId> {
        self.lock().content.keys().cloned().collect()
    }

    pub fn selected(&self) -> Option<ContentId> {
        self.lock().selected.clone()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, command: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.name == command)
            .count()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn last_credentials(&self) -> Option<Credentials> {
        self.lock().last_credentials.clone()
    }

    pub fn is_session_live(&self) -> bool {
        self.lock().live_session.is_some()
    }
}

struct ScriptedTransport {
    device: ScriptedDevice,
}

#[async_trait]
impl FrameTransport for ScriptedTransport {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn FrameSession>, DeviceError> {
        let outcome = {
            let mut state = self.device.lock();
            state.connect_attempts += 1;
            state.last_credentials = Some(credentials.clone());
            state
                .connect_outcomes
                .pop_front()
                .unwrap_or(ConnectOutcome::Accept)
        };

        match outcome {
            ConnectOutcome::Accept => {
                let (tx, rx) = mpsc::channel(8);
                let id = {
                    let mut state = self.device.lock();
                    state.sessions += 1;
                    let id = state.sessions;
                    state.live_session = Some(id);
                    state.notifier = Some(tx);
                    id
                };
                debug!(session = id, "scripted device accepted connection");
                Ok(Box::new(ScriptedSession {
                    id,
                    device: self.device.clone(),
                    notifications: Mutex::new(Some(rx)),
                    closed: AtomicBool::new(false),
                }))
            }
            ConnectOutcome::Refuse => Err(DeviceError::Unreachable("connection refused".into())),
            ConnectOutcome::Unauthorized => {
                Err(DeviceError::Unauthorized("pairing rejected on the device".into()))
            }
            ConnectOutcome::Hang => std::future::pending().await,
        }
    }
}

struct ScriptedSession {
    id: u64,
    device: ScriptedDevice,
    notifications: Mutex<Option<mpsc::Receiver<DeviceNotification>>>,
    closed: AtomicBool,
}

impl ScriptedSession {
    fn lost(&self) -> DeviceError {
        DeviceError::ConnectionLost(format!("scripted session {} is gone", self.id))
    }

    fn is_live(&self, state: &DeviceState) -> bool {
        !self.closed.load(Ordering::SeqCst) && state.live_session == Some(self.id)
    }
}

#[async_trait]
impl FrameSession for ScriptedSession {
    async fn send(&self, command: &DeviceCommand) -> Result<DeviceResponse, DeviceError> {
        let (behaviour, latency) = {
            let mut state = self.device.lock();
            if !self.is_live(&state) {
                return Err(self.lost());
            }
            state.calls.push(RecordedCall {
                session: self.id,
                name: command.name.clone(),
                args: command.args.clone(),
                payload_len: command.payload.as_ref().map(Vec::len),
            });
            let behaviour = state
                .behaviours
                .get_mut(&command.name)
                .and_then(VecDeque::pop_front);
            (behaviour, state.latency)
        };

        if !latency.is_zero() {
            sleep(latency).await;
        }

        match behaviour {
            Some(Behaviour::Respond(data)) => Ok(DeviceResponse::new(data)),
            Some(Behaviour::Fail(err)) => {
                if matches!(err, DeviceError::ConnectionLost(_)) {
                    self.device.lock().kill_session();
                }
                Err(err)
            }
            Some(Behaviour::Delay(delay)) => {
                sleep(delay).await;
                self.simulate(command)
            }
            Some(Behaviour::Hang) => std::future::pending().await,
            Some(Behaviour::Drop) => {
                self.device.lock().kill_session();
                Err(self.lost())
            }
            None => self.simulate(command),
        }
    }

    fn take_notifications(&self) -> Option<mpsc::Receiver<DeviceNotification>> {
        self.notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn token(&self) -> Option<String> {
        Some(ISSUED_TOKEN.to_string())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut state = self.device.lock();
        if state.live_session == Some(self.id) {
            state.kill_session();
        }
    }
}

impl ScriptedSession {
    fn simulate(&self, command: &DeviceCommand) -> Result<DeviceResponse, DeviceError> {
        let mut state = self.device.lock();
        if !self.is_live(&state) {
            return Err(self.lost());
        }
        state.simulate(command)
    }
}
