use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use gallery_model::ConnectionState;
use serde_json::json;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::{Backoff, BackoffPolicy};
use super::{
    Credentials, DeviceCommand, DeviceNotification, DeviceResponse, FrameSession, FrameTransport,
    commands,
};
use crate::broadcast::EventBroadcaster;
use crate::error::DeviceError;
use crate::events::GalleryEvent;

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub client_name: String,
    /// Where the pairing token is kept between runs.
    pub token_path: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Fixes the jitter sequence; tests only.
    pub backoff_seed: Option<u64>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            client_name: "frame-gallery".to_string(),
            token_path: None,
            connect_timeout: Duration::from_secs(10),
            health_interval: Duration::from_secs(20),
            health_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            backoff_seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkRequest {
    Connect,
    Reconnect,
}

/// The single owner of the device connection.
///
/// Cloning is cheap; every clone drives the same state machine. Commands
/// funnel through one session slot, so at most one request is outstanding and
/// callers are served first come, first served. Every transition into or out
/// of `Connected` happens while that slot is held.
#[derive(Clone)]
pub struct DeviceLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    transport: Arc<dyn FrameTransport>,
    options: LinkOptions,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Arc<dyn FrameSession>>>,
    requests: mpsc::UnboundedSender<LinkRequest>,
    requests_rx: StdMutex<Option<mpsc::UnboundedReceiver<LinkRequest>>>,
    token: StdMutex<Option<String>>,
    events: EventBroadcaster,
}

impl DeviceLink {
    pub fn new(
        transport: Arc<dyn FrameTransport>,
        options: LinkOptions,
        events: EventBroadcaster,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (requests, requests_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(LinkInner {
                transport,
                options,
                state,
                session: Mutex::new(None),
                requests,
                requests_rx: StdMutex::new(Some(requests_rx)),
                token: StdMutex::new(None),
                events,
            }),
        }
    }

    /// Non-blocking snapshot of the connection state.
    pub fn current_state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Read-only view of every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Ask the supervisor to leave `Disconnected`.
    pub fn connect(&self) {
        let _ = self.inner.requests.send(LinkRequest::Connect);
    }

    /// Leave `Failed`, cut a backoff wait short, or replace a live session.
    pub fn reconnect(&self) {
        self.transition_if(
            |state| matches!(state, ConnectionState::Failed { .. }),
            ConnectionState::Connecting,
        );
        let _ = self.inner.requests.send(LinkRequest::Reconnect);
    }

    /// Wait until the link is `Connected`.
    ///
    /// Starts a connection when the link is idle. Fails with
    /// [`DeviceError::Failed`] if the link is or becomes `Failed`, and with
    /// [`DeviceError::Timeout`] when `wait` elapses first.
    pub async fn ensure_connected(&self, wait: Duration) -> Result<(), DeviceError> {
        let mut rx = self.inner.state.subscribe();
        if matches!(*rx.borrow(), ConnectionState::Disconnected) {
            self.connect();
        }
        let outcome = timeout(wait, async {
            rx.wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Connected | ConnectionState::Failed { .. }
                )
            })
            .await
            .map(|state| state.clone())
        })
        .await;

        match outcome {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(Ok(ConnectionState::Failed { reason })) => Err(DeviceError::Failed(reason)),
            Ok(Ok(other)) => Err(DeviceError::Unreachable(other.to_string())),
            Ok(Err(_)) => Err(DeviceError::ConnectionLost("device link shut down".into())),
            Err(_) => Err(DeviceError::Timeout(wait)),
        }
    }

    /// Send one command over the live session.
    ///
    /// Refused with [`DeviceError::NotConnected`] unless the link is
    /// `Connected`; a first command against an idle link also starts a
    /// connection. A timeout or a dropped session moves the link to
    /// `Reconnecting` before the error is returned.
    pub async fn send_command(
        &self,
        command: DeviceCommand,
        timeout_after: Duration,
    ) -> Result<DeviceResponse, DeviceError> {
        match self.current_state() {
            ConnectionState::Connected => {}
            ConnectionState::Disconnected => {
                self.connect();
                return Err(DeviceError::NotConnected);
            }
            _ => return Err(DeviceError::NotConnected),
        }

        let mut slot = self.inner.session.lock().await;
        if !self.inner.state.borrow().is_connected() {
            return Err(DeviceError::NotConnected);
        }
        let Some(session) = slot.clone() else {
            return Err(DeviceError::NotConnected);
        };

        debug!(command = %command.name, "sending device command");
        let result = match timeout(timeout_after, session.send(&command)).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout(timeout_after)),
        };

        if let Err(err) = &result {
            if err.drops_connection() {
                let dropped = slot.take();
                self.transition(lost_state());
                drop(slot);
                warn!(command = %command.name, error = %err, "device command lost the connection");
                if let Some(dropped) = dropped {
                    dropped.close().await;
                }
            } else {
                debug!(command = %command.name, error = %err, "device command failed");
            }
        }
        result
    }

    /// Drive the connection state machine until `cancel` fires.
    pub async fn run_supervisor(self, cancel: CancellationToken) -> Result<()> {
        let mut requests = self
            .inner
            .requests_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .context("device link supervisor is already running")?;
        let policy = self.inner.options.backoff.clone();
        let mut backoff = match self.inner.options.backoff_seed {
            Some(seed) => Backoff::with_seed(policy, seed),
            None => Backoff::new(policy),
        };
        self.load_token().await;

        let mut state_rx = self.inner.state.subscribe();
        let mut notifications: Option<mpsc::Receiver<DeviceNotification>> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let state = state_rx.borrow_and_update().clone();
            if !state.is_connected() {
                notifications = None;
            }

            match state {
                ConnectionState::Disconnected => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        request = requests.recv() => match request {
                            Some(_) => self.transition(ConnectionState::Connecting),
                            None => break,
                        },
                    }
                }
                ConnectionState::Failed { .. } => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        request = requests.recv() => match request {
                            Some(LinkRequest::Reconnect) => {
                                backoff.reset();
                                self.transition(ConnectionState::Connecting);
                            }
                            Some(LinkRequest::Connect) => {}
                            None => break,
                        },
                    }
                }
                ConnectionState::Connecting => {
                    notifications = self
                        .attempt_connect(&mut backoff, &mut requests, &cancel)
                        .await;
                }
                ConnectionState::Reconnecting { next_retry_at, .. } => {
                    let wait = (next_retry_at - Utc::now()).to_std().unwrap_or_default();
                    let retry_now = tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(wait) => true,
                        request = requests.recv() => match request {
                            Some(LinkRequest::Reconnect) => {
                                debug!("reconnect requested; skipping the rest of the backoff");
                                true
                            }
                            Some(LinkRequest::Connect) => false,
                            None => break,
                        },
                    };
                    if retry_now {
                        notifications = self
                            .attempt_connect(&mut backoff, &mut requests, &cancel)
                            .await;
                    }
                }
                ConnectionState::Connected => {
                    let lost = tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            None
                        }
                        notification = next_notification(&mut notifications) => match notification {
                            Some(DeviceNotification::Standby) => {
                                Some(("device entered standby", lost_state()))
                            }
                            Some(DeviceNotification::Other { event }) => {
                                debug!(%event, "device notification");
                                None
                            }
                            None => Some(("device notification stream closed", lost_state())),
                        },
                        request = requests.recv() => match request {
                            Some(LinkRequest::Reconnect) => {
                                Some(("reconnect requested", ConnectionState::Connecting))
                            }
                            Some(LinkRequest::Connect) => None,
                            None => break,
                        },
                    };
                    if let Some((reason, next)) = lost {
                        self.drop_session(reason, next).await;
                    }
                }
            }
        }

        self.drop_session("shutting down", ConnectionState::Disconnected)
            .await;
        info!("device link supervisor stopped");
        Ok(())
    }

    /// Probe the device while connected so silent drops surface before a
    /// user-visible command fails.
    pub async fn run_health_probe(self, cancel: CancellationToken) -> Result<()> {
        let interval = self.inner.options.health_interval;
        let probe_timeout = self.inner.options.health_timeout;
        let mut state_rx = self.inner.state.subscribe();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                connected = wait_until_connected(&mut state_rx) => {
                    if !connected {
                        break;
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(interval) => {}
            }
            if !self.current_state().is_connected() {
                continue;
            }

            let probe = DeviceCommand::new(commands::GET_API_VERSION, json!({}));
            match self.send_command(probe, probe_timeout).await {
                Ok(_) => debug!("device health probe ok"),
                Err(err) if err.drops_connection() => {
                    warn!(error = %err, "device health probe failed; reconnecting");
                }
                Err(err) => debug!(error = %err, "device health probe skipped"),
            }
        }
        Ok(())
    }

    async fn attempt_connect(
        &self,
        backoff: &mut Backoff,
        requests: &mut mpsc::UnboundedReceiver<LinkRequest>,
        cancel: &CancellationToken,
    ) -> Option<mpsc::Receiver<DeviceNotification>> {
        let credentials = Credentials {
            client_name: self.inner.options.client_name.clone(),
            token: self.token(),
        };
        let connect_timeout = self.inner.options.connect_timeout;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = timeout(connect_timeout, self.inner.transport.connect(&credentials)) => {
                result.unwrap_or(Err(DeviceError::Timeout(connect_timeout)))
            }
        };

        match outcome {
            Ok(session) => {
                let session: Arc<dyn FrameSession> = Arc::from(session);
                let notifications = session.take_notifications();
                if let Some(token) = session.token() {
                    self.store_token(token).await;
                }
                let mut slot = self.inner.session.lock().await;
                *slot = Some(session);
                backoff.reset();
                self.transition(ConnectionState::Connected);
                drop(slot);
                // Requests queued while connecting are satisfied by this session.
                while requests.try_recv().is_ok() {}
                notifications
            }
            Err(err) if err.is_permanent() => {
                backoff.reset();
                warn!(error = %err, "device refused the connection");
                self.transition(ConnectionState::Failed {
                    reason: err.to_string(),
                });
                None
            }
            Err(err) => {
                self.schedule_retry(backoff, &err.to_string());
                None
            }
        }
    }

    fn schedule_retry(&self, backoff: &mut Backoff, reason: &str) {
        match backoff.next_delay() {
            Some(delay) => {
                let attempt = backoff.attempts();
                let next_retry_at =
                    Utc::now() + TimeDelta::from_std(delay).unwrap_or_else(|_| TimeDelta::zero());
                warn!(attempt, ?delay, reason, "device connection attempt failed");
                self.transition(ConnectionState::Reconnecting {
                    attempt,
                    next_retry_at,
                });
            }
            None => {
                let attempts = backoff.attempts();
                backoff.reset();
                self.transition(ConnectionState::Failed {
                    reason: format!("gave up after {attempts} attempts: {reason}"),
                });
            }
        }
    }

    async fn drop_session(&self, reason: &str, next: ConnectionState) {
        let session = {
            let mut slot = self.inner.session.lock().await;
            let session = slot.take();
            self.transition(next);
            session
        };
        if let Some(session) = session {
            info!(reason, "closing device session");
            session.close().await;
        }
    }

    fn transition(&self, next: ConnectionState) {
        self.transition_if(|_| true, next);
    }

    fn transition_if(&self, allowed: impl FnOnce(&ConnectionState) -> bool, next: ConnectionState) {
        let events = &self.inner.events;
        self.inner.state.send_if_modified(|current| {
            if *current == next || !allowed(current) {
                return false;
            }
            info!(from = current.label(), to = %next, "device connection state changed");
            *current = next.clone();
            events.publish(GalleryEvent::ConnectionStateChanged { state: next });
            true
        });
    }

    fn token(&self) -> Option<String> {
        self.inner
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn load_token(&self) {
        let Some(path) = &self.inner.options.token_path else {
            return;
        };
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let token = contents.trim();
                if !token.is_empty() {
                    debug!(path = %path.display(), "loaded device pairing token");
                    *self
                        .inner
                        .token
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token.to_string());
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to read device token"),
        }
    }

    async fn store_token(&self, token: String) {
        {
            let mut current = self
                .inner
                .token
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if current.as_deref() == Some(token.as_str()) {
                return;
            }
            *current = Some(token.clone());
        }
        let Some(path) = &self.inner.options.token_path else {
            return;
        };
        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                warn!(path = %parent.display(), error = %err, "failed to create token directory");
                return;
            }
        }
        match tokio::fs::write(path, token.as_bytes()).await {
            Ok(()) => info!(path = %path.display(), "stored device pairing token"),
            Err(err) => warn!(path = %path.display(), error = %err, "failed to store device token"),
        }
    }
}

/// Immediate retry after a live session was lost; backoff starts if it fails.
fn lost_state() -> ConnectionState {
    ConnectionState::Reconnecting {
        attempt: 0,
        next_retry_at: Utc::now(),
    }
}

async fn next_notification(
    notifications: &mut Option<mpsc::Receiver<DeviceNotification>>,
) -> Option<DeviceNotification> {
    match notifications {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until_connected(rx: &mut watch::Receiver<ConnectionState>) -> bool {
    rx.wait_for(ConnectionState::is_connected).await.is_ok()
}
