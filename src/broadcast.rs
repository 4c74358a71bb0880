//! Publish/subscribe hub for [`GalleryEvent`]s.
//!
//! Every subscriber owns a bounded mailbox. Publishing never blocks: when a
//! mailbox is full its oldest pending event is discarded and counted against
//! that subscriber only.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::events::GalleryEvent;

#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<BroadcasterInner>,
}

struct BroadcasterInner {
    subscribers: Mutex<HashMap<u64, Arc<Mailbox>>>,
    next_id: AtomicU64,
    capacity: usize,
}

struct Mailbox {
    state: Mutex<MailboxState>,
    ready: Notify,
}

#[derive(Default)]
struct MailboxState {
    events: VecDeque<GalleryEvent>,
    dropped: u64,
    closed: bool,
}

impl Mailbox {
    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Enqueue `event` for every current subscriber. Returns how many
    /// subscribers received it.
    pub fn publish(&self, event: GalleryEvent) -> usize {
        let mailboxes: Vec<(u64, Arc<Mailbox>)> = self
            .inner
            .subscribers()
            .iter()
            .map(|(id, mailbox)| (*id, Arc::clone(mailbox)))
            .collect();

        for (id, mailbox) in &mailboxes {
            let mut state = mailbox.lock();
            if state.events.len() >= self.inner.capacity {
                state.events.pop_front();
                state.dropped += 1;
                trace!(subscriber = id, dropped = state.dropped, "subscriber queue full; dropped oldest event");
            }
            state.events.push_back(event.clone());
            drop(state);
            mailbox.ready.notify_one();
        }
        trace!(event = event.name(), subscribers = mailboxes.len(), "event published");
        mailboxes.len()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox {
            state: Mutex::new(MailboxState::default()),
            ready: Notify::new(),
        });
        self.inner
            .subscribers()
            .insert(id, Arc::clone(&mailbox));
        debug!(subscriber = id, "subscriber added");
        Subscription {
            id,
            mailbox,
            hub: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// End every open subscription; their streams finish once drained.
    pub fn close(&self) {
        let mailboxes: Vec<Arc<Mailbox>> = self.inner.subscribers().drain().map(|(_, m)| m).collect();
        for mailbox in mailboxes {
            mailbox.lock().closed = true;
            mailbox.ready.notify_one();
        }
    }

    /// Publish a heartbeat every `interval` until cancelled.
    pub async fn run_heartbeat(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.publish(GalleryEvent::Heartbeat { at: Utc::now() });
                }
            }
        }
        self.close();
    }
}

impl BroadcasterInner {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, Arc<Mailbox>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One observer's handle. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    mailbox: Arc<Mailbox>,
    hub: Weak<BroadcasterInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. `None` once the broadcaster closed this
    /// subscription and the queue is drained.
    pub async fn recv(&mut self) -> Option<GalleryEvent> {
        loop {
            {
                let mut state = self.mailbox.lock();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.mailbox.ready.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<GalleryEvent> {
        self.mailbox.lock().events.pop_front()
    }

    /// Number of events discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.mailbox.lock().dropped
    }

    /// Pull-based stream over this subscription's events.
    pub fn into_stream(self) -> impl Stream<Item = GalleryEvent> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|event| (event, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.subscribers().remove(&self.id);
            debug!(subscriber = self.id, "subscriber removed");
        }
    }
}
