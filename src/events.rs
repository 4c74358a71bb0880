use chrono::{DateTime, Utc};
use gallery_model::{ActiveArt, ConnectionState, ImageId};
use serde::Serialize;

/// Live state changes delivered to every subscriber of the broadcaster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GalleryEvent {
    ConnectionStateChanged {
        state: ConnectionState,
    },
    SlideshowUpdate {
        #[serde(rename = "imageId")]
        image_id: ImageId,
        since: DateTime<Utc>,
    },
    /// Published on a fixed cadence so observers can tell quiet from dead.
    Heartbeat {
        at: DateTime<Utc>,
    },
}

impl GalleryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GalleryEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            GalleryEvent::SlideshowUpdate { .. } => "slideshow_update",
            GalleryEvent::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn slideshow_update(active: &ActiveArt) -> Self {
        GalleryEvent::SlideshowUpdate {
            image_id: active.image_id.clone(),
            since: active.since,
        }
    }
}
