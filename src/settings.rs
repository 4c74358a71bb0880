//! Runtime settings: the mutable key/value document the slideshow reads on
//! every decision.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gallery_model::{ActiveArt, FilterId, ImageId, SlideshowConfig};
use notify::{Event, EventKind, RecursiveMode, Watcher, recommended_watcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::filter::SavedFilter;
use crate::persist::{read_json_optional, write_json_atomic};

/// Read/write access to runtime settings. Reads always reflect the latest
/// stored value.
pub trait SettingsStore: Send + Sync {
    fn slideshow(&self) -> Result<SlideshowConfig>;
    fn set_slideshow(&self, config: &SlideshowConfig) -> Result<()>;

    fn active_art(&self) -> Result<Option<ActiveArt>>;
    fn set_active_art(&self, art: &ActiveArt) -> Result<()>;

    fn filter(&self, id: &FilterId) -> Result<Option<SavedFilter>>;
    fn save_filter(&self, id: &FilterId, filter: SavedFilter) -> Result<()>;

    fn auto_cleanup_enabled(&self) -> Result<bool>;

    /// Generation counter that moves whenever the slideshow configuration
    /// may have changed.
    fn changes(&self) -> watch::Receiver<u64>;
}

/// Monotonic generation counter shared by a store and its watchers.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn bump(&self) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|value| {
            *value += 1;
            generation = *value;
        });
        generation
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsDocument {
    #[serde(default)]
    slideshow_enabled: bool,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    slideshow_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active_filter: Option<FilterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_active_image: Option<ImageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_active_image_since: Option<DateTime<Utc>>,
    #[serde(default)]
    auto_cleanup_enabled: bool,
    #[serde(default)]
    filters: BTreeMap<FilterId, SavedFilter>,
    /// Keys written by other tools are carried through untouched.
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// The part of the document the scheduler reacts to.
type Fingerprint = (SlideshowConfig, Option<SavedFilter>);

/// Settings kept in a single JSON document, re-read on every access.
pub struct JsonSettingsStore {
    path: PathBuf,
    default_interval: Duration,
    write_lock: Mutex<()>,
    notifier: ChangeNotifier,
    /// Fingerprint the generation last moved for.
    seen: Mutex<Option<Fingerprint>>,
}

impl JsonSettingsStore {
    pub fn open(path: impl Into<PathBuf>, default_interval: Duration) -> Result<Self> {
        let store = Self {
            path: path.into(),
            default_interval,
            write_lock: Mutex::new(()),
            notifier: ChangeNotifier::new(),
            seen: Mutex::new(None),
        };
        // Surface a corrupt document at startup rather than on the first tick.
        let doc = store.load()?;
        *store.seen() = Some(store.fingerprint_of(&doc));
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_auto_cleanup(&self, enabled: bool) -> Result<()> {
        self.update(|doc| doc.auto_cleanup_enabled = enabled)
    }

    fn load(&self) -> Result<SettingsDocument> {
        Ok(read_json_optional(&self.path)?.unwrap_or_default())
    }

    fn update(&self, apply: impl FnOnce(&mut SettingsDocument)) -> Result<()> {
        self.write(apply, false)
    }

    /// Read-modify-write under the write lock. An announced write records
    /// its fingerprint and bumps the generation itself, so the file event it
    /// causes is not counted a second time.
    fn write(&self, apply: impl FnOnce(&mut SettingsDocument), announce: bool) -> Result<()> {
        let _guard = self.lock();
        let mut doc = self.load()?;
        apply(&mut doc);
        write_json_atomic(&self.path, &doc)
            .with_context(|| format!("failed to store settings at {}", self.path.display()))?;
        if announce {
            *self.seen() = Some(self.fingerprint_of(&doc));
            self.notifier.bump();
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn seen(&self) -> MutexGuard<'_, Option<Fingerprint>> {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slideshow_from(&self, doc: &SettingsDocument) -> SlideshowConfig {
        SlideshowConfig {
            enabled: doc.slideshow_enabled,
            interval: doc
                .slideshow_interval
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(self.default_interval),
            filter: doc.active_filter.clone(),
        }
    }

    fn fingerprint_of(&self, doc: &SettingsDocument) -> Fingerprint {
        let config = self.slideshow_from(doc);
        let filter = config
            .filter
            .as_ref()
            .and_then(|id| doc.filters.get(id).cloned());
        (config, filter)
    }

    /// Whether the document on disk differs from what the generation last
    /// moved for; remembers the new state when it does.
    fn changed_on_disk(&self) -> Result<bool> {
        let _guard = self.lock();
        let current = self.fingerprint_of(&self.load()?);
        let mut seen = self.seen();
        if seen.as_ref() == Some(&current) {
            return Ok(false);
        }
        *seen = Some(current);
        Ok(true)
    }

    /// Follow external edits of the settings file until cancelled, bumping
    /// the generation when the slideshow configuration actually changed.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn run_watch(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Result<Event>>(32);
        let mut watcher = recommended_watcher(move |res| {
            let _ = watch_tx.blocking_send(res);
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!("settings watcher initialized");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cancel received; exiting settings watcher");
                    break;
                }
                Some(res) = watch_rx.recv() => match res {
                    Ok(event) => {
                        if !self.concerns_us(&event) {
                            continue;
                        }
                        match self.changed_on_disk() {
                            Ok(true) => {
                                let generation = self.notifier.bump();
                                debug!(generation, "settings changed on disk");
                            }
                            Ok(false) => {}
                            Err(err) => warn!(error = %format!("{err:#}"), "settings file unreadable"),
                        }
                    }
                    Err(err) => error!("watch error: {err}"),
                }
            }
        }
        Ok(())
    }

    fn concerns_us(&self, event: &Event) -> bool {
        matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) && event
            .paths
            .iter()
            .any(|path| path.file_name() == self.path.file_name())
    }
}

impl SettingsStore for JsonSettingsStore {
    fn slideshow(&self) -> Result<SlideshowConfig> {
        let doc = self.load()?;
        Ok(self.slideshow_from(&doc))
    }

    fn set_slideshow(&self, config: &SlideshowConfig) -> Result<()> {
        self.write(
            |doc| {
                doc.slideshow_enabled = config.enabled;
                doc.slideshow_interval = Some(config.interval.as_secs().max(1));
                doc.active_filter = config.filter.clone();
            },
            true,
        )?;
        info!(
            enabled = config.enabled,
            interval = %humantime::format_duration(config.interval),
            filter = ?config.filter,
            "slideshow settings stored"
        );
        Ok(())
    }

    fn active_art(&self) -> Result<Option<ActiveArt>> {
        let doc = self.load()?;
        Ok(doc.current_active_image.map(|image_id| ActiveArt {
            image_id,
            since: doc.current_active_image_since.unwrap_or_else(Utc::now),
        }))
    }

    fn set_active_art(&self, art: &ActiveArt) -> Result<()> {
        self.update(|doc| {
            doc.current_active_image = Some(art.image_id.clone());
            doc.current_active_image_since = Some(art.since);
        })
    }

    fn filter(&self, id: &FilterId) -> Result<Option<SavedFilter>> {
        Ok(self.load()?.filters.remove(id))
    }

    fn save_filter(&self, id: &FilterId, filter: SavedFilter) -> Result<()> {
        self.write(
            |doc| {
                doc.filters.insert(id.clone(), filter);
            },
            true,
        )
    }

    fn auto_cleanup_enabled(&self) -> Result<bool> {
        Ok(self.load()?.auto_cleanup_enabled)
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.notifier.subscribe()
    }
}
