#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use frame_gallery::broadcast::{EventBroadcaster, Subscription};
use frame_gallery::device::scripted::ScriptedDevice;
use frame_gallery::device::{BackoffPolicy, DeviceLink, LinkOptions};
use frame_gallery::events::GalleryEvent;
use frame_gallery::filter::{FilterEvaluator, SavedFilter};
use frame_gallery::library::ImageStore;
use frame_gallery::scheduler::{SchedulerDeps, SchedulerOptions, SlideshowHandle, SlideshowScheduler};
use frame_gallery::settings::{ChangeNotifier, SettingsStore};
use frame_gallery::upload::{JsonUploadCache, UploadCoordinator, UploadOptions};
use gallery_model::{ActiveArt, FilterId, Image, ImageId, SlideshowConfig};
use std::collections::BTreeMap;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

/// Image store backed by a plain list.
#[derive(Default)]
pub struct MemoryImages {
    images: RwLock<Vec<Image>>,
}

impl MemoryImages {
    pub fn new(mut images: Vec<Image>) -> Self {
        images.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            images: RwLock::new(images),
        }
    }
}

impl ImageStore for MemoryImages {
    fn image(&self, id: &ImageId) -> Option<Image> {
        self.images
            .read()
            .unwrap()
            .iter()
            .find(|image| &image.id == id)
            .cloned()
    }

    fn images(&self) -> Vec<Image> {
        self.images.read().unwrap().clone()
    }
}

#[derive(Default)]
struct SettingsState {
    slideshow: SlideshowConfig,
    active: Option<ActiveArt>,
    filters: BTreeMap<FilterId, SavedFilter>,
    auto_cleanup: bool,
}

/// Settings kept in memory, with the same change signalling as the JSON store.
#[derive(Default)]
pub struct MemorySettings {
    state: Mutex<SettingsState>,
    notifier: ChangeNotifier,
}

impl MemorySettings {
    pub fn with_slideshow(config: SlideshowConfig) -> Self {
        let settings = Self::default();
        settings.state.lock().unwrap().slideshow = config;
        settings
    }

    pub fn set_active(&self, image: &str) {
        self.state.lock().unwrap().active = Some(ActiveArt {
            image_id: ImageId::new(image),
            since: chrono::Utc::now(),
        });
    }

    pub fn set_auto_cleanup(&self, enabled: bool) {
        self.state.lock().unwrap().auto_cleanup = enabled;
    }

    /// Edit the slideshow as an external writer would.
    pub fn edit_slideshow(&self, edit: impl FnOnce(&mut SlideshowConfig)) {
        edit(&mut self.state.lock().unwrap().slideshow);
        self.notifier.bump();
    }

    /// Signal a change without changing anything.
    pub fn touch(&self) {
        self.notifier.bump();
    }
}

impl SettingsStore for MemorySettings {
    fn slideshow(&self) -> Result<SlideshowConfig> {
        Ok(self.state.lock().unwrap().slideshow.clone())
    }

    fn set_slideshow(&self, config: &SlideshowConfig) -> Result<()> {
        self.state.lock().unwrap().slideshow = config.clone();
        self.notifier.bump();
        Ok(())
    }

    fn active_art(&self) -> Result<Option<ActiveArt>> {
        Ok(self.state.lock().unwrap().active.clone())
    }

    fn set_active_art(&self, art: &ActiveArt) -> Result<()> {
        self.state.lock().unwrap().active = Some(art.clone());
        Ok(())
    }

    fn filter(&self, id: &FilterId) -> Result<Option<SavedFilter>> {
        Ok(self.state.lock().unwrap().filters.get(id).cloned())
    }

    fn save_filter(&self, id: &FilterId, filter: SavedFilter) -> Result<()> {
        self.state.lock().unwrap().filters.insert(id.clone(), filter);
        self.notifier.bump();
        Ok(())
    }

    fn auto_cleanup_enabled(&self) -> Result<bool> {
        Ok(self.state.lock().unwrap().auto_cleanup)
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.notifier.subscribe()
    }
}

/// Write small placeholder files and describe them as 16:9 images.
pub fn write_library(dir: &Path, names: &[&str]) -> Vec<Image> {
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, format!("pixels of {name}")).unwrap();
            Image::new(*name, path, 1920, 1080)
        })
        .collect()
}

pub fn fast_link_options() -> LinkOptions {
    LinkOptions {
        connect_timeout: Duration::from_millis(300),
        health_interval: Duration::from_secs(60),
        health_timeout: Duration::from_millis(200),
        backoff: BackoffPolicy {
            base: Duration::from_millis(20),
            multiplier: 2.0,
            max_delay: Duration::from_millis(80),
            jitter: Duration::ZERO,
            max_attempts: Some(5),
        },
        backoff_seed: Some(7),
        ..LinkOptions::default()
    }
}

pub struct LinkHarness {
    pub device: ScriptedDevice,
    pub link: DeviceLink,
    pub events: EventBroadcaster,
    pub cancel: CancellationToken,
    pub supervisor: JoinHandle<Result<()>>,
}

impl LinkHarness {
    /// A link with its supervisor running, not yet asked to connect.
    pub fn start(device: ScriptedDevice, options: LinkOptions) -> Self {
        let events = EventBroadcaster::new(128);
        let link = DeviceLink::new(device.transport(), options, events.clone());
        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(link.clone().run_supervisor(cancel.clone()));
        Self {
            device,
            link,
            events,
            cancel,
            supervisor,
        }
    }

    pub async fn connected(device: ScriptedDevice) -> Self {
        let harness = Self::start(device, fast_link_options());
        harness.link.ensure_connected(WAIT).await.expect("device connects");
        harness
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.supervisor.await.expect("join").expect("supervisor");
    }
}

/// Wait for the first event matching `pick`.
pub async fn next_matching<T>(
    subscription: &mut Subscription,
    mut pick: impl FnMut(GalleryEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = subscription.recv().await.expect("broadcaster open");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held")
}

pub struct Gallery {
    pub link: LinkHarness,
    pub images: Arc<MemoryImages>,
    pub settings: Arc<MemorySettings>,
    pub uploads: UploadCoordinator,
    pub slideshow: SlideshowHandle,
    pub scheduler: JoinHandle<Result<()>>,
    pub dir: TempDir,
}

impl Gallery {
    pub async fn start(
        device: ScriptedDevice,
        names: &[&str],
        settings: MemorySettings,
        options: SchedulerOptions,
    ) -> Self {
        let link = LinkHarness::connected(device).await;
        Self::with_link(link, names, settings, options)
    }

    pub fn with_link(
        link: LinkHarness,
        names: &[&str],
        settings: MemorySettings,
        options: SchedulerOptions,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let images = Arc::new(MemoryImages::new(write_library(dir.path(), names)));
        let settings = Arc::new(settings);
        let uploads = UploadCoordinator::new(
            link.link.clone(),
            images.clone(),
            Arc::new(JsonUploadCache::in_memory()),
            UploadOptions {
                timeout: Duration::from_secs(2),
                ..UploadOptions::default()
            },
        );
        let (scheduler, slideshow) = SlideshowScheduler::new(
            SchedulerDeps {
                link: link.link.clone(),
                uploads: uploads.clone(),
                filters: FilterEvaluator::new(images.clone(), settings.clone()),
                images: images.clone(),
                settings: settings.clone(),
                events: link.events.clone(),
            },
            SchedulerOptions {
                command_timeout: Duration::from_secs(1),
                ..options
            },
        );
        let scheduler = tokio::spawn(scheduler.run(link.cancel.clone()));
        Self {
            link,
            images,
            settings,
            uploads,
            slideshow,
            scheduler,
            dir,
        }
    }

    pub fn device(&self) -> &ScriptedDevice {
        &self.link.device
    }

    pub async fn shutdown(self) {
        self.link.cancel.cancel();
        self.scheduler.await.expect("join").expect("scheduler");
        self.link.shutdown().await;
    }
}

pub fn enabled(interval: Duration) -> SlideshowConfig {
    SlideshowConfig {
        enabled: true,
        interval,
        filter: None,
    }
}
