//! The slideshow driver: one task owns the timer and the active image.
//!
//! Every mutation of the active image goes through [`SlideshowScheduler::run`],
//! whether it comes from the timer or from a [`SlideshowHandle`], so two
//! switches never race.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use gallery_model::{ActiveArt, ContentId, Image, ImageId, SelectionPolicy, SlideshowConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broadcast::EventBroadcaster;
use crate::device::{DeviceCommand, DeviceLink, commands};
use crate::error::{DeviceError, SlideshowError};
use crate::events::GalleryEvent;
use crate::filter::FilterEvaluator;
use crate::library::ImageStore;
use crate::settings::SettingsStore;
use crate::upload::UploadCoordinator;

/// Shortest interval the timer will arm for.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub selection: SelectionPolicy,
    /// Fixed seed for the random policy; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Switch immediately when the slideshow gets enabled instead of waiting
    /// one interval.
    pub fire_on_enable: bool,
    pub command_timeout: Duration,
    /// Device content category passed to `select_image`.
    pub category: String,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            selection: SelectionPolicy::Random,
            seed: None,
            fire_on_enable: false,
            command_timeout: Duration::from_secs(15),
            category: "MY-C0002".to_string(),
        }
    }
}

/// What the scheduler needs from the rest of the system.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub link: DeviceLink,
    pub uploads: UploadCoordinator,
    pub filters: FilterEvaluator,
    pub images: Arc<dyn ImageStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub events: EventBroadcaster,
}

enum Request {
    Configure(SlideshowConfig, oneshot::Sender<Result<(), SlideshowError>>),
    Advance(oneshot::Sender<Result<ActiveArt, SlideshowError>>),
    Activate(ImageId, oneshot::Sender<Result<ActiveArt, SlideshowError>>),
}

/// Where a switch was requested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Timer,
    Manual,
}

/// Cloneable remote control for a running scheduler.
#[derive(Clone)]
pub struct SlideshowHandle {
    requests: mpsc::Sender<Request>,
    settings: Arc<dyn SettingsStore>,
    active: watch::Receiver<Option<ActiveArt>>,
    next_tick: watch::Receiver<Option<Instant>>,
}

impl SlideshowHandle {
    /// Store a new configuration and re-arm the timer accordingly.
    ///
    /// The write lands before the scheduler sees the request, so a tick that
    /// is still uploading gives way instead of switching under the old
    /// configuration.
    pub async fn configure(&self, config: SlideshowConfig) -> Result<(), SlideshowError> {
        self.settings
            .set_slideshow(&config)
            .map_err(SlideshowError::Store)?;
        self.request(|reply| Request::Configure(config, reply)).await
    }

    /// Switch to the next image now, even while the slideshow is disabled.
    pub async fn advance(&self) -> Result<ActiveArt, SlideshowError> {
        self.request(Request::Advance).await
    }

    /// Display a specific library image.
    pub async fn activate(&self, image: ImageId) -> Result<ActiveArt, SlideshowError> {
        self.request(|reply| Request::Activate(image, reply)).await
    }

    pub fn active_art(&self) -> Option<ActiveArt> {
        self.active.borrow().clone()
    }

    pub fn active_changes(&self) -> watch::Receiver<Option<ActiveArt>> {
        self.active.clone()
    }

    /// When the timer fires next; `None` while disabled.
    pub fn next_tick(&self) -> Option<Instant> {
        *self.next_tick.borrow()
    }

    pub fn next_tick_changes(&self) -> watch::Receiver<Option<Instant>> {
        self.next_tick.clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, SlideshowError>>) -> Request,
    ) -> Result<T, SlideshowError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(build(reply))
            .await
            .map_err(|_| SlideshowError::Stopped)?;
        response.await.map_err(|_| SlideshowError::Stopped)?
    }
}

/// A successful switch and how long the new image wants to stay up.
struct Switched {
    art: ActiveArt,
    hold: Option<Duration>,
}

pub struct SlideshowScheduler {
    deps: SchedulerDeps,
    options: SchedulerOptions,
    rng: StdRng,
    config: SlideshowConfig,
    deadline: Option<Instant>,
    generation: watch::Receiver<u64>,
    requests: mpsc::Receiver<Request>,
    active: watch::Sender<Option<ActiveArt>>,
    next_tick: watch::Sender<Option<Instant>>,
}

impl SlideshowScheduler {
    pub fn new(deps: SchedulerDeps, options: SchedulerOptions) -> (Self, SlideshowHandle) {
        let (requests_tx, requests) = mpsc::channel(16);
        let (active, active_rx) = watch::channel(None);
        let (next_tick, next_tick_rx) = watch::channel(None);
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let generation = deps.settings.changes();
        let scheduler = Self {
            deps,
            options,
            rng,
            config: SlideshowConfig::default(),
            deadline: None,
            generation,
            requests,
            active,
            next_tick,
        };
        let handle = SlideshowHandle {
            requests: requests_tx,
            settings: scheduler.deps.settings.clone(),
            active: active_rx,
            next_tick: next_tick_rx,
        };
        (scheduler, handle)
    }

    #[instrument(name = "slideshow", skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        self.restore_active_art();
        self.generation.mark_unchanged();
        let config = self.read_config();
        self.apply_config(config);
        info!(
            enabled = self.config.enabled,
            interval = %humantime::format_duration(self.config.interval),
            policy = ?self.options.selection,
            "slideshow scheduler started"
        );

        loop {
            let deadline = self.deadline;
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cancel received; stopping slideshow scheduler");
                    break;
                }
                Ok(()) = self.generation.changed() => {
                    let config = self.read_config();
                    self.apply_config(config);
                }
                Some(request) = self.requests.recv() => {
                    self.handle(request, &cancel).await;
                }
                _ = timer => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.on_timer() => {}
                    }
                }
            }
        }

        self.arm(None);
        Ok(())
    }

    fn restore_active_art(&mut self) {
        match self.deps.settings.active_art() {
            Ok(Some(art)) if self.deps.images.image(&art.image_id).is_some() => {
                info!(image = %art.image_id, since = %art.since, "restored active image");
                self.active.send_replace(Some(art));
            }
            Ok(Some(art)) => {
                debug!(image = %art.image_id, "stored active image is no longer in the library");
            }
            Ok(None) => {}
            Err(err) => warn!(error = %format!("{err:#}"), "failed to read active image"),
        }
    }

    /// Latest stored configuration; a store error keeps the previous one.
    fn read_config(&self) -> SlideshowConfig {
        match self.deps.settings.slideshow() {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to read slideshow settings");
                self.config.clone()
            }
        }
    }

    /// Adopt `next`, cancelling or re-arming the timer as the change demands.
    fn apply_config(&mut self, mut next: SlideshowConfig) {
        next.interval = next.interval.max(MIN_INTERVAL);
        let previous = std::mem::replace(&mut self.config, next);
        let now = Instant::now();
        let interval = self.config.interval;

        let deadline = match (previous.enabled, self.config.enabled) {
            (_, false) => None,
            (false, true) if self.options.fire_on_enable => Some(now),
            (false, true) => Some(now + interval),
            (true, true) if previous.interval != interval => Some(now + interval),
            (true, true) => self.deadline.or(Some(now + interval)),
        };
        if previous != self.config {
            info!(
                enabled = self.config.enabled,
                interval = %humantime::format_duration(interval),
                filter = ?self.config.filter,
                "slideshow configuration changed"
            );
        }
        self.arm(deadline);
    }

    fn arm(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
        self.next_tick.send_if_modified(|current| {
            let changed = *current != deadline;
            *current = deadline;
            changed
        });
    }

    async fn handle(&mut self, request: Request, cancel: &CancellationToken) {
        match request {
            Request::Configure(config, reply) => {
                // Already stored by the handle.
                self.generation.mark_unchanged();
                self.apply_config(config);
                let _ = reply.send(Ok(()));
            }
            Request::Advance(reply) => {
                let config = self.read_config();
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(SlideshowError::Stopped),
                    result = self.advance(&config, Trigger::Manual) => result,
                };
                let _ = reply.send(self.after_manual_switch(result));
            }
            Request::Activate(image, reply) => {
                let result = match self.deps.images.image(&image) {
                    None => Err(SlideshowError::UnknownImage(image)),
                    Some(image) => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => Err(SlideshowError::Stopped),
                            result = self.display(image, Trigger::Manual) => result,
                        }
                    }
                };
                let _ = reply.send(self.after_manual_switch(result));
            }
        }
    }

    /// A manual switch starts a fresh window for the running slideshow.
    fn after_manual_switch(
        &mut self,
        result: Result<Switched, SlideshowError>,
    ) -> Result<ActiveArt, SlideshowError> {
        match result {
            Ok(switched) => {
                if self.config.enabled {
                    let hold = switched.hold.unwrap_or(self.config.interval);
                    self.arm(Some(Instant::now() + hold));
                }
                Ok(switched.art)
            }
            Err(err) => {
                warn!(error = %err, "manual slideshow request failed");
                Err(err)
            }
        }
    }

    async fn on_timer(&mut self) {
        self.generation.mark_unchanged();
        let config = self.read_config();
        if !config.enabled {
            self.apply_config(config);
            return;
        }
        self.config = SlideshowConfig {
            interval: config.interval.max(MIN_INTERVAL),
            ..config
        };

        let config = self.config.clone();
        let hold = match self.advance(&config, Trigger::Timer).await {
            Ok(switched) => switched.hold,
            Err(SlideshowError::Superseded) => {
                debug!("slideshow tick superseded by a configuration change");
                // The fired deadline is spent; arm from the stored settings.
                self.deadline = None;
                let config = self.read_config();
                self.apply_config(config);
                return;
            }
            Err(err) => {
                log_skipped_tick(&err);
                None
            }
        };
        let delay = hold.unwrap_or(self.config.interval).max(MIN_INTERVAL);
        debug!(delay = %humantime::format_duration(delay), "slideshow timer re-armed");
        self.arm(Some(Instant::now() + delay));
    }

    async fn advance(
        &mut self,
        config: &SlideshowConfig,
        trigger: Trigger,
    ) -> Result<Switched, SlideshowError> {
        if !self.deps.link.current_state().is_connected() {
            return Err(SlideshowError::NotConnected);
        }
        let eligible = self.deps.filters.eligible(config.filter.as_ref())?;
        let active = self.active.borrow().as_ref().map(|art| art.image_id.clone());
        let image = choose_next(
            self.options.selection,
            &mut self.rng,
            &eligible,
            active.as_ref(),
        )
        .cloned()
        .ok_or(SlideshowError::NoEligibleImages)?;
        debug!(image = %image.id, eligible = eligible.len(), "picked next image");
        self.display(image, trigger).await
    }

    /// Make `image` the device's active art. `ActiveArt` only moves once the
    /// device confirmed the switch.
    async fn display(&mut self, image: Image, trigger: Trigger) -> Result<Switched, SlideshowError> {
        if !self.deps.link.current_state().is_connected() {
            return Err(SlideshowError::NotConnected);
        }

        let content = self.upload(&image.id, trigger).await?;
        self.check_current(trigger)?;
        match self.select(&content).await {
            Ok(()) => {}
            Err(DeviceError::StaleContent(_)) => {
                info!(image = %image.id, content = %content, "device forgot uploaded content; uploading again");
                self.deps.uploads.invalidate(&image.id);
                let content = self.upload(&image.id, trigger).await?;
                self.check_current(trigger)?;
                self.select(&content).await?;
            }
            Err(err) => return Err(err.into()),
        }

        let art = ActiveArt {
            image_id: image.id.clone(),
            since: Utc::now(),
        };
        self.active.send_replace(Some(art.clone()));
        if let Err(err) = self.deps.settings.set_active_art(&art) {
            warn!(image = %art.image_id, error = %format!("{err:#}"), "failed to persist active image");
        }
        let receivers = self.deps.events.publish(GalleryEvent::slideshow_update(&art));
        info!(image = %art.image_id, ?trigger, receivers, "active image switched");
        Ok(Switched {
            art,
            hold: image.display.duration,
        })
    }

    /// Upload `image`. A timer tick stops waiting as soon as the settings
    /// change; the upload itself carries on and lands in the cache.
    async fn upload(&mut self, image: &ImageId, trigger: Trigger) -> Result<ContentId, SlideshowError> {
        let uploads = &self.deps.uploads;
        let generation = &mut self.generation;
        tokio::select! {
            result = uploads.ensure_uploaded(image) => Ok(result?),
            _ = settings_moved(generation, trigger) => Err(SlideshowError::Superseded),
        }
    }

    /// Timer ticks give way when the configuration moved underneath them.
    fn check_current(&self, trigger: Trigger) -> Result<(), SlideshowError> {
        if trigger == Trigger::Timer && self.generation.has_changed().unwrap_or(false) {
            return Err(SlideshowError::Superseded);
        }
        Ok(())
    }

    async fn select(&self, content: &ContentId) -> Result<(), DeviceError> {
        let command = DeviceCommand::new(
            commands::SELECT_IMAGE,
            json!({
                "content_id": content,
                "category": self.options.category,
                "show": true,
            }),
        );
        self.deps
            .link
            .send_command(command, self.options.command_timeout)
            .await
            .map(|_| ())
    }
}

/// Resolves once the settings generation moves; never for manual requests.
async fn settings_moved(generation: &mut watch::Receiver<u64>, trigger: Trigger) {
    if trigger == Trigger::Manual || generation.changed().await.is_err() {
        pending::<()>().await;
    }
}

fn log_skipped_tick(err: &SlideshowError) {
    match err {
        SlideshowError::NotConnected => info!("device not connected; skipping slideshow tick"),
        SlideshowError::NoEligibleImages => info!("no eligible images; skipping slideshow tick"),
        _ => warn!(error = %err, class = ?err.class(), "slideshow tick failed"),
    }
}

/// Pick the next image to display from `eligible` (identity order).
///
/// The active image is excluded unless it is the only candidate.
pub fn choose_next<'a, R: Rng>(
    policy: SelectionPolicy,
    rng: &mut R,
    eligible: &'a [Image],
    active: Option<&ImageId>,
) -> Option<&'a Image> {
    if eligible.len() <= 1 {
        return eligible.first();
    }
    let candidates: Vec<&Image> = eligible
        .iter()
        .filter(|image| Some(&image.id) != active)
        .collect();
    match policy {
        SelectionPolicy::Random => {
            let index = rng.random_range(0..candidates.len());
            candidates.get(index).copied()
        }
        SelectionPolicy::Sequential => candidates
            .iter()
            .find(|image| active.is_none_or(|active| &image.id > active))
            .or_else(|| candidates.first())
            .copied(),
    }
}
