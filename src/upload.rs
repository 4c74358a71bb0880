//! Exactly-once transfer of library images to the device.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use gallery_model::{ContentId, Image, ImageId, UploadRecord};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::device::{DeviceCommand, DeviceLink, commands};
use crate::error::{DeviceError, UploadError};
use crate::library::ImageStore;
use crate::persist::{read_json_optional, write_json_atomic};

/// Durable `image -> content id` table. Only the coordinator writes it.
pub trait UploadCache: Send + Sync {
    fn get(&self, image: &ImageId) -> Option<UploadRecord>;
    fn put(&self, record: UploadRecord) -> Result<()>;
    fn remove(&self, image: &ImageId) -> Result<Option<UploadRecord>>;
    /// Drop every record pointing at `content`.
    fn remove_content(&self, content: &ContentId) -> Result<Vec<UploadRecord>>;
    fn records(&self) -> Vec<UploadRecord>;
}

/// Upload cache kept in memory and written through to one JSON file.
pub struct JsonUploadCache {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<ImageId, UploadRecord>>,
}

impl JsonUploadCache {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records: Vec<UploadRecord> = read_json_optional(&path)?.unwrap_or_default();
        debug!(path = %path.display(), records = records.len(), "loaded upload cache");
        Ok(Self {
            path: Some(path),
            records: Mutex::new(
                records
                    .into_iter()
                    .map(|record| (record.image_id.clone(), record))
                    .collect(),
            ),
        })
    }

    /// A cache that forgets everything on exit.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ImageId, UploadRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, records: &BTreeMap<ImageId, UploadRecord>) -> Result<()> {
        match &self.path {
            Some(path) => {
                let list: Vec<&UploadRecord> = records.values().collect();
                write_json_atomic(path, &list)
            }
            None => Ok(()),
        }
    }
}

impl UploadCache for JsonUploadCache {
    fn get(&self, image: &ImageId) -> Option<UploadRecord> {
        self.lock().get(image).cloned()
    }

    fn put(&self, record: UploadRecord) -> Result<()> {
        let mut records = self.lock();
        records.insert(record.image_id.clone(), record);
        self.persist(&records)
    }

    fn remove(&self, image: &ImageId) -> Result<Option<UploadRecord>> {
        let mut records = self.lock();
        let removed = records.remove(image);
        if removed.is_some() {
            self.persist(&records)?;
        }
        Ok(removed)
    }

    fn remove_content(&self, content: &ContentId) -> Result<Vec<UploadRecord>> {
        let mut records = self.lock();
        let stale: Vec<ImageId> = records
            .values()
            .filter(|record| &record.content_id == content)
            .map(|record| record.image_id.clone())
            .collect();
        let removed: Vec<UploadRecord> = stale
            .iter()
            .filter_map(|image| records.remove(image))
            .collect();
        if !removed.is_empty() {
            self.persist(&records)?;
        }
        Ok(removed)
    }

    fn records(&self) -> Vec<UploadRecord> {
        self.lock().values().cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub timeout: Duration,
    /// Device content category uploads land in.
    pub category: String,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            category: "MY-C0002".to_string(),
        }
    }
}

type UploadOutcome = Option<Result<ContentId, UploadError>>;

/// Makes "this image is on the device" idempotent.
///
/// Concurrent callers for the same image share one upload; uploads of
/// different images do not wait on each other beyond the device's own
/// command serialization. An upload runs to completion even if every caller
/// gives up on it, so its result still lands in the cache.
#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    link: DeviceLink,
    images: Arc<dyn ImageStore>,
    cache: Arc<dyn UploadCache>,
    options: UploadOptions,
    in_flight: Mutex<HashMap<ImageId, watch::Receiver<UploadOutcome>>>,
}

impl UploadCoordinator {
    pub fn new(
        link: DeviceLink,
        images: Arc<dyn ImageStore>,
        cache: Arc<dyn UploadCache>,
        options: UploadOptions,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                link,
                images,
                cache,
                options,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn cached(&self, image: &ImageId) -> Option<UploadRecord> {
        self.inner.cache.get(image)
    }

    pub async fn ensure_uploaded(&self, image: &ImageId) -> Result<ContentId, UploadError> {
        if let Some(record) = self.inner.cache.get(image) {
            debug!(%image, content = %record.content_id, "upload cache hit");
            return Ok(record.content_id);
        }

        let mut rx = {
            let mut in_flight = self.in_flight();
            // The upload task caches before it deregisters, so a result that
            // landed since the first lookup is visible here.
            if let Some(record) = self.inner.cache.get(image) {
                return Ok(record.content_id);
            }
            match in_flight.get(image) {
                Some(rx) => {
                    debug!(%image, "joining in-flight upload");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(image.clone(), rx.clone());
                    let coordinator = self.clone();
                    let image = image.clone();
                    tokio::spawn(async move {
                        let result = coordinator.upload(&image).await;
                        coordinator.finish(&image, result, tx);
                    });
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(UploadError::Interrupted))
    }

    /// Forget the cached upload of `image`. Returns whether one existed.
    pub fn invalidate(&self, image: &ImageId) -> bool {
        match self.inner.cache.remove(image) {
            Ok(removed) => {
                if let Some(record) = &removed {
                    info!(%image, content = %record.content_id, "invalidated upload record");
                }
                removed.is_some()
            }
            Err(err) => {
                warn!(%image, error = ?err, "failed to persist upload invalidation");
                true
            }
        }
    }

    /// Forget every upload that resolved to `content`.
    pub fn invalidate_content(&self, content: &ContentId) -> usize {
        match self.inner.cache.remove_content(content) {
            Ok(removed) => {
                for record in &removed {
                    info!(image = %record.image_id, %content, "invalidated upload record");
                }
                removed.len()
            }
            Err(err) => {
                warn!(%content, error = ?err, "failed to persist upload invalidation");
                0
            }
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<ImageId, watch::Receiver<UploadOutcome>>> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(
        &self,
        image: &ImageId,
        result: Result<ContentId, UploadError>,
        tx: watch::Sender<UploadOutcome>,
    ) {
        if let Ok(content_id) = &result {
            let record = UploadRecord {
                image_id: image.clone(),
                content_id: content_id.clone(),
                uploaded_at: Utc::now(),
            };
            if let Err(err) = self.inner.cache.put(record) {
                warn!(%image, error = ?err, "failed to persist upload record");
            }
        }
        self.in_flight().remove(image);
        let _ = tx.send(Some(result));
    }

    async fn upload(&self, id: &ImageId) -> Result<ContentId, UploadError> {
        let image = self
            .inner
            .images
            .image(id)
            .ok_or_else(|| UploadError::UnknownImage(id.clone()))?;
        let file_type = file_type_for(&image.path)
            .ok_or_else(|| UploadError::UnsupportedFormat(image.path.display().to_string()))?;
        let bytes = tokio::fs::read(&image.path)
            .await
            .map_err(|err| UploadError::Source {
                path: image.path.display().to_string(),
                reason: err.to_string(),
            })?;
        let matte = choose_matte(&image);

        info!(image = %id, bytes = bytes.len(), matte, "uploading image to device");
        let command = DeviceCommand::new(
            commands::SEND_IMAGE,
            json!({
                "file_type": file_type,
                "matte_id": matte,
                "portrait_matte_id": "none",
                "category": self.inner.options.category,
            }),
        )
        .with_payload(bytes);

        let response = self
            .inner
            .link
            .send_command(command, self.inner.options.timeout)
            .await
            .inspect_err(|err| warn!(image = %id, error = %err, "upload failed"))?;
        let content_id = response
            .str_field("content_id")
            .map(ContentId::new)
            .ok_or_else(|| DeviceError::Rejected {
                command: commands::SEND_IMAGE.to_string(),
                reason: "response carried no content id".into(),
            })?;
        info!(image = %id, content = %content_id, "upload complete");
        Ok(content_id)
    }
}

/// Device file type for a library path, if the device accepts it.
pub fn file_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("jpg"),
        "png" => Some("png"),
        _ => None,
    }
}

/// Image-level matte wins; otherwise exact 16:9 fills the panel and anything
/// else gets a shadowbox.
pub fn choose_matte(image: &Image) -> &str {
    if let Some(matte) = image.display.matte.as_deref() {
        return matte;
    }
    if image.is_widescreen() {
        "none"
    } else {
        "shadowbox_black"
    }
}
