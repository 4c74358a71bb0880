//! The photo library: a queryable set of [`Image`]s backed by a directory.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result, ensure};
use gallery_model::{DisplayOptions, Image, ImageId};
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind};
use notify::{Event, EventKind, RecursiveMode, Watcher, recommended_watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

/// Read access to the image collection.
pub trait ImageStore: Send + Sync {
    fn image(&self, id: &ImageId) -> Option<Image>;
    /// Every image, in identity order.
    fn images(&self) -> Vec<Image>;
}

const SIDECAR_EXTENSION: &str = "yaml";
const THUMBNAIL_SUFFIX: &str = ".thumbnail.jpg";

/// In-memory index of a photo directory.
///
/// Identities are library-relative paths with `/` separators, so they stay
/// stable across restarts and machines. Display hints are read from an
/// optional YAML sidecar next to the image (`beach.jpg.yaml`).
pub struct LibraryIndex {
    root: PathBuf,
    images: RwLock<BTreeMap<ImageId, Image>>,
}

impl LibraryIndex {
    /// Build an index by scanning `root` recursively.
    pub fn scan(root: impl Into<PathBuf>) -> Result<Self> {
        let index = Self {
            root: root.into(),
            images: RwLock::new(BTreeMap::new()),
        };
        index.rescan()?;
        Ok(index)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Replace the index contents with a fresh walk of the root.
    pub fn rescan(&self) -> Result<usize> {
        ensure!(
            self.root.is_dir(),
            "library path {} is not a directory",
            self.root.display()
        );
        let mut fresh = BTreeMap::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if !is_image(path) {
                continue;
            }
            match self.load(path) {
                Ok(image) => {
                    fresh.insert(image.id.clone(), image);
                }
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable image"),
            }
        }
        let count = fresh.len();
        *self.write() = fresh;
        info!(root = %self.root.display(), images = count, "library scan complete");
        Ok(count)
    }

    /// Re-read one image (or its sidecar) after a filesystem change.
    pub fn refresh_path(&self, path: &Path) {
        let Some(image_path) = image_path_for(path) else {
            return;
        };
        let Some(id) = self.identity(&image_path) else {
            return;
        };
        if !image_path.is_file() {
            self.remove_id(&id);
            return;
        }
        match self.load(&image_path) {
            Ok(image) => {
                let added = self.write().insert(id.clone(), image).is_none();
                debug!(image = %id, added, "library entry refreshed");
            }
            Err(err) => {
                debug!(image = %id, error = %err, "image not readable yet");
                self.remove_id(&id);
            }
        }
    }

    pub fn remove_path(&self, path: &Path) {
        if let Some(image_path) = image_path_for(path) {
            if image_path != path {
                // A removed sidecar only drops the display hints.
                self.refresh_path(&image_path);
                return;
            }
            if let Some(id) = self.identity(&image_path) {
                self.remove_id(&id);
            }
        }
    }

    fn remove_id(&self, id: &ImageId) {
        if self.write().remove(id).is_some() {
            info!(image = %id, "image removed from library");
        }
    }

    fn identity(&self, path: &Path) -> Option<ImageId> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect();
        (!parts.is_empty()).then(|| ImageId::new(parts.join("/")))
    }

    fn load(&self, path: &Path) -> Result<Image> {
        let id = self
            .identity(path)
            .with_context(|| format!("{} is outside the library", path.display()))?;
        let (width, height) = image::image_dimensions(path)
            .with_context(|| format!("failed to read dimensions of {}", path.display()))?;
        let display = read_sidecar(path)?;
        Ok(Image::new(id, path, width, height).with_display(display))
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<ImageId, Image>> {
        self.images.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<ImageId, Image>> {
        self.images
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Keep the index in step with the directory until cancelled.
    #[instrument(skip_all, fields(root = %self.root.display()))]
    pub async fn run_watch(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Result<Event>>(128);
        let mut watcher = recommended_watcher(move |res| {
            let _ = watch_tx.blocking_send(res);
        })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        info!("library watcher initialized (recursive)");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cancel received; exiting library watcher");
                    break;
                }
                Some(res) = watch_rx.recv() => match res {
                    Ok(event) => self.apply(event),
                    Err(err) => error!("watch error: {err}"),
                }
            }
        }
        Ok(())
    }

    fn apply(&self, event: Event) {
        debug!(kind = ?event.kind, paths = ?event.paths, "notify event");
        match event.kind {
            EventKind::Create(CreateKind::File)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                for path in &event.paths {
                    self.refresh_path(path);
                }
            }
            EventKind::Remove(RemoveKind::File) => {
                for path in &event.paths {
                    self.remove_path(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in &event.paths {
                    if path.exists() {
                        self.refresh_path(path);
                    } else {
                        self.remove_path(path);
                    }
                }
            }
            _ => {}
        }
    }
}

impl ImageStore for LibraryIndex {
    fn image(&self, id: &ImageId) -> Option<Image> {
        self.read().get(id).cloned()
    }

    fn images(&self) -> Vec<Image> {
        self.read().values().cloned().collect()
    }
}

fn is_image(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(OsStr::to_str) else {
        return false;
    };
    let lowered = name.to_ascii_lowercase();
    if lowered.ends_with(THUMBNAIL_SUFFIX) {
        return false;
    }
    [".jpg", ".jpeg", ".png"]
        .iter()
        .any(|ext| lowered.ends_with(ext))
}

/// The image a changed path belongs to: itself, or the image of a sidecar.
fn image_path_for(path: &Path) -> Option<PathBuf> {
    if is_image(path) {
        return Some(path.to_path_buf());
    }
    if path.extension().and_then(OsStr::to_str) == Some(SIDECAR_EXTENSION) {
        let image = path.with_extension("");
        return is_image(&image).then_some(image);
    }
    None
}

fn sidecar_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_os_string();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

fn read_sidecar(image: &Path) -> Result<DisplayOptions> {
    let path = sidecar_path(image);
    match std::fs::read(&path) {
        Ok(data) => serde_yaml::from_slice(&data)
            .with_context(|| format!("failed to parse display options at {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(DisplayOptions::default()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn write_png(path: &Path, width: u32, height: u32) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        image::RgbImage::new(width, height).save(path).unwrap();
    }

    #[test]
    fn scan_indexes_images_by_relative_path() {
        let dir = tempdir().unwrap();
        write_png(&dir.path().join("2024/kenya/a.png"), 32, 18);
        write_png(&dir.path().join("b.png"), 10, 10);
        write_png(&dir.path().join("b.thumbnail.jpg"), 4, 4);
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let index = LibraryIndex::scan(dir.path()).unwrap();
        let ids: Vec<String> = index.images().into_iter().map(|i| i.id.to_string()).collect();
        assert_eq!(ids, vec!["2024/kenya/a.png", "b.png"]);

        let wide = index.image(&ImageId::new("2024/kenya/a.png")).unwrap();
        assert_eq!((wide.aspect_width, wide.aspect_height), (16, 9));
        assert_eq!(wide.filename, "a.png");
    }

    #[test]
    fn thumbnails_are_not_images() {
        assert!(!is_image(Path::new("a/photo.thumbnail.jpg")));
        assert!(is_image(Path::new("a/photo.JPG")));
        assert!(!is_image(Path::new("a/photo.gif")));
    }

    #[test]
    fn sidecar_supplies_display_options() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("beach.png");
        write_png(&image, 20, 10);
        // Keys the device has no use for are ignored.
        std::fs::write(
            sidecar_path(&image),
            "duration: 90s\nalignment: top\nmatte: modern_polar\n",
        )
        .unwrap();

        let index = LibraryIndex::scan(dir.path()).unwrap();
        let entry = index.image(&ImageId::new("beach.png")).unwrap();
        assert_eq!(entry.display.duration, Some(Duration::from_secs(90)));
        assert_eq!(entry.display.matte.as_deref(), Some("modern_polar"));
    }

    #[test]
    fn refresh_and_remove_track_the_directory() {
        let dir = tempdir().unwrap();
        let index = LibraryIndex::scan(dir.path()).unwrap();
        assert!(index.is_empty());

        let path = dir.path().join("new.png");
        write_png(&path, 8, 8);
        index.refresh_path(&path);
        assert_eq!(index.len(), 1);

        std::fs::remove_file(&path).unwrap();
        index.remove_path(&path);
        assert!(index.is_empty());
    }

    #[test]
    fn scan_rejects_missing_root() {
        let dir = tempdir().unwrap();
        assert!(LibraryIndex::scan(dir.path().join("missing")).is_err());
    }
}
