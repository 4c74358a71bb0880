//! Periodic pruning of uploaded content on the device.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDateTime;
use gallery_model::ContentId;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::device::{CONTENT_DATE_FORMAT, DeviceCommand, DeviceLink, commands};
use crate::error::DeviceError;
use crate::settings::SettingsStore;
use crate::upload::UploadCoordinator;

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub interval: Duration,
    /// Most recent items to leave on the device.
    pub keep: usize,
    pub category: String,
    pub command_timeout: Duration,
    pub chunk_size: usize,
    pub chunk_pause: Duration,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            keep: 3,
            category: "MY-C0002".to_string(),
            command_timeout: Duration::from_secs(15),
            chunk_size: 20,
            chunk_pause: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub listed: usize,
    pub kept: usize,
    pub deleted: Vec<ContentId>,
    pub failed: Vec<ContentId>,
}

/// One row of the device's content listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceFile {
    pub content_id: ContentId,
    pub file_name: String,
    pub file_type: String,
    pub size: Option<u64>,
    /// As reported by the device, `%Y:%m:%d %H:%M:%S`.
    pub date: Option<String>,
    pub category: String,
    pub matte: Option<String>,
}

#[derive(Debug, Clone)]
struct ContentItem {
    id: ContentId,
    added: NaiveDateTime,
}

#[derive(Clone)]
pub struct DeviceCleaner {
    link: DeviceLink,
    uploads: UploadCoordinator,
    settings: Arc<dyn SettingsStore>,
    options: CleanupOptions,
}

impl DeviceCleaner {
    pub fn new(
        link: DeviceLink,
        uploads: UploadCoordinator,
        settings: Arc<dyn SettingsStore>,
        options: CleanupOptions,
    ) -> Self {
        Self {
            link,
            uploads,
            settings,
            options,
        }
    }

    /// Content the device holds in `category`, or the upload category when
    /// none is given.
    pub async fn list_files(&self, category: Option<&str>) -> Result<Vec<DeviceFile>, DeviceError> {
        let category = category.unwrap_or(&self.options.category);
        let listing = self
            .link
            .send_command(
                DeviceCommand::new(commands::GET_CONTENT_LIST, json!({ "category": category })),
                self.options.command_timeout,
            )
            .await?;
        let files = parse_device_files(&listing.data, category);
        debug!(category, files = files.len(), "listed device content");
        Ok(files)
    }

    /// Delete everything in the category except the most recent items and
    /// whatever is on screen.
    pub async fn run_once(&self) -> Result<CleanupReport, DeviceError> {
        let listing = self
            .link
            .send_command(
                DeviceCommand::new(
                    commands::GET_CONTENT_LIST,
                    json!({ "category": self.options.category }),
                ),
                self.options.command_timeout,
            )
            .await?;
        let mut items = parse_content_list(&listing.data);
        // Newest first; undated items sort as oldest.
        items.sort_by(|a, b| b.added.cmp(&a.added));

        let mut protected: HashSet<ContentId> = items
            .iter()
            .take(self.options.keep)
            .map(|item| item.id.clone())
            .collect();
        if let Some(active) = self.active_content() {
            protected.insert(active);
        }

        let doomed: Vec<ContentId> = items
            .iter()
            .filter(|item| !protected.contains(&item.id))
            .map(|item| item.id.clone())
            .collect();
        let mut report = CleanupReport {
            listed: items.len(),
            kept: items.len() - doomed.len(),
            ..CleanupReport::default()
        };
        if doomed.is_empty() {
            debug!(listed = report.listed, "nothing to clean up on the device");
            return Ok(report);
        }
        info!(
            listed = report.listed,
            deleting = doomed.len(),
            "deleting old content from the device"
        );

        let chunk_size = self.options.chunk_size.max(1);
        for (index, chunk) in doomed.chunks(chunk_size).enumerate() {
            if index > 0 {
                sleep(self.options.chunk_pause).await;
            }
            match self.delete(chunk).await {
                Ok(deleted) => {
                    report
                        .failed
                        .extend(chunk.iter().filter(|id| !deleted.contains(id)).cloned());
                    report.deleted.extend(deleted);
                }
                Err(err) => {
                    warn!(error = %err, chunk = chunk.len(), "content deletion failed");
                    report.failed.extend(chunk.iter().cloned());
                    if matches!(err, DeviceError::NotConnected) || err.drops_connection() {
                        let done = (index + 1) * chunk_size;
                        report.failed.extend(doomed.iter().skip(done).cloned());
                        break;
                    }
                }
            }
        }

        for content in &report.deleted {
            self.uploads.invalidate_content(content);
        }
        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "device cleanup finished"
        );
        if !report.failed.is_empty() {
            warn!(failed = ?report.failed, "some device content could not be deleted");
        }
        Ok(report)
    }

    /// Clean up every interval while the setting allows it.
    #[instrument(name = "cleanup", skip_all)]
    pub async fn run_periodic(self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            every = %humantime::format_duration(self.options.interval),
            keep = self.options.keep,
            "device cleanup task started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cancel received; stopping device cleanup");
                    break;
                }
                _ = ticker.tick() => {
                    match self.settings.auto_cleanup_enabled() {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!("auto cleanup disabled");
                            continue;
                        }
                        Err(err) => {
                            warn!(error = %format!("{err:#}"), "failed to read cleanup setting; skipping");
                            continue;
                        }
                    }
                    if !self.link.current_state().is_connected() {
                        debug!("device not connected; skipping cleanup");
                        continue;
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        result = self.run_once() => {
                            if let Err(err) = result {
                                warn!(error = %err, "device cleanup failed");
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn active_content(&self) -> Option<ContentId> {
        let art = match self.settings.active_art() {
            Ok(art) => art?,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to read active image");
                return None;
            }
        };
        self.uploads
            .cached(&art.image_id)
            .map(|record| record.content_id)
    }

    async fn delete(&self, chunk: &[ContentId]) -> Result<Vec<ContentId>, DeviceError> {
        let list: Vec<Value> = chunk
            .iter()
            .map(|id| json!({ "content_id": id }))
            .collect();
        let response = self
            .link
            .send_command(
                DeviceCommand::new(
                    commands::DELETE_IMAGE_LIST,
                    json!({ "content_id_list": list }),
                ),
                self.options.command_timeout,
            )
            .await?;
        Ok(content_ids(response.data.get("content_id_list")))
    }
}

fn parse_content_list(data: &Value) -> Vec<ContentItem> {
    let Some(entries) = data.get("content_list").and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let id = entry.get("content_id").and_then(Value::as_str)?;
            let added = entry
                .get("image_date")
                .and_then(Value::as_str)
                .and_then(|raw| NaiveDateTime::parse_from_str(raw, CONTENT_DATE_FORMAT).ok())
                .unwrap_or(NaiveDateTime::MIN);
            Some(ContentItem {
                id: ContentId::new(id),
                added,
            })
        })
        .collect()
}

/// Rows from another category are dropped; some firmware ignores the filter.
fn parse_device_files(data: &Value, category: &str) -> Vec<DeviceFile> {
    let Some(entries) = data.get("content_list").and_then(Value::as_array) else {
        return Vec::new();
    };
    let text = |entry: &Value, key: &str| entry.get(key).and_then(Value::as_str).map(str::to_string);
    entries
        .iter()
        .filter_map(|entry| {
            let id = entry.get("content_id").and_then(Value::as_str)?;
            let row_category = text(entry, "category_id").unwrap_or_else(|| category.to_string());
            if row_category != category {
                return None;
            }
            let file_type = text(entry, "file_type").unwrap_or_else(|| {
                match entry.get("content_type").and_then(Value::as_str) {
                    Some("preinstall") => "SAMSUNG_ART".to_string(),
                    _ => "JPEG".to_string(),
                }
            });
            Some(DeviceFile {
                content_id: ContentId::new(id),
                file_name: text(entry, "file_name").unwrap_or_else(|| id.to_string()),
                file_type,
                size: entry.get("file_size").and_then(Value::as_u64),
                date: text(entry, "image_date"),
                category: row_category,
                matte: text(entry, "matte_id").filter(|matte| matte != "none"),
            })
        })
        .collect()
}

fn content_ids(list: Option<&Value>) -> Vec<ContentId> {
    list.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(id) => Some(ContentId::new(id.as_str())),
                    other => other.get("content_id").and_then(Value::as_str).map(ContentId::new),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_list_is_parsed_with_undated_entries_oldest() {
        let data = json!({ "content_list": [
            { "content_id": "MY_F0001", "image_date": "2025:09:08 17:58:00" },
            { "content_id": "MY_F0002", "image_date": "garbage" },
            { "content_id": "MY_F0003" },
            { "image_date": "2025:09:08 17:58:00" }
        ]});
        let items = parse_content_list(&data);
        assert_eq!(items.len(), 3);
        assert_eq!(
            items[0].added.format(CONTENT_DATE_FORMAT).to_string(),
            "2025:09:08 17:58:00"
        );
        assert_eq!(items[1].added, NaiveDateTime::MIN);
        assert_eq!(items[2].added, NaiveDateTime::MIN);
    }

    #[test]
    fn device_files_fill_in_missing_columns() {
        let data = json!({ "content_list": [
            {
                "content_id": "MY_F0001",
                "category_id": "MY-C0002",
                "image_date": "2025:09:08 17:58:00",
                "file_size": 48213,
                "matte_id": "shadowbox_black",
                "content_type": "mobile"
            },
            { "content_id": "SAM-S0700", "category_id": "MY-C0002", "content_type": "preinstall", "matte_id": "none" },
            { "content_id": "MY_F0009", "category_id": "MY-C0004" },
            { "category_id": "MY-C0002" }
        ]});
        let files = parse_device_files(&data, "MY-C0002");
        assert_eq!(
            files,
            vec![
                DeviceFile {
                    content_id: ContentId::new("MY_F0001"),
                    file_name: "MY_F0001".into(),
                    file_type: "JPEG".into(),
                    size: Some(48213),
                    date: Some("2025:09:08 17:58:00".into()),
                    category: "MY-C0002".into(),
                    matte: Some("shadowbox_black".into()),
                },
                DeviceFile {
                    content_id: ContentId::new("SAM-S0700"),
                    file_name: "SAM-S0700".into(),
                    file_type: "SAMSUNG_ART".into(),
                    size: None,
                    date: None,
                    category: "MY-C0002".into(),
                    matte: None,
                },
            ]
        );
        assert!(parse_device_files(&json!({}), "MY-C0002").is_empty());
    }

    #[test]
    fn deleted_ids_accept_both_shapes() {
        let ids = content_ids(Some(&json!([{ "content_id": "a" }, "b", 3])));
        assert_eq!(ids, vec![ContentId::new("a"), ContentId::new("b")]);
        assert!(content_ids(None).is_empty());
    }
}
