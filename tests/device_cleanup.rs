mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use common::{LinkHarness, MemoryImages, MemorySettings, eventually, fast_link_options, write_library};
use frame_gallery::cleanup::{CleanupOptions, DeviceCleaner};
use frame_gallery::device::commands;
use frame_gallery::device::scripted::{Behaviour, ScriptedDevice};
use frame_gallery::error::DeviceError;
use frame_gallery::upload::{JsonUploadCache, UploadCoordinator, UploadOptions};
use gallery_model::ImageId;
use tempfile::tempdir;

const CATEGORY: &str = "MY-C0002";

struct Fixture {
    harness: LinkHarness,
    uploads: UploadCoordinator,
    settings: Arc<MemorySettings>,
    _dir: tempfile::TempDir,
}

async fn fixture(device: &ScriptedDevice) -> Fixture {
    fixture_with(LinkHarness::connected(device.clone()).await)
}

fn fixture_with(harness: LinkHarness) -> Fixture {
    let dir = tempdir().unwrap();
    let images = Arc::new(MemoryImages::new(write_library(dir.path(), &["a.jpg", "b.jpg"])));
    let uploads = UploadCoordinator::new(
        harness.link.clone(),
        images,
        Arc::new(JsonUploadCache::in_memory()),
        UploadOptions::default(),
    );
    Fixture {
        harness,
        uploads,
        settings: Arc::new(MemorySettings::default()),
        _dir: dir,
    }
}

fn cleaner(fixture: &Fixture, options: CleanupOptions) -> DeviceCleaner {
    DeviceCleaner::new(
        fixture.harness.link.clone(),
        fixture.uploads.clone(),
        fixture.settings.clone(),
        options,
    )
}

fn quick() -> CleanupOptions {
    CleanupOptions {
        chunk_size: 1,
        chunk_pause: Duration::ZERO,
        command_timeout: Duration::from_secs(1),
        ..CleanupOptions::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keeps_the_newest_items_and_the_active_image() {
    let device = ScriptedDevice::new();
    let fx = fixture(&device).await;
    let b = fx.uploads.ensure_uploaded(&ImageId::new("b.jpg")).await.unwrap();
    let a = fx.uploads.ensure_uploaded(&ImageId::new("a.jpg")).await.unwrap();
    fx.settings.set_active("a.jpg");
    let newer: Vec<_> = (1..=4)
        .map(|hours| device.preload_content(CATEGORY, Utc::now() + TimeDelta::hours(hours)))
        .collect();
    // Other categories are never touched.
    let foreign = device.preload_content("MY-C0004", Utc::now() - TimeDelta::days(30));

    let report = cleaner(&fx, quick()).run_once().await.expect("cleanup");
    assert_eq!(report.listed, 6);
    assert_eq!(report.kept, 4);
    let mut deleted = report.deleted.clone();
    deleted.sort();
    let mut expected = vec![b.clone(), newer[0].clone()];
    expected.sort();
    assert_eq!(deleted, expected);
    assert!(report.failed.is_empty());

    let remaining = device.content_ids();
    assert!(remaining.contains(&a));
    assert!(remaining.contains(&foreign));
    for kept in &newer[1..] {
        assert!(remaining.contains(kept));
    }
    assert_eq!(device.call_count(commands::DELETE_IMAGE_LIST), 2);

    assert!(fx.uploads.cached(&ImageId::new("b.jpg")).is_none());
    assert_eq!(
        fx.uploads.cached(&ImageId::new("a.jpg")).map(|r| r.content_id),
        Some(a)
    );

    fx.harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_connection_marks_the_rest_failed() {
    let device = ScriptedDevice::new();
    let fx = fixture(&device).await;
    for days in 1..=5 {
        device.preload_content(CATEGORY, Utc::now() - TimeDelta::days(days));
    }
    device.push_behaviour(commands::DELETE_IMAGE_LIST, Behaviour::Drop);

    let report = cleaner(
        &fx,
        CleanupOptions {
            keep: 1,
            ..quick()
        },
    )
    .run_once()
    .await
    .expect("listing succeeded");
    assert_eq!(report.listed, 5);
    assert!(report.deleted.is_empty());
    assert_eq!(report.failed.len(), 4);
    assert_eq!(device.call_count(commands::DELETE_IMAGE_LIST), 1);
    assert_eq!(device.content_ids().len(), 5);

    fx.harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_listing_deletes_nothing() {
    let device = ScriptedDevice::new();
    let fx = fixture(&device).await;
    device.preload_content(CATEGORY, Utc::now() - TimeDelta::days(9));
    device.push_behaviour(
        commands::GET_CONTENT_LIST,
        Behaviour::Fail(DeviceError::Rejected {
            command: commands::GET_CONTENT_LIST.into(),
            reason: "busy".into(),
        }),
    );

    let err = cleaner(&fx, CleanupOptions { keep: 0, ..quick() })
        .run_once()
        .await
        .expect_err("listing rejected");
    assert!(matches!(err, DeviceError::Rejected { .. }), "{err:?}");
    assert_eq!(device.call_count(commands::DELETE_IMAGE_LIST), 0);
    assert_eq!(device.content_ids().len(), 1);

    fx.harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn periodic_cleanup_follows_the_setting() {
    let device = ScriptedDevice::new();
    let fx = fixture(&device).await;
    for days in 1..=5 {
        device.preload_content(CATEGORY, Utc::now() - TimeDelta::days(days));
    }
    let task = tokio::spawn(
        cleaner(
            &fx,
            CleanupOptions {
                interval: Duration::from_millis(50),
                keep: 2,
                ..quick()
            },
        )
        .run_periodic(fx.harness.cancel.clone()),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(device.call_count(commands::GET_CONTENT_LIST), 0);

    fx.settings.set_auto_cleanup(true);
    eventually(|| device.content_ids().len() == 2).await;

    fx.harness.cancel.cancel();
    task.await.expect("join").expect("cleanup task");
    fx.harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_listing_reports_the_requested_category() {
    let device = ScriptedDevice::new();
    let fx = fixture(&device).await;
    let uploaded = fx.uploads.ensure_uploaded(&ImageId::new("a.jpg")).await.unwrap();
    let other = device.preload_content("MY-C0004", Utc::now() - TimeDelta::days(2));
    let cleaner = cleaner(&fx, quick());

    let files = cleaner.list_files(None).await.expect("listed");
    assert_eq!(files.len(), 1);
    let file = &files[0];
    assert_eq!(file.content_id, uploaded);
    assert_eq!(file.file_name, uploaded.as_str());
    assert_eq!(file.category, CATEGORY);
    assert!(file.date.is_some());

    let files = cleaner.list_files(Some("MY-C0004")).await.expect("listed");
    assert_eq!(files.iter().map(|f| f.content_id.clone()).collect::<Vec<_>>(), vec![other]);
    let listed: Vec<_> = device
        .calls()
        .iter()
        .filter(|call| call.name == commands::GET_CONTENT_LIST)
        .map(|call| call.args["category"].clone())
        .collect();
    assert_eq!(listed, vec![CATEGORY, "MY-C0004"]);
    // Listing never deletes.
    assert_eq!(device.call_count(commands::DELETE_IMAGE_LIST), 0);

    fx.harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_listing_needs_a_connection() {
    let device = ScriptedDevice::new();
    let fx = fixture_with(LinkHarness::start(device.clone(), fast_link_options()));

    let err = cleaner(&fx, quick())
        .list_files(None)
        .await
        .expect_err("not connected");
    assert!(matches!(err, DeviceError::NotConnected), "{err:?}");
    assert_eq!(err.class(), frame_gallery::error::ErrorClass::Connectivity);
    assert!(device.calls().is_empty());

    fx.harness.shutdown().await;
}
