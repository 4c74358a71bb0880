mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{LinkHarness, MemoryImages, write_library};
use frame_gallery::device::commands;
use frame_gallery::device::scripted::{Behaviour, ScriptedDevice};
use frame_gallery::error::{DeviceError, UploadError};
use frame_gallery::upload::{JsonUploadCache, UploadCache, UploadCoordinator, UploadOptions};
use gallery_model::{ContentId, ImageId};
use tempfile::tempdir;

fn coordinator(
    harness: &LinkHarness,
    images: Arc<MemoryImages>,
    cache: Arc<dyn UploadCache>,
) -> UploadCoordinator {
    UploadCoordinator::new(
        harness.link.clone(),
        images,
        cache,
        UploadOptions {
            timeout: Duration::from_secs(2),
            ..UploadOptions::default()
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_upload() {
    let dir = tempdir().unwrap();
    let images = Arc::new(MemoryImages::new(write_library(dir.path(), &["a.jpg"])));
    let device = ScriptedDevice::new();
    let harness = LinkHarness::connected(device.clone()).await;
    device.set_latency(Duration::from_millis(150));
    let uploads = coordinator(&harness, images, Arc::new(JsonUploadCache::in_memory()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let uploads = uploads.clone();
        handles.push(tokio::spawn(async move {
            uploads.ensure_uploaded(&ImageId::new("a.jpg")).await
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.expect("join").expect("uploaded"));
    }

    assert_eq!(device.call_count(commands::SEND_IMAGE), 1);
    assert!(ids.iter().all(|id| id == &ids[0]));
    assert_eq!(
        uploads.cached(&ImageId::new("a.jpg")).map(|r| r.content_id),
        Some(ids[0].clone())
    );

    // Later callers are served from the cache.
    let again = uploads.ensure_uploaded(&ImageId::new("a.jpg")).await.unwrap();
    assert_eq!(again, ids[0]);
    assert_eq!(device.call_count(commands::SEND_IMAGE), 1);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failures_are_not_cached() {
    let dir = tempdir().unwrap();
    let images = Arc::new(MemoryImages::new(write_library(dir.path(), &["a.jpg"])));
    let device = ScriptedDevice::new();
    let harness = LinkHarness::connected(device.clone()).await;
    device.push_behaviour(commands::SEND_IMAGE, Behaviour::Fail(DeviceError::Capacity));
    let uploads = coordinator(&harness, images, Arc::new(JsonUploadCache::in_memory()));

    let err = uploads
        .ensure_uploaded(&ImageId::new("a.jpg"))
        .await
        .expect_err("device full");
    assert_eq!(err, UploadError::Device(DeviceError::Capacity));
    assert!(uploads.cached(&ImageId::new("a.jpg")).is_none());

    uploads
        .ensure_uploaded(&ImageId::new("a.jpg"))
        .await
        .expect("retry succeeds");
    assert_eq!(device.call_count(commands::SEND_IMAGE), 2);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_images_upload_independently() {
    let dir = tempdir().unwrap();
    let images = Arc::new(MemoryImages::new(write_library(
        dir.path(),
        &["a.jpg", "b.png", "c.jpeg"],
    )));
    let device = ScriptedDevice::new();
    let harness = LinkHarness::connected(device.clone()).await;
    let uploads = coordinator(&harness, images, Arc::new(JsonUploadCache::in_memory()));

    let (id_a, id_b, id_c) = (
        ImageId::new("a.jpg"),
        ImageId::new("b.png"),
        ImageId::new("c.jpeg"),
    );
    let (a, b, c) = tokio::join!(
        uploads.ensure_uploaded(&id_a),
        uploads.ensure_uploaded(&id_b),
        uploads.ensure_uploaded(&id_c),
    );
    let mut ids = vec![a.unwrap(), b.unwrap(), c.unwrap()];
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert_eq!(device.call_count(commands::SEND_IMAGE), 3);

    let file_types: Vec<String> = device
        .calls()
        .iter()
        .filter(|call| call.name == commands::SEND_IMAGE)
        .filter_map(|call| call.args["file_type"].as_str().map(str::to_string))
        .collect();
    assert!(file_types.iter().any(|t| t == "png"));
    assert!(file_types.iter().all(|t| t == "png" || t == "jpg"));

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persisted_records_survive_a_restart() {
    let dir = tempdir().unwrap();
    let cache_path = dir.path().join("state").join("uploads.json");
    let images = Arc::new(MemoryImages::new(write_library(
        &dir.path().join("library"),
        &["a.jpg"],
    )));
    let device = ScriptedDevice::new();
    let harness = LinkHarness::connected(device.clone()).await;

    let first = {
        let uploads = coordinator(
            &harness,
            images.clone(),
            Arc::new(JsonUploadCache::open(&cache_path).unwrap()),
        );
        uploads.ensure_uploaded(&ImageId::new("a.jpg")).await.unwrap()
    };

    let uploads = coordinator(
        &harness,
        images,
        Arc::new(JsonUploadCache::open(&cache_path).unwrap()),
    );
    let second = uploads.ensure_uploaded(&ImageId::new("a.jpg")).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(device.call_count(commands::SEND_IMAGE), 1);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalidated_content_is_uploaded_again() {
    let dir = tempdir().unwrap();
    let images = Arc::new(MemoryImages::new(write_library(dir.path(), &["a.jpg", "b.jpg"])));
    let device = ScriptedDevice::new();
    let harness = LinkHarness::connected(device.clone()).await;
    let uploads = coordinator(&harness, images, Arc::new(JsonUploadCache::in_memory()));

    let a = uploads.ensure_uploaded(&ImageId::new("a.jpg")).await.unwrap();
    uploads.ensure_uploaded(&ImageId::new("b.jpg")).await.unwrap();

    assert_eq!(uploads.invalidate_content(&a), 1);
    assert_eq!(uploads.invalidate_content(&ContentId::new("MY_F9999")), 0);
    assert!(uploads.cached(&ImageId::new("a.jpg")).is_none());
    assert!(uploads.cached(&ImageId::new("b.jpg")).is_some());

    let fresh = uploads.ensure_uploaded(&ImageId::new("a.jpg")).await.unwrap();
    assert_ne!(fresh, a);
    assert_eq!(device.call_count(commands::SEND_IMAGE), 3);

    assert!(uploads.invalidate(&ImageId::new("b.jpg")));
    assert!(!uploads.invalidate(&ImageId::new("b.jpg")));

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_images_never_reach_the_device() {
    let dir = tempdir().unwrap();
    let images = Arc::new(MemoryImages::new(write_library(dir.path(), &["a.jpg"])));
    let device = ScriptedDevice::new();
    let harness = LinkHarness::connected(device.clone()).await;
    let uploads = coordinator(&harness, images, Arc::new(JsonUploadCache::in_memory()));

    let err = uploads
        .ensure_uploaded(&ImageId::new("missing.jpg"))
        .await
        .expect_err("not in the library");
    assert_eq!(err, UploadError::UnknownImage(ImageId::new("missing.jpg")));
    assert!(device.calls().is_empty());

    harness.shutdown().await;
}
