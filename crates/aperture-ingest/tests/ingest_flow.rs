//! Ingestion pipeline integration tests.
//!
//! Run with: `cargo test -p aperture-ingest --test ingest_flow`

mod helpers;

use aperture_core::models::{Asset, AssetStatus, AssetType, Checksum, ThumbnailKind};
use aperture_core::AppError;
use aperture_db::AssetRepository;
use aperture_ingest::{
    AssetDownload, InitiateUpload, RecoveryReport, ORIGINAL_CACHE_CONTROL, THUMBNAIL_CACHE_CONTROL,
};
use aperture_processing::checksum_bytes;
use aperture_storage::{collect_stream, keys};
use helpers::fixtures::{jpeg_bytes, png_bytes};
use helpers::{reader, setup_local_app, setup_presigned_app, wait_for_status, TestApp, TestOptions};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

fn request(app: &TestApp, filename: &str, content_type: &str) -> InitiateUpload {
    InitiateUpload {
        owner_id: app.owner,
        filename: filename.to_string(),
        content_type: content_type.to_string(),
        size: None,
        checksum: None,
    }
}

async fn upload_proxied(app: &TestApp, filename: &str, data: Vec<u8>) -> Uuid {
    let ticket = app
        .coordinator
        .initiate_upload(request(app, filename, "image/jpeg"))
        .await
        .unwrap();
    assert!(!ticket.direct_upload);
    app.coordinator
        .complete_upload(ticket.asset_id, app.owner, reader(data))
        .await
        .unwrap();
    ticket.asset_id
}

#[tokio::test]
async fn proxied_upload_becomes_active_with_thumbnails() {
    let app = setup_local_app(TestOptions::default()).await;
    let data = jpeg_bytes(2000, 1000, 1);

    let ticket = app
        .coordinator
        .initiate_upload(InitiateUpload {
            size: Some(data.len() as u64),
            ..request(&app, "holiday photo.jpg", "image/jpeg")
        })
        .await
        .unwrap();
    assert!(!ticket.direct_upload);
    assert!(ticket.upload.is_none());
    assert!(ticket.storage_path.starts_with(&keys::owner_prefix(app.owner)));
    assert!(ticket.storage_path.ends_with(&format!("{}/holiday_photo.jpg", ticket.asset_id)));

    let processing = app
        .coordinator
        .complete_upload(ticket.asset_id, app.owner, reader(data.clone()))
        .await
        .unwrap();
    assert_eq!(processing.status, AssetStatus::Processing);

    let asset = wait_for_status(&app, ticket.asset_id, AssetStatus::Active).await;
    assert_eq!(asset.checksum, Some(checksum_bytes(&data)));
    assert_eq!(asset.size_bytes, Some(data.len() as i64));
    assert_eq!(asset.metadata.width, Some(2000));
    assert_eq!(asset.metadata.height, Some(1000));

    let thumbnails = app
        .coordinator
        .list_thumbnails(ticket.asset_id, app.owner)
        .await
        .unwrap();
    assert_eq!(thumbnails.len(), 3);
    let preview = thumbnails
        .iter()
        .find(|t| t.kind == ThumbnailKind::Preview)
        .unwrap();
    assert_eq!((preview.width, preview.height), (1440, 720));
    assert_eq!(
        preview.storage_path,
        keys::thumbnail_path(&asset.storage_path, "preview", "jpg")
    );
    for thumb in &thumbnails {
        assert!(app.storage.exists(&thumb.storage_path).await.unwrap());
    }
}

#[tokio::test]
async fn second_completion_is_a_conflict() {
    let app = setup_local_app(TestOptions {
        start_queue: false,
        ..Default::default()
    })
    .await;
    let asset_id = upload_proxied(&app, "a.jpg", jpeg_bytes(20, 20, 1)).await;

    let err = app
        .coordinator
        .complete_upload(asset_id, app.owner, reader(jpeg_bytes(20, 20, 1)))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let err = app
        .coordinator
        .mark_upload_complete(asset_id, app.owner)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn checksum_mismatch_keeps_asset_uploading() {
    let app = setup_local_app(TestOptions::default()).await;
    let data = jpeg_bytes(20, 20, 2);
    let wrong = checksum_bytes(b"something else").to_hex();

    let ticket = app
        .coordinator
        .initiate_upload(InitiateUpload {
            checksum: Some(wrong),
            ..request(&app, "a.jpg", "image/jpeg")
        })
        .await
        .unwrap();

    let err = app
        .coordinator
        .complete_upload(ticket.asset_id, app.owner, reader(data))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let asset = app.coordinator.get_asset(ticket.asset_id, app.owner).await.unwrap();
    assert_eq!(asset.status, AssetStatus::Uploading);
    assert!(!app.storage.exists(&ticket.storage_path).await.unwrap());
}

#[tokio::test]
async fn matching_declared_checksum_is_accepted() {
    let app = setup_local_app(TestOptions::default()).await;
    let data = jpeg_bytes(20, 20, 3);

    let ticket = app
        .coordinator
        .initiate_upload(InitiateUpload {
            checksum: Some(checksum_bytes(&data).to_hex()),
            ..request(&app, "a.jpg", "image/jpeg")
        })
        .await
        .unwrap();
    app.coordinator
        .complete_upload(ticket.asset_id, app.owner, reader(data))
        .await
        .unwrap();
    wait_for_status(&app, ticket.asset_id, AssetStatus::Active).await;
}

#[tokio::test]
async fn oversized_stream_is_rejected_before_storage() {
    let app = setup_local_app(TestOptions {
        max_file_size: 64,
        ..Default::default()
    })
    .await;

    let ticket = app
        .coordinator
        .initiate_upload(request(&app, "a.jpg", "image/jpeg"))
        .await
        .unwrap();
    let err = app
        .coordinator
        .complete_upload(ticket.asset_id, app.owner, reader(vec![0u8; 1024]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PayloadTooLarge(_)));
    assert!(!app.storage.exists(&ticket.storage_path).await.unwrap());

    let err = app
        .coordinator
        .initiate_upload(InitiateUpload {
            size: Some(1024),
            ..request(&app, "b.jpg", "image/jpeg")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PayloadTooLarge(_)));
}

#[tokio::test]
async fn initiation_validates_request() {
    let app = setup_local_app(TestOptions::default()).await;

    for (filename, content_type) in [
        ("notes.exe", "application/octet-stream"),
        ("photo.jpg", "text/html"),
        ("photo.png", "video/mp4"),
    ] {
        let err = app
            .coordinator
            .initiate_upload(request(&app, filename, content_type))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)), "{}", filename);
    }

    let err = app
        .coordinator
        .initiate_upload(InitiateUpload {
            checksum: Some("abc123".to_string()),
            ..request(&app, "photo.jpg", "image/jpeg")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn direct_upload_is_processed_after_mark_complete() {
    let (app, mock) = setup_presigned_app(TestOptions::default()).await;
    let data = png_bytes(300, 600);

    let ticket = app
        .coordinator
        .initiate_upload(request(&app, "scan.png", "image/png"))
        .await
        .unwrap();
    assert!(ticket.direct_upload);
    let upload = ticket.upload.clone().unwrap();
    assert_eq!(upload.method, "PUT");
    assert!(upload.url.contains(&ticket.storage_path));

    // Completing before the object exists is rejected and changes nothing
    let err = app
        .coordinator
        .mark_upload_complete(ticket.asset_id, app.owner)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    mock.put_object(&ticket.storage_path, data.clone(), "image/png");
    app.coordinator
        .mark_upload_complete(ticket.asset_id, app.owner)
        .await
        .unwrap();

    let asset = wait_for_status(&app, ticket.asset_id, AssetStatus::Active).await;
    assert_eq!(asset.checksum, Some(checksum_bytes(&data)));
    assert_eq!(asset.size_bytes, Some(data.len() as i64));

    let small = app
        .repo
        .get_thumbnail(ticket.asset_id, ThumbnailKind::Small)
        .await
        .unwrap()
        .unwrap();
    assert_eq!((small.width, small.height), (125, 250));
    assert!(mock.object(&small.storage_path).is_some());
}

#[tokio::test]
async fn direct_upload_checksum_mismatch_fails_asset() {
    let (app, mock) = setup_presigned_app(TestOptions::default()).await;
    let data = jpeg_bytes(40, 40, 4);

    let ticket = app
        .coordinator
        .initiate_upload(InitiateUpload {
            checksum: Some(checksum_bytes(b"declared by the client").to_hex()),
            ..request(&app, "a.jpg", "image/jpeg")
        })
        .await
        .unwrap();
    mock.put_object(&ticket.storage_path, data, "image/jpeg");
    app.coordinator
        .mark_upload_complete(ticket.asset_id, app.owner)
        .await
        .unwrap();

    wait_for_status(&app, ticket.asset_id, AssetStatus::Failed).await;
}

#[tokio::test]
async fn missing_original_fails_asset() {
    let (app, mock) = setup_presigned_app(TestOptions {
        start_queue: false,
        ..Default::default()
    })
    .await;

    let ticket = app
        .coordinator
        .initiate_upload(request(&app, "a.jpg", "image/jpeg"))
        .await
        .unwrap();
    mock.put_object(&ticket.storage_path, jpeg_bytes(10, 10, 5), "image/jpeg");
    app.coordinator
        .mark_upload_complete(ticket.asset_id, app.owner)
        .await
        .unwrap();
    mock.remove_object(&ticket.storage_path);

    let err = app
        .processor
        .process(ticket.asset_id, false)
        .await
        .unwrap_err();
    assert!(aperture_core::TaskError::is_unrecoverable(&err));

    let asset = app.coordinator.get_asset(ticket.asset_id, app.owner).await.unwrap();
    assert_eq!(asset.status, AssetStatus::Failed);

    // Redelivery of the same task is a no-op
    let summary = app.processor.process(ticket.asset_id, false).await.unwrap();
    assert!(summary.skipped);
}

#[tokio::test]
async fn undecodable_image_still_becomes_active() {
    let app = setup_local_app(TestOptions::default()).await;
    let asset_id = upload_proxied(&app, "broken.jpg", b"not really a jpeg".to_vec()).await;

    let asset = wait_for_status(&app, asset_id, AssetStatus::Active).await;
    assert!(asset.checksum.is_some());
    assert!(app
        .coordinator
        .list_thumbnails(asset_id, app.owner)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn duplicates_group_by_checksum_within_owner() {
    let app = setup_local_app(TestOptions::default()).await;
    let shared = jpeg_bytes(2000, 1000, 7);

    let first = upload_proxied(&app, "one.jpg", shared.clone()).await;
    let unique = upload_proxied(&app, "two.jpg", jpeg_bytes(64, 64, 8)).await;
    wait_for_status(&app, first, AssetStatus::Active).await;
    wait_for_status(&app, unique, AssetStatus::Active).await;
    assert!(app.duplicates.duplicate_groups(app.owner).await.unwrap().is_empty());

    let third = upload_proxied(&app, "three.jpg", shared.clone()).await;
    wait_for_status(&app, third, AssetStatus::Active).await;

    let groups = app.duplicates.duplicate_groups(app.owner).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].id, checksum_bytes(&shared).to_hex());
    assert_eq!(groups[0].assets.len(), 2);

    let by_checksum = app
        .duplicates
        .find_by_checksum(app.owner, &groups[0].id)
        .await
        .unwrap();
    assert_eq!(by_checksum.len(), 2);
    assert!(app
        .duplicates
        .duplicate_groups(Uuid::new_v4())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn soft_delete_and_restore() {
    let app = setup_local_app(TestOptions::default()).await;
    let asset_id = upload_proxied(&app, "a.jpg", jpeg_bytes(20, 20, 9)).await;
    wait_for_status(&app, asset_id, AssetStatus::Active).await;

    let trashed = app.coordinator.delete(asset_id, app.owner).await.unwrap();
    assert_eq!(trashed.status, AssetStatus::Trashed);
    assert!(trashed.deleted_at.is_some());
    assert_eq!(app.queue.pending_count(aperture_ingest::MAINTENANCE_QUEUE).await, 1);

    let err = app.coordinator.delete(asset_id, app.owner).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let restored = app.coordinator.restore(asset_id, app.owner).await.unwrap();
    assert_eq!(restored.status, AssetStatus::Active);
    assert!(restored.deleted_at.is_none());
    assert!(app.storage.exists(&restored.storage_path).await.unwrap());
}

#[tokio::test]
async fn trashed_asset_is_purged_after_retention() {
    let app = setup_local_app(TestOptions {
        trash_retention: chrono::Duration::zero(),
        ..Default::default()
    })
    .await;
    let asset_id = upload_proxied(&app, "a.jpg", jpeg_bytes(300, 200, 10)).await;
    let asset = wait_for_status(&app, asset_id, AssetStatus::Active).await;

    app.coordinator.delete(asset_id, app.owner).await.unwrap();

    for _ in 0..1000 {
        if app.repo.get(asset_id).await.unwrap().is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(app.repo.get(asset_id).await.unwrap().is_none());
    assert!(!app.storage.exists(&asset.storage_path).await.unwrap());
    assert!(app
        .storage
        .list(&keys::owner_prefix(app.owner), true)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn hard_delete_tolerates_cleanup_failures() {
    let (app, mock) = setup_presigned_app(TestOptions::default()).await;
    let ticket = app
        .coordinator
        .initiate_upload(request(&app, "a.jpg", "image/jpeg"))
        .await
        .unwrap();
    mock.put_object(&ticket.storage_path, jpeg_bytes(400, 300, 11), "image/jpeg");
    app.coordinator
        .mark_upload_complete(ticket.asset_id, app.owner)
        .await
        .unwrap();
    wait_for_status(&app, ticket.asset_id, AssetStatus::Active).await;

    mock.fail_deletes(true);
    let report = app
        .coordinator
        .hard_delete(ticket.asset_id, app.owner)
        .await
        .unwrap();
    assert_eq!(report.removed, 0);
    assert_eq!(report.failed.len(), 4);
    assert!(app.repo.get(ticket.asset_id).await.unwrap().is_none());

    // The sweep recovers what the delete left behind
    mock.fail_deletes(false);
    app.coordinator.schedule_orphan_sweep(app.owner).await.unwrap();
    for _ in 0..1000 {
        if mock.paths().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(mock.paths().is_empty());
}

#[tokio::test]
async fn hard_delete_rules() {
    let app = setup_local_app(TestOptions {
        start_queue: false,
        ..Default::default()
    })
    .await;

    // Abandoned upload
    let ticket = app
        .coordinator
        .initiate_upload(request(&app, "a.jpg", "image/jpeg"))
        .await
        .unwrap();
    let report = app
        .coordinator
        .hard_delete(ticket.asset_id, app.owner)
        .await
        .unwrap();
    assert!(report.is_clean());
    assert!(app.repo.get(ticket.asset_id).await.unwrap().is_none());

    // Nothing consumes the queue, so this one stays in processing
    let processing = upload_proxied(&app, "b.jpg", jpeg_bytes(20, 20, 12)).await;
    let err = app
        .coordinator
        .hard_delete(processing, app.owner)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn other_owners_see_nothing() {
    let app = setup_local_app(TestOptions::default()).await;
    let asset_id = upload_proxied(&app, "a.jpg", jpeg_bytes(20, 20, 13)).await;
    wait_for_status(&app, asset_id, AssetStatus::Active).await;

    let stranger = Uuid::new_v4();
    assert!(matches!(
        app.coordinator.get_asset(asset_id, stranger).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        app.coordinator.delete(asset_id, stranger).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        app.coordinator.hard_delete(asset_id, stranger).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        app.coordinator.download_asset(asset_id, stranger, None).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn local_download_streams_with_private_cache() {
    let app = setup_local_app(TestOptions::default()).await;
    let data = jpeg_bytes(500, 250, 14);
    let asset_id = upload_proxied(&app, "a.jpg", data.clone()).await;
    wait_for_status(&app, asset_id, AssetStatus::Active).await;

    let download = app
        .coordinator
        .download_asset(asset_id, app.owner, None)
        .await
        .unwrap();
    assert_eq!(download.cache_control(), ORIGINAL_CACHE_CONTROL);
    assert_eq!(download.content_type(), "image/jpeg");
    match download {
        AssetDownload::Stream { stream, size, .. } => {
            assert_eq!(size, Some(data.len() as u64));
            assert_eq!(collect_stream(stream).await.unwrap().as_ref(), data.as_slice());
        }
        AssetDownload::Redirect { .. } => panic!("local storage cannot redirect"),
    }

    let thumb = app
        .coordinator
        .download_asset(asset_id, app.owner, Some(ThumbnailKind::Thumb))
        .await
        .unwrap();
    assert_eq!(thumb.cache_control(), THUMBNAIL_CACHE_CONTROL);
}

#[tokio::test]
async fn presigned_download_of_missing_thumbnail_is_not_found() {
    let (app, mock) = setup_presigned_app(TestOptions::default()).await;
    let ticket = app
        .coordinator
        .initiate_upload(request(&app, "a.jpg", "image/jpeg"))
        .await
        .unwrap();
    mock.put_object(&ticket.storage_path, b"undecodable".to_vec(), "image/jpeg");
    app.coordinator
        .mark_upload_complete(ticket.asset_id, app.owner)
        .await
        .unwrap();
    wait_for_status(&app, ticket.asset_id, AssetStatus::Active).await;

    let err = app
        .coordinator
        .download_asset(ticket.asset_id, app.owner, Some(ThumbnailKind::Preview))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AppError::NotFound(_)));

    match app
        .coordinator
        .download_asset(ticket.asset_id, app.owner, None)
        .await
        .unwrap()
    {
        AssetDownload::Redirect {
            url, cache_control, ..
        } => {
            assert!(url.contains(&ticket.storage_path));
            assert_eq!(cache_control, ORIGINAL_CACHE_CONTROL);
        }
        AssetDownload::Stream { .. } => panic!("presign-capable storage should redirect"),
    }
}

#[tokio::test]
async fn checksum_lookup_rejects_bad_hex() {
    let app = setup_local_app(TestOptions::default()).await;
    let err = app
        .duplicates
        .find_by_checksum(app.owner, "zz")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let valid = Checksum::from_bytes([0u8; 32]).to_hex();
    assert!(app
        .duplicates
        .find_by_checksum(app.owner, &valid)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn timed_out_final_attempt_fails_asset() {
    let (app, mock) = setup_presigned_app(TestOptions {
        task_timeout_seconds: 1,
        max_retries: 0,
        ..Default::default()
    })
    .await;
    mock.hang_downloads(true);

    let ticket = app
        .coordinator
        .initiate_upload(request(&app, "a.jpg", "image/jpeg"))
        .await
        .unwrap();
    mock.put_object(&ticket.storage_path, jpeg_bytes(30, 30, 20), "image/jpeg");
    app.coordinator
        .mark_upload_complete(ticket.asset_id, app.owner)
        .await
        .unwrap();

    wait_for_status(&app, ticket.asset_id, AssetStatus::Failed).await;

    // A failed asset can always be removed.
    app.coordinator
        .hard_delete(ticket.asset_id, app.owner)
        .await
        .unwrap();
    assert!(app.repo.get(ticket.asset_id).await.unwrap().is_none());
    assert!(mock.object(&ticket.storage_path).is_none());
}

#[tokio::test]
async fn restart_recovers_lost_queue_work() {
    let (app, mock) = setup_presigned_app(TestOptions {
        start_queue: false,
        trash_retention: chrono::Duration::zero(),
        ..Default::default()
    })
    .await;

    // Handed to processing, but the queue never ran it.
    let processing = app
        .coordinator
        .initiate_upload(request(&app, "a.jpg", "image/jpeg"))
        .await
        .unwrap();
    mock.put_object(&processing.storage_path, jpeg_bytes(60, 40, 21), "image/jpeg");
    app.coordinator
        .mark_upload_complete(processing.asset_id, app.owner)
        .await
        .unwrap();

    // Trashed, with its purge scheduled on the old queue.
    let trashed = app
        .coordinator
        .initiate_upload(request(&app, "b.jpg", "image/jpeg"))
        .await
        .unwrap();
    mock.put_object(&trashed.storage_path, jpeg_bytes(60, 40, 22), "image/jpeg");
    app.coordinator
        .mark_upload_complete(trashed.asset_id, app.owner)
        .await
        .unwrap();
    app.processor.process(trashed.asset_id, false).await.unwrap();
    app.coordinator.delete(trashed.asset_id, app.owner).await.unwrap();

    // Direct upload the client never finished.
    let abandoned = app
        .coordinator
        .initiate_upload(request(&app, "c.jpg", "image/jpeg"))
        .await
        .unwrap();
    mock.put_object(&abandoned.storage_path, b"partial".to_vec(), "image/jpeg");

    let restarted = app
        .restart(TestOptions {
            trash_retention: chrono::Duration::zero(),
            stale_upload_after: chrono::Duration::zero(),
            ..Default::default()
        })
        .await;
    let report = restarted.coordinator.recover().await.unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            processing_requeued: 1,
            purges_scheduled: 1,
            uploads_reaped: 1,
            errors: 0,
        }
    );

    wait_for_status(&restarted, processing.asset_id, AssetStatus::Active).await;

    for _ in 0..1000 {
        if restarted.repo.get(trashed.asset_id).await.unwrap().is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(restarted.repo.get(trashed.asset_id).await.unwrap().is_none());
    assert!(mock.object(&trashed.storage_path).is_none());

    assert!(restarted.repo.get(abandoned.asset_id).await.unwrap().is_none());
    assert!(mock.object(&abandoned.storage_path).is_none());
}

#[tokio::test]
async fn recent_uploads_survive_recovery() {
    let (app, _mock) = setup_presigned_app(TestOptions {
        start_queue: false,
        ..Default::default()
    })
    .await;
    let ticket = app
        .coordinator
        .initiate_upload(request(&app, "a.jpg", "image/jpeg"))
        .await
        .unwrap();

    let report = app.coordinator.recover().await.unwrap();
    assert_eq!(report, RecoveryReport::default());
    let asset = app.repo.get(ticket.asset_id).await.unwrap().unwrap();
    assert_eq!(asset.status, AssetStatus::Uploading);
}

#[tokio::test]
async fn hard_delete_is_rejected_while_upload_streams() {
    let app = setup_local_app(TestOptions {
        start_queue: false,
        ..Default::default()
    })
    .await;
    let ticket = app
        .coordinator
        .initiate_upload(request(&app, "a.jpg", "image/jpeg"))
        .await
        .unwrap();
    let data = jpeg_bytes(40, 40, 23);

    let (mut writer, body) = tokio::io::duplex(64);
    let completing = app
        .coordinator
        .complete_upload(ticket.asset_id, app.owner, Box::pin(body));
    let deleting = async {
        writer.write_all(&data[..10]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = app.coordinator.hard_delete(ticket.asset_id, app.owner).await;
        writer.write_all(&data[10..]).await.unwrap();
        drop(writer);
        result
    };

    let (completed, deleted) = tokio::join!(completing, deleting);
    assert!(matches!(deleted, Err(AppError::Conflict(_))));
    assert_eq!(completed.unwrap().status, AssetStatus::Processing);
    assert!(app.storage.exists(&ticket.storage_path).await.unwrap());
}

#[tokio::test]
async fn generic_recorded_content_type_falls_back_to_extension() {
    let (app, mock) = setup_presigned_app(TestOptions {
        start_queue: false,
        ..Default::default()
    })
    .await;
    let asset_id = Uuid::new_v4();
    let path = keys::asset_path(app.owner, asset_id, "scan.png", chrono::Utc::now());
    let asset = Asset::new_uploading(
        asset_id,
        app.owner,
        AssetType::Image,
        path.clone(),
        "scan.png".to_string(),
        "application/octet-stream".to_string(),
        None,
        None,
    );
    app.repo.create(&asset).await.unwrap();
    mock.put_object(&path, png_bytes(10, 10), "image/png");
    for (from, to) in [
        (AssetStatus::Uploading, AssetStatus::Processing),
        (AssetStatus::Processing, AssetStatus::Active),
    ] {
        app.repo.transition(asset_id, from, to).await.unwrap();
    }

    let download = app
        .coordinator
        .download_asset(asset_id, app.owner, None)
        .await
        .unwrap();
    assert_eq!(download.content_type(), "image/png");
}
