mod common;

use common::{reader, Harness};
use filevault_core::{AppError, FileStatus};
use filevault_db::FileRepository;
use filevault_storage::{CompletedPart, Storage};
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::time::Duration;
use uuid::Uuid;

const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR";

#[tokio::test]
async fn direct_upload_stores_exact_bytes() {
    let h = Harness::new().await;

    let file = h
        .service
        .upload("a.txt", "text/plain", 13, reader(b"Hello, World!"))
        .await
        .unwrap();

    assert_eq!(file.status, FileStatus::Completed);
    assert_eq!(file.content_type, "text/plain; charset=utf-8");
    assert!(file.storage_key.ends_with(".txt"));
    assert_eq!(h.read_object(&file.storage_key).await, b"Hello, World!");

    let stored = h.service.get_file(file.id).await.unwrap();
    assert_eq!(stored.status, FileStatus::Completed);
    assert_eq!(stored.size, 13);
}

#[tokio::test]
async fn direct_upload_sniffs_past_declared_type() {
    let h = Harness::new().await;

    let file = h
        .service
        .upload("photo", "text/plain", PNG.len() as i64, reader(PNG))
        .await
        .unwrap();

    assert_eq!(file.content_type, "image/png");
    assert!(file.storage_key.ends_with(".png"));
    assert_eq!(h.read_object(&file.storage_key).await, PNG);
}

#[tokio::test]
async fn direct_upload_larger_than_sniff_window() {
    let h = Harness::new().await;
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

    let file = h
        .service
        .upload("blob.bin", "", data.len() as i64, reader(&data))
        .await
        .unwrap();

    assert_eq!(h.read_object(&file.storage_key).await, data);
}

#[tokio::test]
async fn direct_upload_rejects_bad_input() {
    let h = Harness::new().await;

    let err = h
        .service
        .upload("", "text/plain", 1, reader(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let err = h
        .service
        .upload("a.txt", "text/plain", -5, reader(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
    assert_eq!(h.repo.inner.raw_count().await, 0);
}

#[tokio::test]
async fn failed_transfer_purges_staged_record() {
    let h = Harness::new().await;
    h.storage.fail_upload.store(true, Ordering::SeqCst);

    let err = h
        .service
        .upload("a.txt", "text/plain", 13, reader(b"Hello, World!"))
        .await
        .unwrap_err();

    assert!(err.is_upstream());
    assert_eq!(h.repo.inner.raw_count().await, 0);
    assert_eq!(h.object_count(), 0);
}

#[tokio::test]
async fn failed_completion_removes_object_and_record() {
    let h = Harness::new().await;
    h.repo.fail_commit.store(true, Ordering::SeqCst);

    let err = h
        .service
        .upload("a.txt", "text/plain", 13, reader(b"Hello, World!"))
        .await
        .unwrap_err();

    assert!(err.is_upstream());
    assert_eq!(h.repo.inner.raw_count().await, 0);
    assert_eq!(h.object_count(), 0);
}

#[tokio::test]
async fn presigned_single_flow() {
    let h = Harness::new().await;

    let init = h
        .service
        .init_presigned_upload("report.pdf", "application/pdf", 2048)
        .await
        .unwrap();
    assert!(!init.upload_url.is_empty());
    assert_eq!(init.expires_in, 3600);
    assert_eq!(init.content_type, "application/pdf");
    assert!(init.storage_key.ends_with(".pdf"));

    let pending = h.service.get_file(init.file_id).await.unwrap();
    assert_eq!(pending.status, FileStatus::Pending);

    let confirmed = h.service.confirm_upload(init.file_id).await.unwrap();
    assert_eq!(confirmed.status, FileStatus::Completed);
    assert_eq!(
        h.service.get_file(init.file_id).await.unwrap().status,
        FileStatus::Completed
    );

    // Confirming twice is a no-op.
    let again = h.service.confirm_upload(init.file_id).await.unwrap();
    assert_eq!(again.status, FileStatus::Completed);

    let err = h.service.confirm_upload(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn presigned_upload_trusts_name_over_declaration() {
    let h = Harness::new().await;

    let mismatched = h
        .service
        .init_presigned_upload("photo.png", "text/plain", 10)
        .await
        .unwrap();
    assert_eq!(mismatched.content_type, "image/png");

    let absent = h
        .service
        .init_presigned_upload("photo.png", "", 10)
        .await
        .unwrap();
    assert_eq!(absent.content_type, "image/png");

    let generic = h
        .service
        .init_presigned_upload("clip.mp4", "application/octet-stream", 10)
        .await
        .unwrap();
    assert_eq!(generic.content_type, "video/mp4");
}

#[tokio::test]
async fn presign_failure_discards_record() {
    let h = Harness::new().await;
    h.storage.fail_presign.store(true, Ordering::SeqCst);

    let err = h
        .service
        .init_presigned_upload("a.txt", "text/plain", 1)
        .await
        .unwrap_err();
    assert!(err.is_upstream());
    assert_eq!(h.repo.inner.raw_count().await, 0);
}

#[tokio::test]
async fn verified_confirm_requires_object() {
    let h = Harness::verifying().await;

    let init = h
        .service
        .init_presigned_upload("a.txt", "text/plain", 5)
        .await
        .unwrap();

    let err = h.service.confirm_upload(init.file_id).await.unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));
    assert_eq!(
        h.service.get_file(init.file_id).await.unwrap().status,
        FileStatus::Pending
    );

    // Simulate the out-of-band PUT.
    h.storage
        .local
        .upload(&init.storage_key, reader(b"hello"), 5, &init.content_type)
        .await
        .unwrap();

    let file = h.service.confirm_upload(init.file_id).await.unwrap();
    assert_eq!(file.status, FileStatus::Completed);
}

#[tokio::test]
async fn confirm_rejects_failed_and_multipart_records() {
    let h = Harness::new().await;

    let init = h
        .service
        .init_presigned_upload("a.txt", "text/plain", 1)
        .await
        .unwrap();
    h.repo
        .inner
        .update_status(init.file_id, FileStatus::Failed)
        .await
        .unwrap();
    let err = h.service.confirm_upload(init.file_id).await.unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));

    let multipart = h
        .service
        .init_multipart_upload("big.bin", "", 1)
        .await
        .unwrap();
    let err = h.service.confirm_upload(multipart.file_id).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn multipart_flow() {
    let h = Harness::new().await;

    let init = h
        .service
        .init_multipart_upload("movie.mp4", "video/mp4", 10 * 1024 * 1024)
        .await
        .unwrap();
    assert!(!init.upload_id.is_empty());

    let record = h.service.get_file(init.file_id).await.unwrap();
    assert_eq!(record.status, FileStatus::Uploading);
    assert_eq!(record.upload_id, init.upload_id);

    for part_number in [1, 2] {
        let part = h
            .service
            .part_upload_url(init.file_id, part_number)
            .await
            .unwrap();
        assert!(!part.url.is_empty());
        assert_eq!(part.expires_in, 3600);
    }

    // Simulate the out-of-band part PUTs.
    let etag1 = h
        .storage
        .local
        .put_part(&init.upload_id, 1, reader(b"first-"))
        .await
        .unwrap();
    let etag2 = h
        .storage
        .local
        .put_part(&init.upload_id, 2, reader(b"second"))
        .await
        .unwrap();

    let file = h
        .service
        .complete_multipart_upload(
            init.file_id,
            &[
                CompletedPart { part_number: 1, etag: etag1.clone() },
                CompletedPart { part_number: 2, etag: etag2.clone() },
            ],
        )
        .await
        .unwrap();
    assert_eq!(file.status, FileStatus::Completed);
    assert_eq!(h.read_object(&init.storage_key).await, b"first-second");

    let err = h
        .service
        .complete_multipart_upload(
            init.file_id,
            &[CompletedPart { part_number: 1, etag: etag1 }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));

    let err = h.service.part_upload_url(init.file_id, 3).await.unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));
}

#[tokio::test]
async fn part_url_errors() {
    let h = Harness::new().await;

    let err = h
        .service
        .part_upload_url(Uuid::new_v4(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let single = h
        .service
        .init_presigned_upload("a.txt", "text/plain", 1)
        .await
        .unwrap();
    let err = h.service.part_upload_url(single.file_id, 1).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let multipart = h
        .service
        .init_multipart_upload("big.bin", "", 1)
        .await
        .unwrap();
    for bad in [0, 10_001] {
        let err = h
            .service
            .part_upload_url(multipart.file_id, bad)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }
}

#[tokio::test]
async fn complete_validates_parts() {
    let h = Harness::new().await;
    let init = h
        .service
        .init_multipart_upload("big.bin", "", 1)
        .await
        .unwrap();

    let err = h
        .service
        .complete_multipart_upload(init.file_id, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let err = h
        .service
        .complete_multipart_upload(
            init.file_id,
            &[
                CompletedPart { part_number: 2, etag: "\"a\"".to_string() },
                CompletedPart { part_number: 1, etag: "\"b\"".to_string() },
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    // Part never uploaded: the backend rejects the list.
    let err = h
        .service
        .complete_multipart_upload(
            init.file_id,
            &[CompletedPart { part_number: 1, etag: "\"a\"".to_string() }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
    assert_eq!(
        h.service.get_file(init.file_id).await.unwrap().status,
        FileStatus::Uploading
    );

    let single = h
        .service
        .init_presigned_upload("a.txt", "text/plain", 1)
        .await
        .unwrap();
    let err = h
        .service
        .complete_multipart_upload(
            single.file_id,
            &[CompletedPart { part_number: 1, etag: "\"a\"".to_string() }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn multipart_record_failure_aborts_session() {
    let h = Harness::new().await;
    h.repo.fail_create.store(true, Ordering::SeqCst);

    let err = h
        .service
        .init_multipart_upload("big.bin", "", 1)
        .await
        .unwrap_err();
    assert!(err.is_upstream());
    assert_eq!(h.staged_sessions(), 0);
}

#[tokio::test]
async fn download_url_requires_completion() {
    let h = Harness::new().await;

    let init = h
        .service
        .init_presigned_upload("a.txt", "text/plain", 1)
        .await
        .unwrap();
    let err = h
        .service
        .download_url(init.file_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));

    h.service.confirm_upload(init.file_id).await.unwrap();
    let download = h.service.download_url(init.file_id, None).await.unwrap();
    assert_eq!(download.expires_in, 900);
    assert_eq!(download.file_id, init.file_id);
    assert!(download.url.contains("content_disposition=inline"));

    let err = h.service.download_url(Uuid::new_v4(), None).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn download_disposition_by_type() {
    let h = Harness::new().await;

    for (name, expected) in [
        ("photo.png", "inline"),
        ("notes.txt", "inline"),
        ("doc.pdf", "inline"),
        ("archive.zip", "attachment"),
        ("data.bin", "attachment"),
    ] {
        let init = h.service.init_presigned_upload(name, "", 1).await.unwrap();
        h.service.confirm_upload(init.file_id).await.unwrap();

        let download = h.service.download_url(init.file_id, None).await.unwrap();
        assert!(
            download
                .url
                .contains(&format!("content_disposition={}", expected)),
            "{} -> {}",
            name,
            download.url
        );
    }
}

#[tokio::test]
async fn download_url_expiry_bounds() {
    let h = Harness::new().await;
    let file = h
        .service
        .upload("a.txt", "", 1, reader(b"x"))
        .await
        .unwrap();

    let custom = h
        .service
        .download_url(file.id, Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(custom.expires_in, 60);

    for bad in [Duration::ZERO, Duration::from_secs(8 * 24 * 3600)] {
        let err = h.service.download_url(file.id, Some(bad)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }
}

#[tokio::test]
async fn open_download_streams_bytes() {
    let h = Harness::new().await;
    let file = h
        .service
        .upload("a.txt", "text/plain", 13, reader(b"Hello, World!"))
        .await
        .unwrap();

    let mut download = h.service.open_download(file.id).await.unwrap();
    assert_eq!(download.content_length, Some(13));
    assert_eq!(download.content_type, "text/plain; charset=utf-8");
    assert_eq!(download.content_disposition, "inline; filename=\"a.txt\"");

    let mut body = Vec::new();
    while let Some(chunk) = download.body.next().await {
        body.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(body, b"Hello, World!");

    let pending = h
        .service
        .init_presigned_upload("b.txt", "", 1)
        .await
        .unwrap();
    assert!(matches!(
        h.service.open_download(pending.file_id).await,
        Err(AppError::PreconditionFailed(_))
    ));
}

#[tokio::test]
async fn delete_removes_record_and_object() {
    let h = Harness::new().await;
    let file = h
        .service
        .upload("a.txt", "text/plain", 13, reader(b"Hello, World!"))
        .await
        .unwrap();
    assert_eq!(h.object_count(), 1);

    h.service.delete_file(file.id).await.unwrap();

    assert!(matches!(
        h.service.get_file(file.id).await,
        Err(AppError::NotFound(_))
    ));
    assert_eq!(h.storage.head(&file.storage_key).await.unwrap(), None);

    let err = h.service.delete_file(file.id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = h.service.delete_file(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn failed_object_delete_keeps_record() {
    let h = Harness::new().await;
    let file = h
        .service
        .upload("a.txt", "text/plain", 13, reader(b"Hello, World!"))
        .await
        .unwrap();
    h.storage.fail_delete.store(true, Ordering::SeqCst);

    let err = h.service.delete_file(file.id).await.unwrap_err();
    assert!(err.is_upstream());

    let still_there = h.service.get_file(file.id).await.unwrap();
    assert_eq!(still_there.status, FileStatus::Completed);
    assert_eq!(h.read_object(&file.storage_key).await, b"Hello, World!");
}

#[tokio::test]
async fn delete_of_open_multipart_aborts_session() {
    let h = Harness::new().await;
    let init = h
        .service
        .init_multipart_upload("big.bin", "", 1)
        .await
        .unwrap();
    assert_eq!(h.staged_sessions(), 1);

    h.service.delete_file(init.file_id).await.unwrap();
    assert_eq!(h.staged_sessions(), 0);
}

#[tokio::test]
async fn failed_object_delete_keeps_multipart_session_usable() {
    let h = Harness::new().await;
    let init = h
        .service
        .init_multipart_upload("big.bin", "", 4)
        .await
        .unwrap();
    let etag = h
        .storage
        .local
        .put_part(&init.upload_id, 1, reader(b"data"))
        .await
        .unwrap();
    h.storage.fail_delete.store(true, Ordering::SeqCst);

    let err = h.service.delete_file(init.file_id).await.unwrap_err();
    assert!(err.is_upstream());
    assert_eq!(h.staged_sessions(), 1);

    let record = h.service.get_file(init.file_id).await.unwrap();
    assert_eq!(record.status, FileStatus::Uploading);
    assert_eq!(record.upload_id, init.upload_id);

    h.service.part_upload_url(init.file_id, 2).await.unwrap();
    let file = h
        .service
        .complete_multipart_upload(init.file_id, &[CompletedPart { part_number: 1, etag }])
        .await
        .unwrap();
    assert_eq!(file.status, FileStatus::Completed);
    assert_eq!(h.read_object(&init.storage_key).await, b"data");
}

#[tokio::test]
async fn delete_commit_failure_after_object_removal() {
    let h = Harness::new().await;
    let file = h
        .service
        .upload("a.txt", "text/plain", 13, reader(b"Hello, World!"))
        .await
        .unwrap();
    h.repo.fail_commit.store(true, Ordering::SeqCst);

    let err = h.service.delete_file(file.id).await.unwrap_err();
    assert!(err.is_upstream());

    // Known-inconsistent: the record survives, its object does not.
    let record = h.service.get_file(file.id).await.unwrap();
    assert_eq!(record.status, FileStatus::Completed);
    assert_eq!(h.storage.head(&file.storage_key).await.unwrap(), None);
}

#[tokio::test]
async fn list_files_pages_newest_first() {
    let h = Harness::new().await;
    let mut ids = Vec::new();
    for i in 0..3 {
        let init = h
            .service
            .init_presigned_upload(&format!("{}.txt", i), "", 1)
            .await
            .unwrap();
        ids.push(init.file_id);
    }

    let page = h.service.list_files(0, 2).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.limit, 2);
    assert_eq!(
        page.files.iter().map(|f| f.id).collect::<Vec<_>>(),
        vec![ids[2], ids[1]]
    );

    let defaulted = h.service.list_files(0, 0).await.unwrap();
    assert_eq!(defaulted.limit, 20);
    assert_eq!(defaulted.files.len(), 3);

    assert!(matches!(
        h.service.list_files(-1, 10).await,
        Err(AppError::InvalidInput(_))
    ));
}
