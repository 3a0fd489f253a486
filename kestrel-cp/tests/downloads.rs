//! Routed image downloads: node selection, polling, duplicate policy.

mod common;

use common::TestStack;
use std::collections::HashMap;

use std::sync::Arc;

use kestrel_daemon::RemoteDownloadStatus;
use kestrel_store::{ImageRepo, PoolRepo, Repository};
use kestrel_types::{
    DownloadState, Error, ImagePhase, PoolBackend, PoolStatus, StoragePool,
};

use kestrel_cp::downloads::{DownloadManager, StartDownloadRequest};
use kestrel_cp::pools::CreatePoolRequest;

fn download_request(pool_id: &str) -> StartDownloadRequest {
    StartDownloadRequest {
        catalog_id: "ubuntu-22.04".to_string(),
        name: "Ubuntu 22.04 LTS".to_string(),
        url: "https://cloud-images.example/jammy.qcow2".to_string(),
        pool_id: pool_id.to_string(),
        project_id: String::new(),
        checksum: Some("sha256:abc".to_string()),
    }
}

async fn create_pool(stack: &TestStack, assigned: &[&str]) -> String {
    let pool = stack
        .pools
        .create(CreatePoolRequest {
            project_id: None,
            name: "images".to_string(),
            backend: PoolBackend::Nfs {
                server: "fs1".to_string(),
                export_path: "/exports".to_string(),
                version: "4.1".to_string(),
                options: None,
                mount_point: "/mnt/images".to_string(),
            },
            labels: HashMap::new(),
        })
        .await
        .unwrap();
    for node in assigned {
        stack.pools.assign_to_node(&pool.id, node).await.unwrap();
    }
    pool.id
}

#[tokio::test]
async fn test_download_routed_to_assigned_node() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    stack.add_node("n2").await;
    let pool_id = create_pool(&stack, &["n2"]).await;

    let job = stack
        .downloads
        .start_download_with_pool(download_request(&pool_id))
        .await
        .unwrap();
    assert_eq!(job.state, DownloadState::Downloading);
    assert_eq!(job.node_id.as_deref(), Some("n2"));
    assert!(job.remote_job_id.is_some());

    // The request carried the mount-point derived target directory.
    let requests = stack.daemon("n2").download_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].target_dir, "/mnt/images/cloud-images");
    assert_eq!(requests[0].catalog_id, "ubuntu-22.04");

    let image = stack.repo.images().get(&job.image_id).await.unwrap();
    assert_eq!(image.status.phase, ImagePhase::Downloading);
    assert_eq!(image.status.node_id.as_deref(), Some("n2"));
}

#[tokio::test]
async fn test_poller_completes_job_and_image() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let pool_id = create_pool(&stack, &["n1"]).await;

    let job = stack
        .downloads
        .start_download_with_pool(download_request(&pool_id))
        .await
        .unwrap();

    // First poll: still downloading.
    stack.downloads.poll_jobs().await;
    let current = stack.downloads.get_job(&job.id).await.unwrap();
    assert_eq!(current.state, DownloadState::Downloading);
    assert_eq!(current.progress_percent, 50);

    // Second poll: the fake completes.
    stack.downloads.poll_jobs().await;
    let current = stack.downloads.get_job(&job.id).await.unwrap();
    assert_eq!(current.state, DownloadState::Completed);
    assert_eq!(current.progress_percent, 100);

    let image = stack.repo.images().get(&job.image_id).await.unwrap();
    assert_eq!(image.status.phase, ImagePhase::Ready);
    assert_eq!(
        image.status.path.as_deref(),
        Some("/mnt/pool/cloud-images/image.qcow2")
    );
    assert_eq!(image.status.filename.as_deref(), Some("image.qcow2"));
    assert_eq!(
        image.status.folder_path.as_deref(),
        Some("/mnt/pool/cloud-images")
    );
    assert_eq!(image.status.progress_percent, 100);

    // Terminal states are sticky: further polls change nothing.
    stack.downloads.poll_jobs().await;
    let current = stack.downloads.get_job(&job.id).await.unwrap();
    assert_eq!(current.state, DownloadState::Completed);
}

#[tokio::test]
async fn test_duplicate_catalog_download_rejected() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let pool_id = create_pool(&stack, &["n1"]).await;

    let job = stack
        .downloads
        .start_download_with_pool(download_request(&pool_id))
        .await
        .unwrap();
    stack.downloads.poll_jobs().await;
    stack.downloads.poll_jobs().await; // completes

    let err = stack
        .downloads
        .start_download_with_pool(download_request(&pool_id))
        .await
        .unwrap_err();
    match err {
        Error::AlreadyExists(message) => {
            // The message names the blocking image.
            assert!(message.contains(&job.image_id), "{}", message);
            assert!(message.contains("ubuntu-22.04"), "{}", message);
        }
        other => panic!("unexpected: {:?}", other),
    }

    // Deleting the image frees the catalog id.
    stack.repo.images().delete(&job.image_id).await.unwrap();
    stack
        .downloads
        .start_download_with_pool(download_request(&pool_id))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_download_marks_image_and_allows_retry() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let pool_id = create_pool(&stack, &["n1"]).await;

    stack.daemon("n1").script_next_download(vec![RemoteDownloadStatus {
        state: "failed".to_string(),
        progress_percent: 10,
        bytes_downloaded: 1024,
        total_bytes: 1 << 30,
        path: None,
        size_bytes: 0,
        error: Some("checksum mismatch".to_string()),
    }]);

    let job = stack
        .downloads
        .start_download_with_pool(download_request(&pool_id))
        .await
        .unwrap();
    stack.downloads.poll_jobs().await;

    let current = stack.downloads.get_job(&job.id).await.unwrap();
    assert_eq!(current.state, DownloadState::Failed);
    assert_eq!(current.error.as_deref(), Some("checksum mismatch"));

    let image = stack.repo.images().get(&job.image_id).await.unwrap();
    assert_eq!(image.status.phase, ImagePhase::Error);

    // A failed record does not block a retry; it is replaced.
    let retry = stack
        .downloads
        .start_download_with_pool(download_request(&pool_id))
        .await
        .unwrap();
    assert_ne!(retry.image_id, job.image_id);
    assert!(matches!(
        stack.repo.images().get(&job.image_id).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_download_without_nodes_fails_visibly() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let pool_id = create_pool(&stack, &[]).await;

    // Disconnect the only node; no assigned nodes remain either.
    stack.daemons.disconnect("n1").await;
    stack.fakes.set_unreachable("n1");

    let err = stack
        .downloads
        .start_download_with_pool(download_request(&pool_id))
        .await
        .unwrap_err();
    match err {
        Error::FailedPrecondition(message) => {
            assert!(message.contains("No connected nodes"), "{}", message);
        }
        other => panic!("unexpected: {:?}", other),
    }
}

/// A dev-mode download whose source dies mid-body must not leave a
/// partial image file behind.
#[tokio::test]
async fn test_local_download_read_error_removes_partial_file() {
    // Stub HTTP server: advertises a large body, sends a few bytes, then
    // closes the connection so the client hits a read error.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 65536\r\n\r\npartial-body")
                .await;
            let _ = socket.shutdown().await;
        }
    });

    let stack = TestStack::new().await;
    let dir = tempfile::tempdir().unwrap();
    let now = chrono::Utc::now();
    stack
        .repo
        .pools()
        .create(&StoragePool {
            id: "pool-local".to_string(),
            project_id: None,
            name: "scratch".to_string(),
            backend: PoolBackend::LocalDir {
                path: dir.path().to_string_lossy().to_string(),
            },
            assigned_node_ids: Vec::new(),
            labels: Default::default(),
            status: PoolStatus::default(),
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

    // Dev-mode manager: no daemon pool involved, bytes stream locally.
    let downloads = DownloadManager::new(
        Arc::clone(&stack.repo) as Arc<dyn Repository>,
        Arc::clone(&stack.daemons),
        true,
    );

    let job = downloads
        .start_download_with_pool(StartDownloadRequest {
            catalog_id: "debian-12".to_string(),
            name: "Debian 12".to_string(),
            url: format!("http://{}/image.img", addr),
            pool_id: "pool-local".to_string(),
            project_id: String::new(),
            checksum: None,
        })
        .await
        .unwrap();

    // The spawned task fails shortly after the connection drops.
    let mut failed = false;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let current = downloads.get_job(&job.id).await.unwrap();
        if current.state == DownloadState::Failed {
            failed = true;
            break;
        }
    }
    assert!(failed, "job did not reach Failed");

    let image = stack.repo.images().get(&job.image_id).await.unwrap();
    assert_eq!(image.status.phase, ImagePhase::Error);

    // The partial file was removed; only the empty directory remains.
    let target_dir = dir.path().join("cloud-images");
    let leftovers = std::fs::read_dir(&target_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "partial image file left behind");
}

#[tokio::test]
async fn test_unassigned_pool_falls_back_to_any_connected_node() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let pool_id = create_pool(&stack, &[]).await;

    let job = stack
        .downloads
        .start_download_with_pool(download_request(&pool_id))
        .await
        .unwrap();
    assert_eq!(job.node_id.as_deref(), Some("n1"));
}
