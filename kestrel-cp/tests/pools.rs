//! Storage-pool initialization, assignment and capacity flows.

mod common;

use common::TestStack;
use std::collections::HashMap;

use kestrel_daemon::PoolInitResult;
use kestrel_store::{Repository, VolumeRepo};
use kestrel_types::{Error, PoolBackend, PoolPhase, Volume, VolumePhase, VolumeSpec, VolumeStatus};

use kestrel_cp::pools::CreatePoolRequest;

fn nfs_request(name: &str) -> CreatePoolRequest {
    CreatePoolRequest {
        project_id: None,
        name: name.to_string(),
        backend: PoolBackend::Nfs {
            server: "fs1.example".to_string(),
            export_path: "/exports/vms".to_string(),
            version: "4.1".to_string(),
            options: None,
            mount_point: "/mnt/vms".to_string(),
        },
        labels: HashMap::new(),
    }
}

/// Spec scenario: creation with zero connected nodes and zero Ready nodes
/// ends in Error; a later reconnect with one node heals the pool.
#[tokio::test]
async fn test_pool_init_without_nodes_then_reconnect() {
    let stack = TestStack::new().await;

    let pool = stack.pools.create(nfs_request("shared")).await.unwrap();
    assert_eq!(pool.status.phase, PoolPhase::Error);
    assert!(
        pool.status
            .error_message
            .as_deref()
            .unwrap()
            .contains("No connected nodes"),
        "{:?}",
        pool.status.error_message
    );

    // A node joins and connects.
    stack.add_node("n1").await;
    stack.daemon("n1").set_pool_capacity(PoolInitResult {
        total_bytes: 500 << 30,
        available_bytes: 400 << 30,
        used_bytes: 100 << 30,
    });

    let pool = stack.pools.reconnect(&pool.id).await.unwrap();
    assert_eq!(pool.status.phase, PoolPhase::Ready);
    assert!(pool.status.error_message.is_none());
    assert_eq!(pool.status.capacity.total_bytes, 500 << 30);
    assert_eq!(pool.status.capacity.used_bytes, 100 << 30);
    // Ready pools satisfy available = total - used exactly.
    assert!(pool.status.capacity.is_consistent());
}

#[tokio::test]
async fn test_pool_init_first_success_short_circuits() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    stack.add_node("n2").await;

    let pool = stack.pools.create(nfs_request("shared")).await.unwrap();
    assert_eq!(pool.status.phase, PoolPhase::Ready);

    // Only the first node in the cohort was asked.
    let n1_inits = stack
        .daemon("n1")
        .calls()
        .iter()
        .filter(|c| c.starts_with("init_storage_pool"))
        .count();
    let n2_inits = stack
        .daemon("n2")
        .calls()
        .iter()
        .filter(|c| c.starts_with("init_storage_pool"))
        .count();
    assert_eq!(n1_inits + n2_inits, 1);
}

#[tokio::test]
async fn test_pool_init_falls_through_failures() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    stack.add_node("n2").await;
    stack.daemon("n1").fail_pool_init("mount: permission denied");

    let pool = stack.pools.create(nfs_request("shared")).await.unwrap();
    assert_eq!(pool.status.phase, PoolPhase::Ready);

    // The failing node is recorded unhealthy, the succeeding one healthy.
    let unhealthy = pool
        .status
        .host_statuses
        .iter()
        .find(|h| h.node_id == "n1")
        .unwrap();
    assert!(!unhealthy.healthy);
    assert!(pool
        .status
        .host_statuses
        .iter()
        .any(|h| h.node_id == "n2" && h.healthy));
}

#[tokio::test]
async fn test_pool_init_all_nodes_fail() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    stack.add_node("n2").await;
    stack.daemon("n1").fail_pool_init("mount failed");
    stack.daemon("n2").fail_pool_init("mount failed");

    let pool = stack.pools.create(nfs_request("shared")).await.unwrap();
    assert_eq!(pool.status.phase, PoolPhase::Error);
    let message = pool.status.error_message.unwrap();
    assert!(message.contains("2 node(s)"), "{}", message);
    assert!(message.contains("mount failed"), "{}", message);
}

#[tokio::test]
async fn test_duplicate_pool_name_rejected() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    stack.pools.create(nfs_request("shared")).await.unwrap();

    let err = stack.pools.create(nfs_request("shared")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
}

#[tokio::test]
async fn test_assignment_is_idempotent() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let pool = stack.pools.create(nfs_request("shared")).await.unwrap();

    let once = stack.pools.assign_to_node(&pool.id, "n1").await.unwrap();
    let twice = stack.pools.assign_to_node(&pool.id, "n1").await.unwrap();
    assert_eq!(once.assigned_node_ids, twice.assigned_node_ids);
    assert_eq!(twice.assigned_node_ids, vec!["n1".to_string()]);

    let cleared = stack.pools.unassign_from_node(&pool.id, "n1").await.unwrap();
    assert!(cleared.assigned_node_ids.is_empty());
    // Unassigning again stays empty.
    let cleared = stack.pools.unassign_from_node(&pool.id, "n1").await.unwrap();
    assert!(cleared.assigned_node_ids.is_empty());
}

#[tokio::test]
async fn test_assign_unknown_node_rejected() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let pool = stack.pools.create(nfs_request("shared")).await.unwrap();

    let err = stack.pools.assign_to_node(&pool.id, "ghost").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_delete_with_volumes_requires_force() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let pool = stack.pools.create(nfs_request("shared")).await.unwrap();

    let now = chrono::Utc::now();
    stack
        .repo
        .volumes()
        .create(&Volume {
            id: "vol-1".to_string(),
            pool_id: pool.id.clone(),
            project_id: "p1".to_string(),
            name: "data".to_string(),
            spec: VolumeSpec {
                size_bytes: 10 << 30,
                provisioning: Default::default(),
                access_mode: Default::default(),
                qos: None,
                encrypted: false,
                source: Default::default(),
            },
            status: VolumeStatus {
                phase: VolumePhase::Ready,
                ..Default::default()
            },
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

    let err = stack.pools.delete(&pool.id, false).await.unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)), "{:?}", err);

    stack.pools.delete(&pool.id, true).await.unwrap();
    assert!(matches!(
        stack.pools.get(&pool.id).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_get_refreshes_volume_count() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let pool = stack.pools.create(nfs_request("shared")).await.unwrap();
    assert_eq!(pool.status.volume_count, 0);

    let now = chrono::Utc::now();
    stack
        .repo
        .volumes()
        .create(&Volume {
            id: "vol-1".to_string(),
            pool_id: pool.id.clone(),
            project_id: "p1".to_string(),
            name: "data".to_string(),
            spec: VolumeSpec {
                size_bytes: 1 << 30,
                provisioning: Default::default(),
                access_mode: Default::default(),
                qos: None,
                encrypted: false,
                source: Default::default(),
            },
            status: VolumeStatus::default(),
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

    let pool = stack.pools.get(&pool.id).await.unwrap();
    assert_eq!(pool.status.volume_count, 1);
}

#[tokio::test]
async fn test_list_files_prefers_assigned_nodes() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    stack.add_node("n2").await;
    let pool = stack.pools.create(nfs_request("shared")).await.unwrap();
    stack.pools.assign_to_node(&pool.id, "n2").await.unwrap();

    stack.daemon("n2").set_files(vec![kestrel_daemon::PoolFileEntry {
        name: "ubuntu.qcow2".to_string(),
        size_bytes: 1 << 30,
        modified_at: chrono::Utc::now(),
        file_type: "file".to_string(),
        permissions: "rw-r--r--".to_string(),
    }]);

    let entries = stack.pools.list_files(&pool.id, "/cloud-images").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "ubuntu.qcow2");

    // The assigned node served the request.
    assert!(stack
        .daemon("n2")
        .calls()
        .iter()
        .any(|c| c.starts_with("list_pool_files")));
}
