//! Repository behavior tests against the SQLite implementation.

use chrono::{Duration, Utc};
use std::collections::HashMap;

use kestrel_store::{
    AuditFilter, AuditRepo, ImageRepo, NodeRepo, PoolRepo, Repository, SnapshotRepo,
    SqliteRepository, VmFilter, VmRepo,
};
use kestrel_types::{
    AuditEntry, Error, HaPolicy, Image, ImagePhase, ImageSpec, ImageStatus, Node, NodePhase,
    NodeRoles, NodeSpec, NodeStatus, PoolBackend, PoolStatus, Resources, Snapshot, SnapshotState,
    StoragePool, VirtualMachine, VmSpec, VmState, VmStatus,
};

fn make_node(id: &str, hostname: &str) -> Node {
    let now = Utc::now();
    Node {
        id: id.to_string(),
        hostname: hostname.to_string(),
        management_ip: "10.0.0.1/24".to_string(),
        cluster_id: None,
        labels: HashMap::new(),
        spec: NodeSpec {
            cpu_cores: 16,
            cpu_frequency_mhz: 2500,
            memory_mib: 65536,
            roles: NodeRoles::default(),
        },
        status: NodeStatus {
            phase: NodePhase::Ready,
            allocatable: Resources {
                cpu_cores: 16,
                memory_mib: 65536,
            },
            last_heartbeat: Some(now),
            ..Default::default()
        },
        created_at: now,
        updated_at: now,
    }
}

fn make_vm(id: &str, project_id: &str, name: &str) -> VirtualMachine {
    let now = Utc::now();
    VirtualMachine {
        id: id.to_string(),
        project_id: project_id.to_string(),
        name: name.to_string(),
        description: None,
        labels: HashMap::new(),
        hardware_version: 1,
        spec: VmSpec {
            cpu_cores: 2,
            memory_mib: 2048,
            ha: HaPolicy {
                auto_restart: true,
                restart_priority: 1,
            },
            ..Default::default()
        },
        status: VmStatus::default(),
        created_by: None,
        created_at: now,
        updated_at: now,
    }
}

fn make_pool(id: &str, name: &str) -> StoragePool {
    let now = Utc::now();
    StoragePool {
        id: id.to_string(),
        project_id: None,
        name: name.to_string(),
        backend: PoolBackend::Nfs {
            server: "fs1".to_string(),
            export_path: "/exports/vms".to_string(),
            version: "4.1".to_string(),
            options: None,
            mount_point: "/mnt/vms".to_string(),
        },
        assigned_node_ids: Vec::new(),
        labels: HashMap::new(),
        status: PoolStatus::default(),
        created_at: now,
        updated_at: now,
    }
}

fn make_snapshot(id: &str, vm_id: &str, name: &str) -> Snapshot {
    let now = Utc::now();
    Snapshot {
        id: id.to_string(),
        vm_id: vm_id.to_string(),
        name: name.to_string(),
        parent_id: None,
        state: SnapshotState::Available,
        size_bytes: 1 << 20,
        vm_spec: VmSpec::default(),
        created_at: now,
        updated_at: now,
    }
}

fn make_image(id: &str, catalog_id: Option<&str>) -> Image {
    let now = Utc::now();
    Image {
        id: id.to_string(),
        project_id: "p1".to_string(),
        name: format!("img-{}", id),
        spec: ImageSpec {
            catalog_id: catalog_id.map(str::to_string),
            ..Default::default()
        },
        status: ImageStatus::default(),
        created_at: now,
        updated_at: now,
    }
}

// =============================================================================
// Create / Get round-trips and uniqueness
// =============================================================================

#[tokio::test]
async fn test_on_disk_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let repo = SqliteRepository::open(dir.path()).await.unwrap();
        repo.vms().create(&make_vm("vm-1", "p1", "web")).await.unwrap();
    }

    // Reopening runs the (idempotent) migrations and sees the row.
    let repo = SqliteRepository::open(dir.path()).await.unwrap();
    let vm = repo.vms().get("vm-1").await.unwrap();
    assert_eq!(vm.name, "web");
}

#[tokio::test]
async fn test_create_then_get_returns_equal_vm() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();
    let vm = make_vm("vm-1", "p1", "web");
    repo.vms().create(&vm).await.unwrap();

    let got = repo.vms().get("vm-1").await.unwrap();
    assert_eq!(got.id, vm.id);
    assert_eq!(got.name, vm.name);
    assert_eq!(got.project_id, vm.project_id);
    assert_eq!(got.spec.cpu_cores, vm.spec.cpu_cores);
    assert!(got.spec.ha.auto_restart);
    assert_eq!(got.status.state, VmState::Pending);
}

#[tokio::test]
async fn test_duplicate_vm_name_in_project_is_already_exists() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();
    repo.vms().create(&make_vm("vm-1", "p1", "web")).await.unwrap();

    let err = repo.vms().create(&make_vm("vm-2", "p1", "web")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)), "{:?}", err);

    // Same name in another project is fine.
    repo.vms().create(&make_vm("vm-3", "p2", "web")).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_pool_name_is_already_exists() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();
    repo.pools().create(&make_pool("pool-1", "fast")).await.unwrap();

    let err = repo.pools().create(&make_pool("pool-2", "fast")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
}

#[tokio::test]
async fn test_duplicate_hostname_is_already_exists() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();
    repo.nodes().create(&make_node("node-1", "host1")).await.unwrap();

    let err = repo.nodes().create(&make_node("node-2", "host1")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
}

#[tokio::test]
async fn test_update_missing_row_is_not_found() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();
    let vm = make_vm("vm-404", "p1", "ghost");
    let err = repo.vms().update(&vm).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let err = repo.vms().update_status("vm-404", &VmStatus::default()).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// =============================================================================
// Indexed queries
// =============================================================================

#[tokio::test]
async fn test_list_schedulable_filters_phase_and_role() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();

    repo.nodes().create(&make_node("node-1", "host1")).await.unwrap();

    let mut maintenance = make_node("node-2", "host2");
    maintenance.status.phase = NodePhase::Maintenance;
    repo.nodes().create(&maintenance).await.unwrap();

    let mut storage_only = make_node("node-3", "host3");
    storage_only.spec.roles = NodeRoles {
        compute: false,
        storage: true,
        control_plane: false,
    };
    repo.nodes().create(&storage_only).await.unwrap();

    let schedulable = repo.nodes().list_schedulable().await.unwrap();
    assert_eq!(schedulable.len(), 1);
    assert_eq!(schedulable[0].id, "node-1");
}

#[tokio::test]
async fn test_update_heartbeat_stamps_time_and_allocation() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();
    let mut node = make_node("node-1", "host1");
    node.status.last_heartbeat = None;
    repo.nodes().create(&node).await.unwrap();

    let allocated = Resources {
        cpu_cores: 6,
        memory_mib: 12288,
    };
    repo.nodes().update_heartbeat("node-1", allocated).await.unwrap();

    let got = repo.nodes().get("node-1").await.unwrap();
    assert_eq!(got.status.allocated, allocated);
    let age = Utc::now() - got.status.last_heartbeat.unwrap();
    assert!(age < Duration::seconds(5));
}

#[tokio::test]
async fn test_vms_by_node_and_counts() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();

    for i in 0..3 {
        let mut vm = make_vm(&format!("vm-{}", i), "p1", &format!("web-{}", i));
        vm.status.state = VmState::Running;
        vm.status.node_id = Some("node-1".to_string());
        repo.vms().create(&vm).await.unwrap();
    }
    let mut other = make_vm("vm-9", "p2", "db");
    other.status.node_id = Some("node-2".to_string());
    repo.vms().create(&other).await.unwrap();

    assert_eq!(repo.vms().list_by_node("node-1").await.unwrap().len(), 3);
    assert_eq!(repo.vms().count_by_node("node-1").await.unwrap(), 3);
    assert_eq!(repo.vms().count_by_project("p2").await.unwrap(), 1);
}

#[tokio::test]
async fn test_vm_filter_states_and_name() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();

    let mut running = make_vm("vm-1", "p1", "web-frontend");
    running.status.state = VmState::Running;
    running.status.node_id = Some("node-1".to_string());
    repo.vms().create(&running).await.unwrap();

    let stopped = make_vm("vm-2", "p1", "batch-worker");
    repo.vms().create(&stopped).await.unwrap();

    let filter = VmFilter {
        states: Some(vec![VmState::Running, VmState::Starting]),
        ..Default::default()
    };
    let (vms, total) = repo.vms().list(&filter, 10, 0).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(vms[0].id, "vm-1");

    let filter = VmFilter {
        name_contains: Some("front".to_string()),
        ..Default::default()
    };
    let (vms, _) = repo.vms().list(&filter, 10, 0).await.unwrap();
    assert_eq!(vms.len(), 1);
    assert_eq!(vms[0].name, "web-frontend");
}

#[tokio::test]
async fn test_vm_cursor_pagination_visits_all_exactly_once() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();
    for i in 0..7 {
        let mut vm = make_vm(&format!("vm-{}", i), "p1", &format!("vm-{}", i));
        // Spread creation times so the keyset ordering is exercised.
        vm.created_at = Utc::now() - Duration::seconds(100 - i);
        repo.vms().create(&vm).await.unwrap();
    }

    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = repo
            .vms()
            .list_cursor(&VmFilter::default(), 3, cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(page.total, 7);
        seen.extend(page.items.iter().map(|vm| vm.id.clone()));
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 7);
}

#[tokio::test]
async fn test_pool_assignment_containment() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();

    let mut pool_a = make_pool("pool-a", "alpha");
    pool_a.assigned_node_ids = vec!["node-1".to_string(), "node-2".to_string()];
    repo.pools().create(&pool_a).await.unwrap();

    let mut pool_b = make_pool("pool-b", "beta");
    pool_b.assigned_node_ids = vec!["node-2".to_string()];
    repo.pools().create(&pool_b).await.unwrap();

    let pools = repo.pools().list_assigned_to_node("node-1").await.unwrap();
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].id, "pool-a");

    let pools = repo.pools().list_assigned_to_node("node-2").await.unwrap();
    assert_eq!(pools.len(), 2);

    // "node-10" must not match "node-1" by prefix.
    let pools = repo.pools().list_assigned_to_node("node-10").await.unwrap();
    assert!(pools.is_empty());
}

// =============================================================================
// Snapshot sync
// =============================================================================

#[tokio::test]
async fn test_snapshot_sync_reconciles_stored_set() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();
    repo.vms().create(&make_vm("vm-1", "p1", "web")).await.unwrap();

    for name in ["s1", "s2", "s3"] {
        repo.snapshots()
            .create(&make_snapshot(name, "vm-1", name))
            .await
            .unwrap();
    }

    // Hypervisor reports s2, s3 and a new s4.
    let delivered = vec![
        make_snapshot("s2", "vm-1", "s2"),
        make_snapshot("s3", "vm-1", "s3"),
        make_snapshot("s4", "vm-1", "s4"),
    ];
    repo.snapshots().sync_from_hypervisor("vm-1", &delivered).await.unwrap();

    let stored = repo.snapshots().list_by_vm("vm-1").await.unwrap();
    assert_eq!(stored.len(), 4);

    let state_of = |id: &str| {
        stored
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.state)
            .unwrap()
    };
    assert_eq!(state_of("s1"), SnapshotState::Deleted);
    assert_eq!(state_of("s2"), SnapshotState::Available);
    assert_eq!(state_of("s3"), SnapshotState::Available);
    assert_eq!(state_of("s4"), SnapshotState::Available);
}

#[tokio::test]
async fn test_snapshot_sync_is_deterministic() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();
    let delivered = vec![make_snapshot("s1", "vm-1", "s1")];

    repo.snapshots().sync_from_hypervisor("vm-1", &delivered).await.unwrap();
    let first = repo.snapshots().list_by_vm("vm-1").await.unwrap();

    repo.snapshots().sync_from_hypervisor("vm-1", &delivered).await.unwrap();
    let second = repo.snapshots().list_by_vm("vm-1").await.unwrap();

    assert_eq!(first.len(), second.len());
    assert_eq!(first[0].id, second[0].id);
    assert_eq!(first[0].state, second[0].state);
}

#[tokio::test]
async fn test_vm_delete_cascades_to_snapshots() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();
    repo.vms().create(&make_vm("vm-1", "p1", "web")).await.unwrap();
    repo.snapshots()
        .create(&make_snapshot("s1", "vm-1", "s1"))
        .await
        .unwrap();

    repo.vms().delete("vm-1").await.unwrap();
    assert!(repo.snapshots().list_by_vm("vm-1").await.unwrap().is_empty());
}

// =============================================================================
// Images
// =============================================================================

#[tokio::test]
async fn test_find_by_catalog_ids() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();
    repo.images()
        .create(&make_image("img-1", Some("ubuntu-22.04")))
        .await
        .unwrap();
    repo.images()
        .create(&make_image("img-2", Some("debian-12")))
        .await
        .unwrap();
    repo.images().create(&make_image("img-3", None)).await.unwrap();

    let found = repo
        .images()
        .find_by_catalog_ids(&["ubuntu-22.04".to_string(), "alpine-3.19".to_string()])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found["ubuntu-22.04"].id, "img-1");
}

#[tokio::test]
async fn test_image_upsert_keyed_by_node_and_path() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();

    let mut image = make_image("img-1", None);
    image.status.node_id = Some("node-1".to_string());
    image.status.path = Some("/pool/cloud-images/u.qcow2".to_string());
    repo.images().upsert(&image).await.unwrap();

    // Re-reported scan of the same file keeps one row, even with a new id.
    let mut rescan = make_image("img-other", None);
    rescan.status.node_id = Some("node-1".to_string());
    rescan.status.path = Some("/pool/cloud-images/u.qcow2".to_string());
    rescan.status.phase = ImagePhase::Ready;
    repo.images().upsert(&rescan).await.unwrap();

    let (images, total) = repo
        .images()
        .list(&Default::default(), 10, 0)
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(images[0].id, "img-1");
    assert_eq!(images[0].status.phase, ImagePhase::Ready);
}

// =============================================================================
// Audit export
// =============================================================================

#[tokio::test]
async fn test_audit_export_streams_in_ascending_time() {
    let repo = SqliteRepository::open_in_memory().await.unwrap();
    let base = Utc::now();

    // Insert out of order.
    for (i, offset) in [3i64, 1, 4, 0, 2].iter().enumerate() {
        repo.audit()
            .create(&AuditEntry {
                id: format!("a-{}", i),
                timestamp: base + Duration::seconds(*offset),
                actor: "admin".to_string(),
                action: "vm.create".to_string(),
                resource_type: "vm".to_string(),
                resource_id: format!("vm-{}", i),
                project_id: None,
                details: serde_json::Value::Null,
            })
            .await
            .unwrap();
    }

    let mut export = repo.audit().export(&AuditFilter::default()).await.unwrap();
    let mut timestamps = Vec::new();
    while let Some(entry) = export.entries.recv().await {
        timestamps.push(entry.timestamp);
    }
    assert_eq!(timestamps.len(), 5);
    let mut sorted = timestamps.clone();
    sorted.sort();
    assert_eq!(timestamps, sorted);
    // No error fired.
    assert!(export.errors.try_recv().is_err());
}
