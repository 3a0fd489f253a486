//! VM lifecycle flows against the full service stack.

mod common;

use common::TestStack;
use std::collections::HashMap;

use kestrel_daemon::{DaemonSnapshot, DaemonVmStatus};
use kestrel_store::{Repository, SnapshotRepo, VmFilter, VmRepo};
use kestrel_types::{Error, SnapshotState, VmSpec, VmState};

use kestrel_cp::bus::{EventFilter, EventType, ResourceType};
use kestrel_cp::cache::CacheEvent;
use kestrel_cp::vms::CreateVmRequest;

fn make_request(name: &str) -> CreateVmRequest {
    CreateVmRequest {
        project_id: "p1".to_string(),
        name: name.to_string(),
        description: None,
        labels: HashMap::new(),
        spec: VmSpec {
            cpu_cores: 2,
            memory_mib: 2048,
            ..Default::default()
        },
        created_by: Some("tester".to_string()),
    }
}

#[tokio::test]
async fn test_create_then_get_round_trip() {
    let stack = TestStack::new().await;
    let created = stack.vms.create(make_request("web")).await.unwrap();

    let got = stack.vms.get(&created.id).await.unwrap();
    assert_eq!(got.id, created.id);
    assert_eq!(got.name, "web");
    assert_eq!(got.spec.cpu_cores, 2);
    assert_eq!(got.status.state, VmState::Pending);
}

#[tokio::test]
async fn test_duplicate_name_rejected() {
    let stack = TestStack::new().await;
    stack.vms.create(make_request("web")).await.unwrap();

    let err = stack.vms.create(make_request("web")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)), "{:?}", err);
}

#[tokio::test]
async fn test_default_project_is_normalized() {
    let stack = TestStack::new().await;
    let mut req = make_request("web");
    req.project_id = "default".to_string();
    let vm = stack.vms.create(req).await.unwrap();
    assert_eq!(vm.project_id, kestrel_types::DEFAULT_PROJECT_ID);
}

#[tokio::test]
async fn test_start_schedules_and_publishes_started() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let created = stack.vms.create(make_request("web")).await.unwrap();

    let mut sub = stack.bus.subscribe(EventFilter {
        resource_type: ResourceType::Vm,
        resource_id: Some(created.id.clone()),
        event_types: vec![EventType::Started],
        project_id: None,
    });

    let vm = stack.vms.start(&created.id, None).await.unwrap();
    assert_eq!(vm.status.state, VmState::Running);
    assert_eq!(vm.status.node_id.as_deref(), Some("n1"));
    assert!(!vm.status.ip_addresses.is_empty());

    let event = sub.recv().await.unwrap();
    assert_eq!(event.event_type, EventType::Started);
    assert_eq!(event.resource_id, created.id);
}

#[tokio::test]
async fn test_start_publishes_on_cache_change_feed() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let created = stack.vms.create(make_request("web")).await.unwrap();

    // Subscribe to the cache feed after creation so only the start flow
    // is observed.
    let mut feed = stack.cache.subscribe();
    stack.vms.start(&created.id, None).await.unwrap();

    let saw_running = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            match feed.recv().await.unwrap() {
                CacheEvent::VmUpdated(vm)
                    if vm.id == created.id && vm.status.state == VmState::Running =>
                {
                    return true;
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert!(saw_running);
}

#[tokio::test]
async fn test_start_with_explicit_target() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    stack.add_node("n2").await;
    let created = stack.vms.create(make_request("web")).await.unwrap();

    let vm = stack
        .vms
        .start(&created.id, Some("n2".to_string()))
        .await
        .unwrap();
    assert_eq!(vm.status.node_id.as_deref(), Some("n2"));
}

#[tokio::test]
async fn test_start_already_running_rejected() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let created = stack.vms.create(make_request("web")).await.unwrap();
    stack.vms.start(&created.id, None).await.unwrap();

    let err = stack.vms.start(&created.id, None).await.unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)));
}

#[tokio::test]
async fn test_start_failure_sets_error_status() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    stack.daemon("n1").fail_start("qemu exploded");
    let created = stack.vms.create(make_request("web")).await.unwrap();

    let err = stack.vms.start(&created.id, None).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)), "{:?}", err);

    let vm = stack.repo.vms().get(&created.id).await.unwrap();
    assert_eq!(vm.status.state, VmState::Error);
    assert!(vm.status.message.as_deref().unwrap().contains("qemu exploded"));
}

#[tokio::test]
async fn test_stop_and_events() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let created = stack.vms.create(make_request("web")).await.unwrap();
    stack.vms.start(&created.id, None).await.unwrap();

    let mut sub = stack.bus.subscribe(EventFilter {
        resource_type: ResourceType::Vm,
        resource_id: Some(created.id.clone()),
        event_types: vec![EventType::Stopped],
        project_id: None,
    });

    let vm = stack.vms.stop(&created.id, true).await.unwrap();
    assert_eq!(vm.status.state, VmState::Stopped);
    assert!(vm.status.ip_addresses.is_empty());

    let event = sub.recv().await.unwrap();
    assert_eq!(event.event_type, EventType::Stopped);

    // Stopping a stopped VM is a no-op.
    let again = stack.vms.stop(&created.id, true).await.unwrap();
    assert_eq!(again.status.state, VmState::Stopped);
}

#[tokio::test]
async fn test_pause_resume_preconditions() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let created = stack.vms.create(make_request("web")).await.unwrap();

    // Pausing a pending VM is rejected.
    let err = stack.vms.pause(&created.id).await.unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)));

    stack.vms.start(&created.id, None).await.unwrap();
    let vm = stack.vms.pause(&created.id).await.unwrap();
    assert_eq!(vm.status.state, VmState::Paused);

    let vm = stack.vms.resume(&created.id).await.unwrap();
    assert_eq!(vm.status.state, VmState::Running);
}

#[tokio::test]
async fn test_migrate_moves_placement() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    stack.add_node("n2").await;
    let created = stack.vms.create(make_request("web")).await.unwrap();
    stack
        .vms
        .start(&created.id, Some("n1".to_string()))
        .await
        .unwrap();

    let vm = stack.vms.migrate(&created.id, None).await.unwrap();
    assert_eq!(vm.status.state, VmState::Running);
    assert_eq!(vm.status.node_id.as_deref(), Some("n2"));

    // The source daemon performed the migration.
    let calls = stack.daemon("n1").calls();
    assert!(
        calls.iter().any(|c| c.starts_with(&format!("migrate_vm {}", created.id))),
        "{:?}",
        calls
    );
}

#[tokio::test]
async fn test_delete_cascades_and_emits() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let created = stack.vms.create(make_request("web")).await.unwrap();
    stack.vms.start(&created.id, None).await.unwrap();
    stack
        .vms
        .create_snapshot(&created.id, "pre-upgrade", None)
        .await
        .unwrap();

    stack.vms.delete(&created.id).await.unwrap();

    assert!(matches!(
        stack.repo.vms().get(&created.id).await,
        Err(Error::NotFound(_))
    ));
    assert!(stack
        .repo
        .snapshots()
        .list_by_vm(&created.id)
        .await
        .unwrap()
        .is_empty());
}

// =============================================================================
// Snapshots
// =============================================================================

#[tokio::test]
async fn test_snapshot_create_and_parent_validation() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let vm_a = stack.vms.create(make_request("a")).await.unwrap();
    let vm_b = stack.vms.create(make_request("b")).await.unwrap();
    stack.vms.start(&vm_a.id, None).await.unwrap();
    stack.vms.start(&vm_b.id, None).await.unwrap();

    let root = stack
        .vms
        .create_snapshot(&vm_a.id, "root", None)
        .await
        .unwrap();
    let child = stack
        .vms
        .create_snapshot(&vm_a.id, "child", Some(root.id.clone()))
        .await
        .unwrap();
    assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
    assert_eq!(child.state, SnapshotState::Available);

    // A parent belonging to another VM violates the tree invariant.
    let err = stack
        .vms
        .create_snapshot(&vm_b.id, "bad", Some(root.id.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // Duplicate names are rejected per VM.
    let err = stack
        .vms
        .create_snapshot(&vm_a.id, "root", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
}

#[tokio::test]
async fn test_revert_restores_captured_spec() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let created = stack.vms.create(make_request("web")).await.unwrap();
    stack.vms.start(&created.id, None).await.unwrap();

    let snapshot = stack
        .vms
        .create_snapshot(&created.id, "before", None)
        .await
        .unwrap();

    // Grow the VM after the snapshot.
    let mut bigger = created.spec.clone();
    bigger.cpu_cores = 8;
    stack.vms.update_spec(&created.id, bigger).await.unwrap();

    let reverted = stack
        .vms
        .revert_snapshot(&created.id, &snapshot.id)
        .await
        .unwrap();
    assert_eq!(reverted.spec.cpu_cores, 2);
}

// =============================================================================
// Status reconciler
// =============================================================================

#[tokio::test]
async fn test_status_reconciler_converges_drift() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let created = stack.vms.create(make_request("web")).await.unwrap();
    stack.vms.start(&created.id, None).await.unwrap();

    // The daemon now reports the VM stopped (crashed guest).
    stack.daemon("n1").set_vm_status(
        &created.id,
        DaemonVmStatus {
            state: VmState::Stopped,
            ip_addresses: Vec::new(),
            resources: None,
            message: Some("guest shutdown".to_string()),
        },
    );

    let mut sub = stack.bus.subscribe(EventFilter {
        resource_type: ResourceType::Vm,
        resource_id: Some(created.id.clone()),
        event_types: vec![EventType::Stopped],
        project_id: None,
    });

    stack.status.tick().await;

    let vm = stack.repo.vms().get(&created.id).await.unwrap();
    assert_eq!(vm.status.state, VmState::Stopped);
    assert_eq!(vm.status.message.as_deref(), Some("guest shutdown"));

    let event = sub.recv().await.unwrap();
    assert_eq!(event.event_type, EventType::Stopped);
}

#[tokio::test]
async fn test_status_reconciler_syncs_snapshots() {
    let stack = TestStack::new().await;
    stack.add_node("n1").await;
    let created = stack.vms.create(make_request("web")).await.unwrap();
    stack.vms.start(&created.id, None).await.unwrap();

    // Hypervisor reports a snapshot the repository does not know.
    stack.daemon("n1").set_snapshots(
        &created.id,
        vec![DaemonSnapshot {
            id: "snap-external".to_string(),
            name: "made-by-hand".to_string(),
            parent_id: None,
            size_bytes: 42,
            created_at: chrono::Utc::now(),
        }],
    );

    stack.status.tick().await;

    let snapshots = stack.repo.snapshots().list_by_vm(&created.id).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].id, "snap-external");
    assert_eq!(snapshots[0].state, SnapshotState::Available);
}

// =============================================================================
// Listing
// =============================================================================

#[tokio::test]
async fn test_cursor_listing_through_service() {
    let stack = TestStack::new().await;
    for i in 0..5 {
        stack.vms.create(make_request(&format!("vm-{}", i))).await.unwrap();
    }

    let first = stack.vms.list(&VmFilter::default(), 2, None).await.unwrap();
    assert_eq!(first.items.len(), 2);
    assert_eq!(first.total, 5);
    let cursor = first.next_cursor.clone().unwrap();

    let second = stack
        .vms
        .list(&VmFilter::default(), 2, Some(&cursor))
        .await
        .unwrap();
    assert_eq!(second.items.len(), 2);
    assert!(second.items.iter().all(|vm| !first.items.iter().any(|f| f.id == vm.id)));
}
