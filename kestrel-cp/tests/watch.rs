//! Watch semantics: initial state before live events, per-subscription
//! ordering, slow-consumer drops.

mod common;

use common::TestStack;
use std::collections::HashMap;

use kestrel_store::{Repository, VmRepo};
use kestrel_types::VmSpec;

use kestrel_cp::bus::{EventPayload, EventType};
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
        created_by: None,
    }
}

/// Spec scenario: the client first receives the current VM, then the
/// Updated event carrying the new version.
#[tokio::test]
async fn test_watch_vm_initial_state_then_updates() {
    let stack = TestStack::new().await;
    let created = stack.vms.create(make_request("web")).await.unwrap();

    let (current, mut sub) = stack.vms.watch_vm(&created.id).await.unwrap();
    assert_eq!(current.id, created.id);
    assert_eq!(current.spec.cpu_cores, 2);

    // Update the spec after the watch is established.
    let mut bigger = created.spec.clone();
    bigger.cpu_cores = 4;
    stack.vms.update_spec(&created.id, bigger).await.unwrap();

    let event = sub.recv().await.unwrap();
    assert_eq!(event.event_type, EventType::Updated);
    match event.payload {
        EventPayload::Vm(vm) => assert_eq!(vm.spec.cpu_cores, 4),
        other => panic!("unexpected payload: {:?}", other),
    }
}

/// No update between read and subscribe can be lost: the subscription is
/// registered before the initial read.
#[tokio::test]
async fn test_watch_vm_does_not_miss_updates_racing_subscribe() {
    let stack = TestStack::new().await;
    let created = stack.vms.create(make_request("web")).await.unwrap();

    let (_, mut sub) = stack.vms.watch_vm(&created.id).await.unwrap();

    // Publish immediately after; the subscriber must observe it.
    let mut spec = created.spec.clone();
    spec.memory_mib = 4096;
    stack.vms.update_spec(&created.id, spec).await.unwrap();

    let event = sub.recv().await.unwrap();
    assert_eq!(event.resource_id, created.id);
}

#[tokio::test]
async fn test_watch_vms_scoped_to_project() {
    let stack = TestStack::new().await;
    stack.vms.create(make_request("web")).await.unwrap();

    let mut other = make_request("db");
    other.project_id = "p2".to_string();
    let other_vm = stack.vms.create(other).await.unwrap();

    let (initial, mut sub) = stack.vms.watch_vms(Some("p2".to_string())).await.unwrap();
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].id, other_vm.id);

    // Events from p1 are filtered out.
    let p1_vm = stack.vms.create(make_request("api")).await.unwrap();
    let mut spec = p1_vm.spec.clone();
    spec.cpu_cores = 4;
    stack.vms.update_spec(&p1_vm.id, spec).await.unwrap();

    let mut spec = other_vm.spec.clone();
    spec.cpu_cores = 8;
    stack.vms.update_spec(&other_vm.id, spec).await.unwrap();

    let event = sub.recv().await.unwrap();
    assert_eq!(event.resource_id, other_vm.id);
}

#[tokio::test]
async fn test_deleted_event_reaches_watchers() {
    let stack = TestStack::new().await;
    let created = stack.vms.create(make_request("web")).await.unwrap();

    let (_, mut sub) = stack.vms.watch_vm(&created.id).await.unwrap();
    stack.vms.delete(&created.id).await.unwrap();

    let event = sub.recv().await.unwrap();
    assert_eq!(event.event_type, EventType::Deleted);
    assert_eq!(event.resource_id, created.id);
    assert_eq!(event.resource_type, kestrel_cp::bus::ResourceType::Vm);

    // The row is gone by the time the event arrives.
    assert_eq!(
        stack.repo.vms().get(&created.id).await.unwrap_err().http_code(),
        404
    );
}
