//! Unit tests for the DeploymentZone helpers.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use vsphere_client::MockInventory;

use crds::{
    get_condition, is_true, ConditionStatus, PlacementConstraint, API_VERSION,
    FOLDER_NOT_FOUND_REASON, PLACEMENT_CONSTRAINT_MET_CONDITION, RESOURCE_POOL_NOT_FOUND_REASON,
};

use crate::error::ControllerError;
use crate::reconciler::zone::{
    blocking_vm_names, has_zone_owner_reference, remove_zone_owner_reference, validate_placement,
};
use crate::test_utils::{base_failure_domain, base_vm, test_session};

fn zone_owner(name: &str) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: "DeploymentZone".to_string(),
        name: name.to_string(),
        uid: format!("uid-{name}"),
        ..Default::default()
    }
}

#[tokio::test]
async fn empty_constraint_validates_without_backend_lookups() {
    let inventory = MockInventory::new();
    let session = test_session();
    let mut conditions = Vec::new();

    validate_placement(
        &mut conditions,
        &session,
        &inventory,
        &PlacementConstraint::default(),
    )
    .await
    .expect("validate");

    assert!(is_true(&conditions, PLACEMENT_CONSTRAINT_MET_CONDITION));
}

#[tokio::test]
async fn present_pool_and_folder_validate() {
    let inventory = MockInventory::new();
    inventory.add_resource_pool("/dc0/host/cluster/Resources/prod");
    inventory.add_folder("/dc0/vm/prod");
    let session = test_session();
    let mut conditions = Vec::new();

    validate_placement(
        &mut conditions,
        &session,
        &inventory,
        &PlacementConstraint {
            resource_pool: Some("/dc0/host/cluster/Resources/prod".to_string()),
            folder: Some("/dc0/vm/prod".to_string()),
        },
    )
    .await
    .expect("validate");

    assert!(is_true(&conditions, PLACEMENT_CONSTRAINT_MET_CONDITION));
}

#[tokio::test]
async fn missing_resource_pool_fails_with_reason() {
    let inventory = MockInventory::new();
    let session = test_session();
    let mut conditions = Vec::new();

    let err = validate_placement(
        &mut conditions,
        &session,
        &inventory,
        &PlacementConstraint {
            resource_pool: Some("/dc0/host/cluster/Resources/missing".to_string()),
            folder: None,
        },
    )
    .await
    .expect_err("must fail");

    assert!(matches!(err, ControllerError::Backend(_)));
    let condition = get_condition(&conditions, PLACEMENT_CONSTRAINT_MET_CONDITION).unwrap();
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(
        condition.reason.as_deref(),
        Some(RESOURCE_POOL_NOT_FOUND_REASON)
    );
    assert!(condition
        .message
        .as_deref()
        .is_some_and(|m| m.contains("missing")));
}

#[tokio::test]
async fn missing_folder_fails_with_reason() {
    let inventory = MockInventory::new();
    inventory.add_resource_pool("/dc0/host/cluster/Resources/prod");
    let session = test_session();
    let mut conditions = Vec::new();

    let err = validate_placement(
        &mut conditions,
        &session,
        &inventory,
        &PlacementConstraint {
            resource_pool: Some("/dc0/host/cluster/Resources/prod".to_string()),
            folder: Some("/dc0/vm/missing".to_string()),
        },
    )
    .await
    .expect_err("must fail");

    assert!(matches!(err, ControllerError::Backend(_)));
    let condition = get_condition(&conditions, PLACEMENT_CONSTRAINT_MET_CONDITION).unwrap();
    assert_eq!(condition.reason.as_deref(), Some(FOLDER_NOT_FOUND_REASON));
}

#[test]
fn deletion_is_blocked_by_live_vms_only() {
    let mut placed = base_vm("worker-1");
    placed.spec.failure_domain = Some("zone-a".to_string());

    let mut deleting = base_vm("worker-2");
    deleting.spec.failure_domain = Some("zone-a".to_string());
    deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

    let mut elsewhere = base_vm("worker-3");
    elsewhere.spec.failure_domain = Some("zone-b".to_string());

    let unplaced = base_vm("worker-4");

    let vms = vec![placed, deleting, elsewhere, unplaced];
    assert_eq!(blocking_vm_names(&vms, "zone-a"), vec!["worker-1"]);
    assert_eq!(blocking_vm_names(&vms, "zone-b"), vec!["worker-3"]);
    assert!(blocking_vm_names(&vms, "zone-c").is_empty());
}

#[test]
fn owner_reference_round_trip() {
    let mut fd = base_failure_domain("fd-1");
    assert!(!has_zone_owner_reference(&fd, "zone-a"));
    assert!(!remove_zone_owner_reference(&mut fd, "zone-a"));

    fd.metadata.owner_references = Some(vec![zone_owner("zone-a"), zone_owner("zone-b")]);
    assert!(has_zone_owner_reference(&fd, "zone-a"));

    assert!(remove_zone_owner_reference(&mut fd, "zone-a"));
    assert!(!has_zone_owner_reference(&fd, "zone-a"));
    assert!(has_zone_owner_reference(&fd, "zone-b"));
    assert_eq!(fd.metadata.owner_references.as_ref().unwrap().len(), 1);

    // Removing the last owner leaves an empty list for the caller to
    // treat as "delete the failure domain".
    assert!(remove_zone_owner_reference(&mut fd, "zone-b"));
    assert!(fd.metadata.owner_references.as_ref().unwrap().is_empty());
}
