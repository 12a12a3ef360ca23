//! Unit tests for the address-claim sub-reconciler.

use kube::ResourceExt;

use crds::{
    get_condition, is_true, ConditionStatus, ADDRESS_CLAIM_FINALIZER, CLAIMS_BEING_CREATED_REASON,
    CLAIM_CREATION_FAILED_REASON, CLUSTER_NAME_LABEL, IP_ADDRESS_CLAIMED_CONDITION,
    WAITING_FOR_IP_ADDRESS_REASON,
};

use crate::error::ControllerError;
use crate::reconciler::claims::{reconcile_address_claims, release_address_claims};
use crate::test_utils::{pooled_vm, InMemoryClaimStore};

fn claimed(vm: &crds::VirtualMachine) -> crds::Condition {
    get_condition(
        &vm.status.as_ref().expect("status").conditions,
        IP_ADDRESS_CLAIMED_CONDITION,
    )
    .expect("IPAddressClaimed condition")
    .clone()
}

#[tokio::test]
async fn creates_one_claim_per_pool_reference() {
    let mut vm = pooled_vm("worker-1", 2);
    let store = InMemoryClaimStore::new();

    reconcile_address_claims(&mut vm, &store)
        .await
        .expect("reconcile");

    assert_eq!(store.len(), 2);
    let claim = store.get_sync("worker-1-0-0").expect("first claim");
    assert_eq!(claim.spec.pool_ref.name, "pool-0");
    assert!(claim
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.contains(&ADDRESS_CLAIM_FINALIZER.to_string())));
    let owner = &claim.metadata.owner_references.as_ref().expect("owner")[0];
    assert_eq!(owner.kind, "VirtualMachine");
    assert_eq!(owner.name, "worker-1");
    assert_eq!(owner.controller, Some(true));

    let condition = claimed(&vm);
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(
        condition.reason.as_deref(),
        Some(CLAIMS_BEING_CREATED_REASON)
    );
    assert_eq!(
        condition.message.as_deref(),
        Some("2/2 claims being created")
    );
}

#[tokio::test]
async fn second_pass_is_idempotent_and_reports_waiting() {
    let mut vm = pooled_vm("worker-1", 2);
    let store = InMemoryClaimStore::new();

    reconcile_address_claims(&mut vm, &store)
        .await
        .expect("first pass");
    reconcile_address_claims(&mut vm, &store)
        .await
        .expect("second pass");

    assert_eq!(store.len(), 2);
    let condition = claimed(&vm);
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(
        condition.reason.as_deref(),
        Some(WAITING_FOR_IP_ADDRESS_REASON)
    );
    assert_eq!(
        condition.message.as_deref(),
        Some("2/2 claims being processed")
    );
}

#[tokio::test]
async fn fulfilled_claims_mark_the_condition_true() {
    let mut vm = pooled_vm("worker-1", 2);
    let store = InMemoryClaimStore::new();
    reconcile_address_claims(&mut vm, &store)
        .await
        .expect("create");

    store.fulfill("worker-1-0-0", "addr-0");
    store.fulfill("worker-1-0-1", "addr-1");
    reconcile_address_claims(&mut vm, &store)
        .await
        .expect("resolve");

    assert!(is_true(
        &vm.status.as_ref().unwrap().conditions,
        IP_ADDRESS_CLAIMED_CONDITION
    ));
}

#[tokio::test]
async fn precise_aggregate_when_all_claims_carry_ready() {
    let mut vm = pooled_vm("worker-1", 2);
    let store = InMemoryClaimStore::new();
    reconcile_address_claims(&mut vm, &store)
        .await
        .expect("create");

    store.set_ready_condition("worker-1-0-0", true);
    store.set_ready_condition("worker-1-0-1", false);
    reconcile_address_claims(&mut vm, &store)
        .await
        .expect("aggregate");

    let condition = claimed(&vm);
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(condition.message.as_deref(), Some("1 of 2 completed"));

    store.set_ready_condition("worker-1-0-1", true);
    reconcile_address_claims(&mut vm, &store)
        .await
        .expect("aggregate");
    let condition = claimed(&vm);
    assert_eq!(condition.status, ConditionStatus::True);
    assert_eq!(condition.message.as_deref(), Some("2 of 2 completed"));
}

#[tokio::test]
async fn one_bad_claim_does_not_starve_the_others() {
    let mut vm = pooled_vm("worker-1", 2);
    let store = InMemoryClaimStore::new();
    store.fail_create("worker-1-0-0");

    let err = reconcile_address_claims(&mut vm, &store)
        .await
        .expect_err("must fail");

    match err {
        ControllerError::ClaimAggregate(errors) => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].starts_with("worker-1-0-0"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // The second claim was still created.
    assert!(store.get_sync("worker-1-0-1").is_some());

    let condition = claimed(&vm);
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(
        condition.reason.as_deref(),
        Some(CLAIM_CREATION_FAILED_REASON)
    );
}

#[tokio::test]
async fn vm_without_pools_creates_nothing() {
    let mut vm = crate::test_utils::base_vm("worker-1");
    let store = InMemoryClaimStore::new();

    reconcile_address_claims(&mut vm, &store)
        .await
        .expect("reconcile");

    assert_eq!(store.len(), 0);
    assert!(vm
        .status
        .as_ref()
        .is_none_or(|s| get_condition(&s.conditions, IP_ADDRESS_CLAIMED_CONDITION).is_none()));
}

#[tokio::test]
async fn cluster_label_is_copied_onto_claims() {
    let mut vm = pooled_vm("worker-1", 1);
    vm.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(CLUSTER_NAME_LABEL.to_string(), "cluster-a".to_string());
    let store = InMemoryClaimStore::new();

    reconcile_address_claims(&mut vm, &store)
        .await
        .expect("reconcile");

    let claim = store.get_sync("worker-1-0-0").expect("claim");
    assert_eq!(
        claim.labels().get(CLUSTER_NAME_LABEL).map(String::as_str),
        Some("cluster-a")
    );
}

#[tokio::test]
async fn release_skips_missing_claims_and_clears_finalizers() {
    let vm = pooled_vm("worker-1", 2);
    let store = InMemoryClaimStore::new();

    let mut claim = crate::test_utils::base_claim("worker-1-0-1");
    claim.metadata.finalizers = Some(vec![
        ADDRESS_CLAIM_FINALIZER.to_string(),
        "other.io/keep".to_string(),
    ]);
    store.insert(claim);

    release_address_claims(&vm, &store)
        .await
        .expect("release");

    let claim = store.get_sync("worker-1-0-1").expect("claim");
    assert_eq!(
        claim.metadata.finalizers.as_deref(),
        Some(["other.io/keep".to_string()].as_slice())
    );
}
