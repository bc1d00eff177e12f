//! Quota resolution integration tests.

mod common;

use common::TestHarness;
use quota_ledger_core::{AuthData, LedgerError, QuotaQuery};
use quota_ledger_store::Store;

#[test]
fn most_specific_quota_wins() {
    let harness = TestHarness::new();
    harness.quota(&harness.instances, &AuthData::new(), Some(10));
    harness.quota(
        &harness.instances,
        &AuthData::new().with("project_id", "T1"),
        Some(5),
    );

    let tx = harness.store.begin().unwrap();
    let in_t1 = harness
        .ledger
        .resolve_quota(&tx, &harness.instances, &TestHarness::user("U1", "T1"))
        .unwrap();
    let in_t2 = harness
        .ledger
        .resolve_quota(&tx, &harness.instances, &TestHarness::user("U1", "T2"))
        .unwrap();

    assert_eq!(in_t1.and_then(|q| q.limit), Some(5));
    assert_eq!(in_t2.and_then(|q| q.limit), Some(10));
}

#[test]
fn user_quota_beats_project_quota() {
    let harness = TestHarness::new();
    harness.quota(
        &harness.instances,
        &AuthData::new().with("project_id", "T1"),
        Some(5),
    );
    harness.quota(&harness.instances, &TestHarness::user("U1", "T1"), Some(2));

    let tx = harness.store.begin().unwrap();
    let quota = harness
        .ledger
        .resolve_quota(&tx, &harness.instances, &TestHarness::user("U1", "T1"))
        .unwrap();
    assert_eq!(quota.and_then(|q| q.limit), Some(2));

    let other_user = harness
        .ledger
        .resolve_quota(&tx, &harness.instances, &TestHarness::user("U2", "T1"))
        .unwrap();
    assert_eq!(other_user.and_then(|q| q.limit), Some(5));
}

#[test]
fn incomplete_field_sets_are_skipped() {
    let harness = TestHarness::new();
    harness.quota(&harness.instances, &AuthData::new(), Some(10));

    // No project_id: both specific field sets are skipped.
    let tx = harness.store.begin().unwrap();
    let quota = harness
        .ledger
        .resolve_quota(
            &tx,
            &harness.instances,
            &AuthData::new().with("user_id", "U1"),
        )
        .unwrap();
    assert_eq!(quota.and_then(|q| q.limit), Some(10));
}

#[test]
fn no_quota_means_unlimited() {
    let harness = TestHarness::new();
    let tx = harness.store.begin().unwrap();
    let quota = harness
        .ledger
        .resolve_quota(&tx, &harness.instances, &TestHarness::user("U1", "T1"))
        .unwrap();
    assert!(quota.is_none());
}

#[test]
fn quota_auth_data_is_restricted_to_service_fields() {
    let harness = TestHarness::new();
    let quota = harness.quota(
        &harness.instances,
        &AuthData::new().with("project_id", "T1").with("region", "eu"),
        Some(3),
    );
    assert_eq!(quota.auth_data, AuthData::new().with("project_id", "T1"));

    let tx = harness.store.begin().unwrap();
    let found = harness
        .ledger
        .get_quota(
            &tx,
            &QuotaQuery::by_auth_data(&harness.instances, quota.auth_data.clone()),
        )
        .unwrap();
    assert_eq!(found, quota);
}

#[test]
fn duplicate_quota_is_rejected() {
    let harness = TestHarness::new();
    let first = harness.quota(&harness.instances, &AuthData::new(), Some(10));

    let result = harness.store.transaction(|tx| {
        harness
            .ledger
            .create_quota(tx, &harness.instances, &AuthData::new(), Some(20))
    });
    match result {
        Err(LedgerError::Duplicate { entity, existing }) => {
            assert_eq!(entity, "quota");
            assert_eq!(existing, first.id.to_string());
        }
        other => panic!("expected duplicate, got {other:?}"),
    }
}

#[test]
fn get_quotas_filters_by_auth_subset() {
    let harness = TestHarness::new();
    harness.quota(&harness.instances, &AuthData::new(), Some(10));
    harness.quota(
        &harness.instances,
        &AuthData::new().with("project_id", "T1"),
        Some(5),
    );
    harness.quota(&harness.instances, &TestHarness::user("U1", "T1"), Some(2));
    harness.quota(&harness.cores, &AuthData::new(), Some(64));

    let tx = harness.store.begin().unwrap();
    let in_t1 = harness
        .ledger
        .get_quotas(
            &tx,
            Some(harness.instances.id),
            Some(&AuthData::new().with("project_id", "T1")),
        )
        .unwrap();
    assert_eq!(in_t1.len(), 2);

    let all = harness.ledger.get_quotas(&tx, None, None).unwrap();
    assert_eq!(all.len(), 4);
}

#[test]
fn set_quota_limit_updates_resolution() {
    let harness = TestHarness::new();
    let quota = harness.quota(&harness.instances, &AuthData::new(), Some(10));

    let updated = harness
        .store
        .transaction(|tx| harness.ledger.set_quota_limit(tx, &quota, None))
        .unwrap();
    assert_eq!(updated.limit, None);

    let tx = harness.store.begin().unwrap();
    let resolved = harness
        .ledger
        .resolve_quota(&tx, &harness.instances, &TestHarness::user("U1", "T1"))
        .unwrap()
        .unwrap();
    assert_eq!(resolved.id, quota.id);
    assert_eq!(resolved.limit, None);
}

#[test]
fn check_absolute_compares_amount_with_limit() {
    let harness = TestHarness::new();
    harness.quota(&harness.ram_size, &AuthData::new(), Some(4096));
    let user = TestHarness::user("U1", "T1");

    let tx = harness.store.begin().unwrap();
    assert!(harness
        .ledger
        .check_absolute(&tx, &harness.ram_size, &user, 4096)
        .is_ok());

    match harness
        .ledger
        .check_absolute(&tx, &harness.ram_size, &user, 8192)
    {
        Err(LedgerError::OverQuota { overages }) => {
            assert_eq!(overages.len(), 1);
            assert_eq!(overages[0].limit, 4096);
            assert_eq!(overages[0].consumed, 0);
            assert_eq!(overages[0].excess(), 4096);
        }
        other => panic!("expected over quota, got {other:?}"),
    }

    assert!(matches!(
        harness
            .ledger
            .check_absolute(&tx, &harness.instances, &user, 1),
        Err(LedgerError::InvalidArguments(_))
    ));
}
