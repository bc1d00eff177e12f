//! Usage row and refresh integration tests.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::TestHarness;
use quota_ledger_core::{
    AuthData, LedgerError, ParamData, ReservationRequest, UsageId, UsageQuery,
};
use quota_ledger_service::{LedgerConfig, NewUsage, RefreshTicket, Refresher, UsageCounter};
use quota_ledger_store::Store;

// ============================================================================
// Usage Rows
// ============================================================================

#[test]
fn usage_rows_are_unique_per_fingerprint() {
    let harness = TestHarness::new();
    let first = harness
        .store
        .transaction(|tx| {
            harness.ledger.create_usage(
                tx,
                NewUsage::new(&harness.instances, ParamData::new(), TestHarness::user("U1", "T1"))
                    .used(3),
            )
        })
        .unwrap();
    assert_eq!(first.used, 3);
    assert_eq!(first.auth_data, AuthData::new().with("project_id", "T1"));

    // Another user of the same project shares the row.
    let result = harness.store.transaction(|tx| {
        harness.ledger.create_usage(
            tx,
            NewUsage::new(&harness.instances, ParamData::new(), TestHarness::user("U2", "T1")),
        )
    });
    match result {
        Err(LedgerError::Duplicate { entity, existing }) => {
            assert_eq!(entity, "usage");
            assert_eq!(existing, first.id.to_string());
        }
        other => panic!("expected duplicate, got {other:?}"),
    }
}

#[test]
fn absolute_resources_reject_usage_rows() {
    let harness = TestHarness::new();
    let result = harness.store.transaction(|tx| {
        harness.ledger.create_usage(
            tx,
            NewUsage::new(&harness.ram_size, ParamData::new(), TestHarness::user("U1", "T1")),
        )
    });
    assert!(matches!(result, Err(LedgerError::InvalidArguments(_))));
}

#[test]
fn usage_requires_parameter_and_auth_fields() {
    let harness = TestHarness::new();

    let no_flavor = harness.store.transaction(|tx| {
        harness.ledger.create_usage(
            tx,
            NewUsage::new(&harness.cores, ParamData::new(), TestHarness::user("U1", "T1")),
        )
    });
    assert!(matches!(no_flavor, Err(LedgerError::InvalidArguments(msg)) if msg.contains("flavor")));

    let no_project = harness.store.transaction(|tx| {
        harness.ledger.create_usage(
            tx,
            NewUsage::new(
                &harness.instances,
                ParamData::new(),
                AuthData::new().with("user_id", "U1"),
            ),
        )
    });
    assert!(
        matches!(no_project, Err(LedgerError::InvalidArguments(msg)) if msg.contains("project_id"))
    );
}

#[test]
fn usage_for_creates_once() {
    let harness = TestHarness::new();
    let flavor = ParamData::new().with("flavor", "m1").with("zone", "a");
    let first = harness.usage_with(&harness.cores, &flavor, &TestHarness::user("U1", "T1"));
    let again = harness.usage_with(&harness.cores, &flavor, &TestHarness::user("U2", "T1"));
    assert_eq!(first.id, again.id);
    assert_eq!(first.parameter_data, ParamData::new().with("flavor", "m1"));

    let tx = harness.store.begin().unwrap();
    let by_fingerprint = harness
        .ledger
        .get_usage(
            &tx,
            &UsageQuery::by_fingerprint(&harness.cores, flavor, TestHarness::user("U3", "T1")),
        )
        .unwrap();
    assert_eq!(by_fingerprint.id, first.id);
}

#[test]
fn get_usage_of_unknown_fingerprint_is_not_found() {
    let harness = TestHarness::new();
    let tx = harness.store.begin().unwrap();
    let result = harness.ledger.get_usage(
        &tx,
        &UsageQuery::by_fingerprint(
            &harness.instances,
            ParamData::new(),
            TestHarness::user("U1", "T9"),
        ),
    );
    assert!(matches!(result, Err(LedgerError::NotFound { entity: "usage", .. })));
}

#[test]
fn get_usages_filters_by_data_subset() {
    let harness = TestHarness::new();
    let m1 = ParamData::new().with("flavor", "m1");
    let m2 = ParamData::new().with("flavor", "m2");
    harness.usage_with(&harness.cores, &m1, &TestHarness::user("U1", "T1"));
    harness.usage_with(&harness.cores, &m2, &TestHarness::user("U1", "T1"));
    harness.usage_with(&harness.cores, &m1, &TestHarness::user("U1", "T2"));
    harness.usage(&harness.instances, &TestHarness::user("U1", "T1"));

    let tx = harness.store.begin().unwrap();
    let cores = harness
        .ledger
        .get_usages(&tx, Some(harness.cores.id), None, None)
        .unwrap();
    assert_eq!(cores.len(), 3);

    let m1_rows = harness
        .ledger
        .get_usages(&tx, Some(harness.cores.id), Some(&m1), None)
        .unwrap();
    assert_eq!(m1_rows.len(), 2);

    let t1 = AuthData::new().with("project_id", "T1");
    let t1_rows = harness.ledger.get_usages(&tx, None, None, Some(&t1)).unwrap();
    assert_eq!(t1_rows.len(), 3);
}

// ============================================================================
// Refresh Protocol
// ============================================================================

#[test]
fn refresh_falls_due_after_interval() {
    let harness = TestHarness::with_config(LedgerConfig {
        refresh_interval: 2,
        ..LedgerConfig::default()
    });
    let request = ReservationRequest::new(&harness.service, TestHarness::user("U1", "T1"))
        .with_delta(&harness.instances, ParamData::new(), 1);

    let first = harness
        .store
        .transaction(|tx| harness.ledger.reserve_request(tx, &request))
        .unwrap();
    assert!(first.refresh_due.is_empty());

    let second = harness
        .store
        .transaction(|tx| harness.ledger.reserve_request(tx, &request))
        .unwrap();
    assert_eq!(second.refresh_due, vec![second.items[0].usage_id]);
    assert_eq!(harness.usage_row(second.items[0].usage_id).until_refresh, 0);
}

#[test]
fn reserve_reports_when_refresh_falls_due() {
    let harness = TestHarness::with_config(LedgerConfig {
        refresh_interval: 2,
        ..LedgerConfig::default()
    });
    let user = TestHarness::user("U1", "T1");
    let usage = harness.usage(&harness.instances, &user);
    let reservation = harness.reservation();

    let reserve = || {
        harness
            .store
            .transaction(|tx| {
                harness.ledger.reserve(
                    tx,
                    &reservation,
                    &harness.instances,
                    Some(usage.id),
                    &user,
                    1,
                )
            })
            .unwrap()
            .expect("tracked resources record an item")
    };

    let first = reserve();
    assert!(!first.refresh_due);
    assert_eq!(first.item.usage_id, usage.id);

    let second = reserve();
    assert!(second.refresh_due);
    assert_eq!(harness.usage_row(usage.id).until_refresh, 0);
}

#[test]
fn only_the_latest_refresh_completes() {
    let harness = TestHarness::with_config(LedgerConfig {
        refresh_interval: 5,
        ..LedgerConfig::default()
    });
    let usage = harness.usage(&harness.instances, &TestHarness::user("U1", "T1"));

    let t1 = harness
        .store
        .transaction(|tx| harness.ledger.begin_refresh(tx, &usage))
        .unwrap();
    let t2 = harness
        .store
        .transaction(|tx| harness.ledger.begin_refresh(tx, &usage))
        .unwrap();
    assert_ne!(t1.refresh_id, t2.refresh_id);

    let stale = harness
        .store
        .transaction(|tx| harness.ledger.complete_refresh(tx, &t1, 99));
    assert!(matches!(stale, Err(LedgerError::StaleRefresh { .. })));
    assert_eq!(harness.usage_row(usage.id).used, 0);

    let refreshed = harness
        .store
        .transaction(|tx| harness.ledger.complete_refresh(tx, &t2, 7))
        .unwrap();
    assert_eq!(refreshed.used, 7);
    assert_eq!(refreshed.until_refresh, 5);
    assert_eq!(refreshed.refresh_id, None);

    let repeated = harness
        .store
        .transaction(|tx| harness.ledger.complete_refresh(tx, &t2, 8));
    assert!(matches!(repeated, Err(LedgerError::StaleRefresh { .. })));
    assert_eq!(harness.usage_row(usage.id).used, 7);
}

// ============================================================================
// Refresher
// ============================================================================

/// Counter answering from a fixed table.
struct FixedCounter {
    counts: Mutex<HashMap<UsageId, i64>>,
}

#[async_trait]
impl UsageCounter for FixedCounter {
    async fn count(&self, ticket: &RefreshTicket) -> quota_ledger_core::Result<i64> {
        self.counts
            .lock()
            .unwrap()
            .get(&ticket.usage_id)
            .copied()
            .ok_or_else(|| LedgerError::not_found("count", ticket.usage_id))
    }
}

#[tokio::test]
async fn refresher_writes_counts_back() {
    let harness = TestHarness::new();
    let t1 = harness.usage(&harness.instances, &TestHarness::user("U1", "T1"));
    let t2 = harness.usage(&harness.instances, &TestHarness::user("U1", "T2"));
    let unknown = harness.usage(&harness.instances, &TestHarness::user("U1", "T3"));

    let counter = Arc::new(FixedCounter {
        counts: Mutex::new(HashMap::from([(t1.id, 4), (t2.id, 9)])),
    });
    let refresher = Refresher::new(
        Arc::clone(&harness.store),
        harness.ledger.clone(),
        counter,
    );

    let results = refresher.refresh_all([t1.id, t2.id, unknown.id]).await;
    assert_eq!(results.len(), 3);
    assert_eq!(results.iter().filter(|(_, r)| r.is_ok()).count(), 2);

    assert_eq!(harness.usage_row(t1.id).used, 4);
    assert_eq!(harness.usage_row(t2.id).used, 9);

    // A failed count leaves its token in place.
    let untouched = harness.usage_row(unknown.id);
    assert_eq!(untouched.used, 0);
    assert!(untouched.is_refreshing());
}
