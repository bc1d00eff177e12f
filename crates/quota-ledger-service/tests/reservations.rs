//! Reservation lifecycle integration tests.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use common::TestHarness;
use quota_ledger_core::{
    AuthData, FieldSet, LedgerError, ParamData, ReservationRequest, ReservationStatus,
};
use quota_ledger_service::{LedgerConfig, Sweeper};
use quota_ledger_store::{KvTransaction, Store, Tables};

// ============================================================================
// Commit and Rollback
// ============================================================================

#[test]
fn commit_moves_reserved_into_used() {
    let harness = TestHarness::new();
    let user = TestHarness::user("U1", "T1");
    let usage = harness.usage(&harness.instances, &user);
    let reservation = harness.reservation();

    harness.reserve(&reservation, &usage, &user, 3).unwrap();
    harness.reserve(&reservation, &usage, &user, 2).unwrap();
    let row = harness.usage_row(usage.id);
    assert_eq!((row.used, row.reserved), (0, 5));

    let committed = harness
        .store
        .transaction(|tx| harness.ledger.commit(tx, &reservation))
        .unwrap();
    assert_eq!(committed.status, ReservationStatus::Committed);

    let row = harness.usage_row(usage.id);
    assert_eq!((row.used, row.reserved), (5, 0));
}

#[test]
fn rollback_releases_reserved() {
    let harness = TestHarness::new();
    let user = TestHarness::user("U1", "T1");
    let usage = harness.usage(&harness.instances, &user);
    let reservation = harness.reservation();

    harness.reserve(&reservation, &usage, &user, 4).unwrap();
    let rolled_back = harness
        .store
        .transaction(|tx| harness.ledger.rollback(tx, &reservation))
        .unwrap();
    assert_eq!(rolled_back.status, ReservationStatus::RolledBack);

    let row = harness.usage_row(usage.id);
    assert_eq!((row.used, row.reserved), (0, 0));
}

#[test]
fn finished_reservations_reject_transitions() {
    let harness = TestHarness::new();
    let reservation = harness.reservation();
    harness
        .store
        .transaction(|tx| harness.ledger.commit(tx, &reservation))
        .unwrap();

    let again = harness
        .store
        .transaction(|tx| harness.ledger.rollback(tx, &reservation));
    assert!(matches!(
        again,
        Err(LedgerError::InvalidState {
            status: ReservationStatus::Committed,
            ..
        })
    ));

    let user = TestHarness::user("U1", "T1");
    let usage = harness.usage(&harness.instances, &user);
    assert!(matches!(
        harness.reserve(&reservation, &usage, &user, 1),
        Err(LedgerError::InvalidState { .. })
    ));
}

#[test]
fn reserved_items_are_listed() {
    let harness = TestHarness::new();
    let user = TestHarness::user("U1", "T1");
    let usage = harness.usage(&harness.instances, &user);
    let reservation = harness.reservation();
    harness.reserve(&reservation, &usage, &user, 1).unwrap();
    harness.reserve(&reservation, &usage, &user, -1).unwrap();

    let tx = harness.store.begin().unwrap();
    let items = harness
        .ledger
        .get_reserved_items(&tx, &reservation)
        .unwrap();
    let mut deltas: Vec<_> = items.iter().map(|i| i.delta).collect();
    deltas.sort_unstable();
    assert_eq!(deltas, [-1, 1]);
    assert!(items.iter().all(|i| i.usage_id == usage.id));
}

// ============================================================================
// Quota Enforcement
// ============================================================================

#[test]
fn over_quota_changes_nothing() {
    let harness = TestHarness::new();
    harness.quota(&harness.instances, &AuthData::new(), Some(10));
    let user = TestHarness::user("U1", "T1");
    let usage = harness.usage(&harness.instances, &user);
    let reservation = harness.reservation();

    harness.reserve(&reservation, &usage, &user, 8).unwrap();
    match harness.reserve(&reservation, &usage, &user, 3) {
        Err(LedgerError::OverQuota { overages }) => {
            assert_eq!(overages.len(), 1);
            assert_eq!(overages[0].resource_id, harness.instances.id);
            assert_eq!(overages[0].limit, 10);
            assert_eq!(overages[0].consumed, 8);
            assert_eq!(overages[0].requested, 3);
        }
        other => panic!("expected over quota, got {other:?}"),
    }

    assert_eq!(harness.usage_row(usage.id).reserved, 8);
    let tx = harness.store.begin().unwrap();
    assert_eq!(
        harness
            .ledger
            .get_reserved_items(&tx, &reservation)
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn releases_are_admitted_over_quota() {
    let harness = TestHarness::new();
    let quota = harness.quota(&harness.instances, &AuthData::new(), Some(10));
    let user = TestHarness::user("U1", "T1");
    let usage = harness.usage(&harness.instances, &user);
    let reservation = harness.reservation();
    harness.reserve(&reservation, &usage, &user, 10).unwrap();
    harness
        .store
        .transaction(|tx| harness.ledger.commit(tx, &reservation))
        .unwrap();

    harness
        .store
        .transaction(|tx| harness.ledger.set_quota_limit(tx, &quota, Some(2)))
        .unwrap();
    let release = harness.reservation();
    harness.reserve(&release, &usage, &user, -4).unwrap();
    harness
        .store
        .transaction(|tx| harness.ledger.commit(tx, &release))
        .unwrap();

    assert_eq!(harness.usage_row(usage.id).used, 6);
}

#[test]
fn commit_rechecks_lowered_quota() {
    let harness = TestHarness::new();
    let quota = harness.quota(&harness.instances, &AuthData::new(), Some(10));
    let user = TestHarness::user("U1", "T1");
    let usage = harness.usage(&harness.instances, &user);
    let reservation = harness.reservation();
    harness.reserve(&reservation, &usage, &user, 8).unwrap();

    harness
        .store
        .transaction(|tx| harness.ledger.set_quota_limit(tx, &quota, Some(5)))
        .unwrap();

    let result = harness
        .store
        .transaction(|tx| harness.ledger.commit(tx, &reservation));
    match result {
        Err(LedgerError::OverQuota { overages }) => {
            assert_eq!(overages[0].limit, 5);
            assert_eq!(overages[0].requested, 8);
        }
        other => panic!("expected over quota, got {other:?}"),
    }

    let tx = harness.store.begin().unwrap();
    assert_eq!(
        harness.ledger.get_reservation(&tx, &reservation).unwrap().status,
        ReservationStatus::Pending
    );
    drop(tx);
    let row = harness.usage_row(usage.id);
    assert_eq!((row.used, row.reserved), (0, 8));
}

#[test]
fn usage_must_match_resource() {
    let harness = TestHarness::new();
    let user = TestHarness::user("U1", "T1");
    let usage = harness.usage(&harness.instances, &user);
    let reservation = harness.reservation();

    let result = harness.store.transaction(|tx| {
        harness.ledger.reserve(
            tx,
            &reservation,
            &harness.cores,
            Some(usage.id),
            &user,
            1,
        )
    });
    assert!(matches!(result, Err(LedgerError::InvalidArguments(_))));
}

#[test]
fn usage_must_belong_to_the_auth_data() {
    let harness = TestHarness::new();
    harness.quota(&harness.instances, &AuthData::new().with("project_id", "T1"), Some(5));
    harness.quota(&harness.instances, &AuthData::new().with("project_id", "T2"), Some(100));
    let owner = TestHarness::user("U1", "T1");
    let usage = harness.usage(&harness.instances, &owner);
    let reservation = harness.reservation();

    // T2's larger quota must not be spent on T1's row.
    let other = TestHarness::user("U2", "T2");
    let result = harness.store.transaction(|tx| {
        harness.ledger.reserve(
            tx,
            &reservation,
            &harness.instances,
            Some(usage.id),
            &other,
            50,
        )
    });
    assert!(matches!(result, Err(LedgerError::InvalidArguments(_))));
    assert_eq!(harness.usage_row(usage.id).reserved, 0);

    // Another user of the same project shares the row.
    let teammate = TestHarness::user("U2", "T1");
    harness.reserve(&reservation, &usage, &teammate, 5).unwrap();
    assert_eq!(harness.usage_row(usage.id).reserved, 5);
}

#[test]
fn counters_refuse_to_overflow() {
    let harness = TestHarness::new();
    let user = TestHarness::user("U1", "T1");
    let usage = harness.usage(&harness.instances, &user);
    let reservation = harness.reservation();

    harness.reserve(&reservation, &usage, &user, i64::MAX).unwrap();
    assert!(matches!(
        harness.reserve(&reservation, &usage, &user, 1),
        Err(LedgerError::InvalidArguments(_))
    ));
    assert_eq!(harness.usage_row(usage.id).reserved, i64::MAX);

    let request = ReservationRequest::new(&harness.service, user)
        .with_delta(&harness.instances, ParamData::new(), 1);
    let result = harness
        .store
        .transaction(|tx| harness.ledger.reserve_request(tx, &request));
    assert!(matches!(result, Err(LedgerError::InvalidArguments(_))));
    assert_eq!(harness.usage_row(usage.id).reserved, i64::MAX);
}

// ============================================================================
// Absolute Resources
// ============================================================================

#[test]
fn absolute_resources_keep_no_usage() {
    let harness = TestHarness::new();
    harness.quota(&harness.ram_size, &AuthData::new(), Some(4096));
    let user = TestHarness::user("U1", "T1");
    let reservation = harness.reservation();

    let item = harness
        .store
        .transaction(|tx| {
            harness
                .ledger
                .reserve(tx, &reservation, &harness.ram_size, None, &user, 2048)
        })
        .unwrap();
    assert!(item.is_none());

    let over = harness.store.transaction(|tx| {
        harness
            .ledger
            .reserve(tx, &reservation, &harness.ram_size, None, &user, 8192)
    });
    assert!(matches!(over, Err(LedgerError::OverQuota { .. })));

    let tx = harness.store.begin().unwrap();
    assert!(harness
        .ledger
        .get_usages(&tx, Some(harness.ram_size.id), None, None)
        .unwrap()
        .is_empty());
    assert!(harness
        .ledger
        .get_reserved_items(&tx, &reservation)
        .unwrap()
        .is_empty());
}

// ============================================================================
// Expiry
// ============================================================================

#[test]
fn expiry_rolls_back_once() {
    let harness = TestHarness::new();
    let user = TestHarness::user("U1", "T1");
    let usage = harness.usage(&harness.instances, &user);
    let now = Utc::now();

    let (stale, fresh) = harness
        .store
        .transaction(|tx| {
            let stale = harness
                .ledger
                .create_reservation(tx, now + Duration::hours(1))?;
            let fresh = harness
                .ledger
                .create_reservation(tx, now + Duration::hours(3))?;
            Ok::<_, LedgerError>((stale, fresh))
        })
        .unwrap();
    harness.reserve(&stale, &usage, &user, 3).unwrap();
    harness.reserve(&fresh, &usage, &user, 2).unwrap();

    let later = now + Duration::hours(2);
    let expired = harness
        .store
        .transaction(|tx| harness.ledger.expire_reservations(tx, later))
        .unwrap();
    assert_eq!(expired, vec![stale.id]);
    assert_eq!(harness.usage_row(usage.id).reserved, 2);

    let again = harness
        .store
        .transaction(|tx| harness.ledger.expire_reservations(tx, later))
        .unwrap();
    assert!(again.is_empty());
    assert_eq!(harness.usage_row(usage.id).reserved, 2);

    let tx = harness.store.begin().unwrap();
    assert_eq!(
        harness.ledger.get_reservation(&tx, &stale).unwrap().status,
        ReservationStatus::RolledBack
    );
    assert_eq!(
        harness.ledger.get_reservation(&tx, &fresh).unwrap().status,
        ReservationStatus::Pending
    );
}

#[test]
fn committed_reservations_never_expire() {
    let harness = TestHarness::new();
    let now = Utc::now();
    let reservation = harness
        .store
        .transaction(|tx| {
            harness
                .ledger
                .create_reservation(tx, now + Duration::seconds(1))
        })
        .unwrap();
    harness
        .store
        .transaction(|tx| harness.ledger.commit(tx, &reservation))
        .unwrap();

    let expired = harness
        .store
        .transaction(|tx| {
            harness
                .ledger
                .expire_reservations(tx, now + Duration::hours(1))
        })
        .unwrap();
    assert!(expired.is_empty());
}

#[test]
fn expired_reservations_can_only_roll_back() {
    let harness = TestHarness::new();
    let user = TestHarness::user("U1", "T1");
    let usage = harness.usage(&harness.instances, &user);
    let reservation = harness
        .store
        .transaction(|tx| {
            harness
                .ledger
                .create_reservation(tx, Utc::now() + Duration::milliseconds(200))
        })
        .unwrap();
    harness.reserve(&reservation, &usage, &user, 2).unwrap();
    thread::sleep(StdDuration::from_millis(300));

    let commit = harness
        .store
        .transaction(|tx| harness.ledger.commit(tx, &reservation));
    assert!(matches!(commit, Err(LedgerError::Expired { .. })));
    assert!(matches!(
        harness.reserve(&reservation, &usage, &user, 1),
        Err(LedgerError::Expired { .. })
    ));
    assert_eq!(harness.usage_row(usage.id).reserved, 2);

    harness
        .store
        .transaction(|tx| harness.ledger.rollback(tx, &reservation))
        .unwrap();
    let row = harness.usage_row(usage.id);
    assert_eq!((row.used, row.reserved), (0, 0));
}

#[test]
fn sweep_skips_reservations_locked_elsewhere() {
    let harness = TestHarness::with_config(LedgerConfig {
        lock_timeout_ms: 50,
        ..LedgerConfig::default()
    });
    let past = Utc::now() - Duration::seconds(1);
    let (held, free) = harness
        .store
        .transaction(|tx| {
            let held = harness.ledger.create_reservation(tx, past)?;
            let free = harness.ledger.create_reservation(tx, past)?;
            Ok::<_, LedgerError>((held, free))
        })
        .unwrap();

    let mut holder = harness.store.begin().unwrap();
    holder.reservation_for_update(&held.id).unwrap();

    let sweeper = Sweeper::new(Arc::clone(&harness.store), harness.ledger.clone());
    assert_eq!(sweeper.sweep_once().unwrap(), vec![free.id]);

    let tx = harness.store.begin().unwrap();
    assert_eq!(
        harness.ledger.get_reservation(&tx, &held).unwrap().status,
        ReservationStatus::Pending
    );
    assert_eq!(
        harness.ledger.get_reservation(&tx, &free).unwrap().status,
        ReservationStatus::RolledBack
    );
    drop(tx);

    holder.rollback().unwrap();
    assert_eq!(sweeper.sweep_once().unwrap(), vec![held.id]);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn concurrent_reserves_linearize() {
    let harness = Arc::new(TestHarness::new());
    harness.quota(&harness.instances, &AuthData::new(), Some(10));
    let user = TestHarness::user("U1", "T1");
    let usage = harness.usage(&harness.instances, &user);

    let barrier = Arc::new(Barrier::new(2));
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let harness = Arc::clone(&harness);
            let barrier = Arc::clone(&barrier);
            let usage = usage.clone();
            let user = user.clone();
            thread::spawn(move || {
                barrier.wait();
                harness.store.transaction(|tx| {
                    let reservation = harness
                        .ledger
                        .create_reservation(tx, harness.ledger.default_expiry())?;
                    harness.ledger.reserve(
                        tx,
                        &reservation,
                        &harness.instances,
                        Some(usage.id),
                        &user,
                        6,
                    )
                })
            })
        })
        .collect();

    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    let granted = results.iter().filter(|r| r.is_ok()).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::OverQuota { .. })))
        .count();
    assert_eq!((granted, refused), (1, 1));
    assert_eq!(harness.usage_row(usage.id).reserved, 6);
}

#[test]
fn concurrent_creates_yield_one_row() {
    let harness = Arc::new(TestHarness::new());
    let barrier = Arc::new(Barrier::new(4));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let harness = Arc::clone(&harness);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                harness
                    .store
                    .transaction(|tx| harness.ledger.create_service(tx, "images", FieldSet::new()))
            })
        })
        .collect();

    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::Duplicate { .. })))
            .count(),
        3
    );
}

// ============================================================================
// Reservation Requests
// ============================================================================

#[test]
fn request_reserves_every_resource() {
    let harness = TestHarness::new();
    harness.quota(&harness.instances, &AuthData::new(), Some(10));
    harness.quota(&harness.ram_size, &AuthData::new(), Some(4096));

    let request = ReservationRequest::new(&harness.service, TestHarness::user("U1", "T1"))
        .with_delta(&harness.instances, ParamData::new(), 2)
        .with_delta(&harness.cores, ParamData::new().with("flavor", "m1"), 4)
        .with_delta(&harness.ram_size, ParamData::new(), 2048);

    let receipt = harness
        .store
        .transaction(|tx| harness.ledger.reserve_request(tx, &request))
        .unwrap();
    assert_eq!(receipt.reservation.status, ReservationStatus::Pending);
    assert_eq!(receipt.items.len(), 2);
    assert!(receipt.refresh_due.is_empty());

    let json = serde_json::to_value(&receipt).unwrap();
    assert_eq!(json["items"].as_array().map(Vec::len), Some(2));
    assert_eq!(json["reservation"]["status"], "pending");

    // Usage is counted per project, whatever the user.
    let tx = harness.store.begin().unwrap();
    let usages = harness
        .ledger
        .get_usages(
            &tx,
            Some(harness.cores.id),
            Some(&ParamData::new().with("flavor", "m1")),
            Some(&AuthData::new().with("project_id", "T1")),
        )
        .unwrap();
    assert_eq!(usages.len(), 1);
    assert_eq!(usages[0].reserved, 4);
    assert_eq!(usages[0].auth_data, AuthData::new().with("project_id", "T1"));
}

#[test]
fn request_reports_every_overage() {
    let harness = TestHarness::new();
    harness.quota(&harness.instances, &AuthData::new(), Some(1));
    harness.quota(&harness.ram_size, &AuthData::new(), Some(1024));

    let request = ReservationRequest::new(&harness.service, TestHarness::user("U1", "T1"))
        .with_delta(&harness.instances, ParamData::new(), 2)
        .with_delta(&harness.cores, ParamData::new().with("flavor", "m1"), 4)
        .with_delta(&harness.ram_size, ParamData::new(), 2048);

    let result = harness
        .store
        .transaction(|tx| harness.ledger.reserve_request(tx, &request));
    match result {
        Err(LedgerError::OverQuota { overages }) => {
            let names: Vec<_> = overages.iter().map(|o| o.resource.as_str()).collect();
            assert_eq!(names, ["compute/instances", "compute/ram_size"]);
        }
        other => panic!("expected over quota, got {other:?}"),
    }

    let tx = harness.store.begin().unwrap();
    assert!(harness
        .ledger
        .get_usages(&tx, None, None, None)
        .unwrap()
        .is_empty());
}

#[test]
fn request_counts_repeated_resources_together() {
    let harness = TestHarness::new();
    harness.quota(&harness.instances, &AuthData::new(), Some(5));

    let request = ReservationRequest::new(&harness.service, TestHarness::user("U1", "T1"))
        .with_delta(&harness.instances, ParamData::new(), 3)
        .with_delta(&harness.instances, ParamData::new(), 3);

    let result = harness
        .store
        .transaction(|tx| harness.ledger.reserve_request(tx, &request));
    match result {
        Err(LedgerError::OverQuota { overages }) => {
            assert_eq!(overages.len(), 1);
            assert_eq!(overages[0].consumed, 3);
        }
        other => panic!("expected over quota, got {other:?}"),
    }
}

#[test]
fn request_requires_service_auth_fields() {
    let harness = TestHarness::new();
    let request = ReservationRequest::new(
        &harness.service,
        AuthData::new().with("user_id", "U1"),
    )
    .with_delta(&harness.instances, ParamData::new(), 1);

    let result = harness
        .store
        .transaction(|tx| harness.ledger.reserve_request(tx, &request));
    assert!(matches!(result, Err(LedgerError::InvalidArguments(_))));
}

#[test]
fn request_can_sweep_expired_reservations_first() {
    let harness = TestHarness::with_config(LedgerConfig {
        expire_on_request: true,
        ..LedgerConfig::default()
    });
    harness.quota(&harness.instances, &AuthData::new(), Some(4));
    let user = TestHarness::user("U1", "T1");
    let usage = harness.usage(&harness.instances, &user);

    let stale = harness
        .store
        .transaction(|tx| {
            harness
                .ledger
                .create_reservation(tx, Utc::now() + Duration::milliseconds(200))
        })
        .unwrap();
    harness.reserve(&stale, &usage, &user, 4).unwrap();
    thread::sleep(StdDuration::from_millis(300));

    let request = ReservationRequest::new(&harness.service, user)
        .with_delta(&harness.instances, ParamData::new(), 4);
    let receipt = harness
        .store
        .transaction(|tx| harness.ledger.reserve_request(tx, &request))
        .unwrap();

    assert_eq!(receipt.items.len(), 1);
    assert_eq!(harness.usage_row(usage.id).reserved, 4);
}

#[test]
fn request_rejects_past_expiry() {
    let harness = TestHarness::new();
    let request = ReservationRequest::new(&harness.service, TestHarness::user("U1", "T1"))
        .with_delta(&harness.instances, ParamData::new(), 1)
        .with_expire(Utc::now() - Duration::seconds(1));

    let result = harness
        .store
        .transaction(|tx| harness.ledger.reserve_request(tx, &request));
    assert!(matches!(result, Err(LedgerError::InvalidArguments(_))));
}
