//! Checkpoint Store Integration Tests
//!
//! Upsert semantics, tenant isolation, terminal states, expiry and the audit
//! trail, against database files shared by more than one store handle.

use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;

use runvault::core::{
    AuditLog, CheckpointStore, ManualClock, SaveRequest, SqliteCheckpointStore, StoreOptions,
};
use runvault::domain::{AuditAction, AuditQuery, EventData, EventLedger, IdentityContext, RunStatus};

fn ctx(tenant: &str) -> IdentityContext {
    IdentityContext::new(tenant, "tester")
}

fn open(path: &Path) -> SqliteCheckpointStore {
    SqliteCheckpointStore::open(path, StoreOptions::default()).unwrap()
}

fn save(
    store: &SqliteCheckpointStore,
    tenant: &str,
    run_id: &str,
    payload: &Value,
    ledger: &EventLedger,
) -> runvault::error::Result<runvault::core::SaveReceipt> {
    let last_step = ledger.last().map(|e| e.name.clone()).unwrap_or_default();
    store.save(
        &ctx(tenant),
        &SaveRequest {
            run_id,
            provider_name: "mock",
            model: "gpt-demo",
            payload,
            events: ledger.events(),
            last_step: &last_step,
            expected_version: None,
        },
    )
}

fn step(ledger: &EventLedger, name: &str) -> EventLedger {
    let mut data = EventData::new();
    data.insert("step".into(), json!(name));
    ledger.record(name, data)
}

#[test]
fn test_idempotent_upsert_single_row() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("vault.db");
    let store = open(&db);
    let payload = json!({"q": 1});
    let ledger = step(&EventLedger::new(), "auth");

    let first = save(&store, "nasa", "R1", &payload, &ledger).unwrap();
    let second = save(&store, "nasa", "R1", &payload, &ledger).unwrap();
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.checkpoint_id, second.checkpoint_id);
    assert_eq!(second.checkpoint_version, 2);

    let conn = rusqlite::Connection::open(&db).unwrap();
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM runs WHERE run_id = 'R1'", [], |r| r.get(0))
        .unwrap();
    let events: i64 = conn
        .query_row("SELECT COUNT(*) FROM run_events WHERE run_id = 'R1'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(events, 1);
}

#[test]
fn test_tenant_isolation_is_audited() {
    let store = SqliteCheckpointStore::open_in_memory().unwrap();
    let payload = json!({"q": 1});
    save(&store, "noaa", "R2", &payload, &step(&EventLedger::new(), "auth")).unwrap();

    assert!(store.load(&ctx("nasa"), "R2").unwrap().is_none());

    let err = save(&store, "nasa", "R2", &payload, &EventLedger::new()).unwrap_err();
    assert_eq!(err.code(), "AGENCY_BOUNDARY_CROSSED");
    assert_eq!(err.http_status(), 403);

    let err = store.mark_completed(&ctx("nasa"), "R2").unwrap_err();
    assert_eq!(err.code(), "CHECKPOINT_NOT_FOUND");

    let attempts = store
        .audit_query(&AuditQuery::tenant("nasa").with_action(AuditAction::CrossTenantAccess))
        .unwrap();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|e| e.resource_id == "R2" && !e.success));

    // The owner's row is untouched
    let checkpoint = store.load(&ctx("noaa"), "R2").unwrap().unwrap();
    assert_eq!(checkpoint.checkpoint_version, 1);
    assert_eq!(checkpoint.tenant_id, "noaa");
    assert!(store.list_runs(&ctx("nasa"), 10).unwrap().is_empty());
    assert_eq!(store.list_runs(&ctx("noaa"), 10).unwrap().len(), 1);
}

#[test]
fn test_no_resurrection_after_terminal_status() {
    let store = SqliteCheckpointStore::open_in_memory().unwrap();
    let payload = json!({"q": 1});
    let ledger = step(&EventLedger::new(), "auth");
    save(&store, "nasa", "R1", &payload, &ledger).unwrap();

    store.mark_completed(&ctx("nasa"), "R1").unwrap();

    let err = save(&store, "nasa", "R1", &payload, &step(&ledger, "call")).unwrap_err();
    assert_eq!(err.code(), "RUN_ALREADY_FINAL");
    let err = store.mark_failed(&ctx("nasa"), "R1", "late").unwrap_err();
    assert_eq!(err.code(), "RUN_ALREADY_FINAL");
    let err = store.mark_completed(&ctx("nasa"), "R1").unwrap_err();
    assert_eq!(err.code(), "RUN_ALREADY_FINAL");

    let checkpoint = store.load(&ctx("nasa"), "R1").unwrap().unwrap();
    assert_eq!(checkpoint.status, RunStatus::Completed);
    assert_eq!(checkpoint.events.len(), 1);
    assert!(checkpoint.failure_reason.is_none());

    let rejected: Vec<_> = store
        .audit_query(&AuditQuery::tenant("nasa"))
        .unwrap()
        .into_iter()
        .filter(|e| !e.success)
        .collect();
    assert_eq!(rejected.len(), 3);
}

#[test]
fn test_mark_failed_records_reason() {
    let store = SqliteCheckpointStore::open_in_memory().unwrap();
    save(&store, "nasa", "R1", &json!({}), &EventLedger::new()).unwrap();

    store.mark_failed(&ctx("nasa"), "R1", "provider gone").unwrap();

    let checkpoint = store.load(&ctx("nasa"), "R1").unwrap().unwrap();
    assert_eq!(checkpoint.status, RunStatus::Failed);
    assert_eq!(checkpoint.failure_reason.as_deref(), Some("provider gone"));

    let fails = store
        .audit_query(&AuditQuery::tenant("nasa").with_action(AuditAction::Fail))
        .unwrap();
    assert_eq!(fails.len(), 1);
    assert_eq!(fails[0].before_state.as_ref().unwrap()["status"], "PENDING");
    assert_eq!(fails[0].after_state.as_ref().unwrap()["status"], "FAILED");
}

#[test]
fn test_cleanup_writes_one_aggregate_entry() {
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let store = SqliteCheckpointStore::open_in_memory()
        .unwrap()
        .with_clock(clock.clone());
    let payload = json!({});

    save(&store, "nasa", "OLD1", &payload, &EventLedger::new()).unwrap();
    save(&store, "noaa", "OLD2", &payload, &EventLedger::new()).unwrap();
    clock.advance(Duration::days(20));
    save(&store, "nasa", "NEW1", &payload, &EventLedger::new()).unwrap();

    // OLD* expire at day 30, NEW1 at day 50
    let now = start + Duration::days(31);
    clock.set(now);
    assert_eq!(store.cleanup_expired(now).unwrap(), 2);
    assert_eq!(store.cleanup_expired(now).unwrap(), 0);

    assert!(store.load(&ctx("nasa"), "OLD1").unwrap().is_none());
    assert!(store.load(&ctx("nasa"), "NEW1").unwrap().is_some());

    let cleanups = store
        .audit_query(&AuditQuery {
            action: Some(AuditAction::Cleanup),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(cleanups.len(), 2);
    assert_eq!(cleanups[1].after_state.as_ref().unwrap()["deleted"], 2);
    assert_eq!(cleanups[0].after_state.as_ref().unwrap()["deleted"], 0);
    assert!(cleanups.iter().all(|e| e.tenant_id.is_none() && e.actor == "system"));

    // An expired id may be reused as a brand-new run
    let receipt = save(&store, "nasa", "OLD1", &payload, &EventLedger::new()).unwrap();
    assert!(receipt.created);
    assert_eq!(receipt.checkpoint_version, 1);
}

#[test]
fn test_audit_query_filters_and_purge() {
    let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let store = SqliteCheckpointStore::open_in_memory()
        .unwrap()
        .with_clock(clock.clone());
    let payload = json!({});

    save(&store, "nasa", "R1", &payload, &EventLedger::new()).unwrap();
    clock.advance(Duration::hours(1));
    save(&store, "nasa", "R1", &payload, &EventLedger::new()).unwrap();
    clock.advance(Duration::hours(1));
    store.mark_completed(&ctx("nasa"), "R1").unwrap();

    let all = store.audit_query(&AuditQuery::tenant("nasa")).unwrap();
    let actions: Vec<_> = all.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![AuditAction::Complete, AuditAction::Checkpoint, AuditAction::Create]
    );

    let window = store
        .audit_query(&AuditQuery::tenant("nasa").between(
            start + Duration::minutes(30),
            start + Duration::minutes(90),
        ))
        .unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].action, AuditAction::Checkpoint);

    let limited = store
        .audit_query(&AuditQuery {
            limit: Some(1),
            ..AuditQuery::tenant("nasa")
        })
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].action, AuditAction::Complete);

    assert!(store
        .audit_query(&AuditQuery::tenant("nasa").with_actor("someone-else"))
        .unwrap()
        .is_empty());

    assert_eq!(store.purge_audit(start + Duration::minutes(90)).unwrap(), 2);
    assert_eq!(store.audit_query(&AuditQuery::tenant("nasa")).unwrap().len(), 1);
}

#[test]
fn test_concurrent_saves_from_two_handles() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("vault.db");
    let first = open(&db);
    let second = open(&db);
    let payload = json!({"q": "race"});
    let ledger = step(&EventLedger::new(), "auth");

    std::thread::scope(|scope| {
        for store in [&first, &second] {
            let payload = &payload;
            let ledger = &ledger;
            scope.spawn(move || {
                for _ in 0..10 {
                    save(store, "nasa", "R1", payload, ledger).unwrap();
                }
            });
        }
    });

    let checkpoint = first.load(&ctx("nasa"), "R1").unwrap().unwrap();
    assert_eq!(checkpoint.checkpoint_version, 20);
    assert!(checkpoint.integrity_valid);

    let writes = first.audit_query(&AuditQuery::tenant("nasa")).unwrap();
    let creates = writes.iter().filter(|e| e.action == AuditAction::Create).count();
    let updates = writes.iter().filter(|e| e.action == AuditAction::Checkpoint).count();
    assert_eq!((creates, updates), (1, 19));
}

#[test]
fn test_expected_version_admits_one_writer() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("vault.db");
    let first = open(&db);
    let second = open(&db);
    let payload = json!({"q": 1});
    save(&first, "nasa", "R1", &payload, &EventLedger::new()).unwrap();

    let ledger = step(&EventLedger::new(), "auth");
    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = [&first, &second]
            .into_iter()
            .map(|store| {
                let payload = &payload;
                let ledger = &ledger;
                scope.spawn(move || {
                    store.save(
                        &ctx("nasa"),
                        &SaveRequest {
                            run_id: "R1",
                            provider_name: "mock",
                            model: "gpt-demo",
                            payload,
                            events: ledger.events(),
                            last_step: "auth",
                            expected_version: Some(1),
                        },
                    )
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.code() == "VERSION_CONFLICT"))
        .count();
    assert_eq!((ok, conflicts), (1, 1));

    let checkpoint = second.load(&ctx("nasa"), "R1").unwrap().unwrap();
    assert_eq!(checkpoint.checkpoint_version, 2);
    assert_eq!(checkpoint.events.len(), 1);
}
