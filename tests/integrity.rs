//! Integrity Integration Tests
//!
//! Digests must survive a trip through the database unchanged, and any
//! out-of-band edit to stored content must be caught on the next load.

use serde_json::json;
use tempfile::TempDir;

use runvault::core::integrity::{checkpoint_hash, DIGEST_HEX_LEN};
use runvault::core::{CheckpointStore, SaveRequest, SqliteCheckpointStore, StoreOptions};
use runvault::domain::{EventData, EventLedger, IdentityContext};

fn ctx() -> IdentityContext {
    IdentityContext::new("nasa", "auditor")
}

#[test]
fn test_digest_survives_storage() {
    let store = SqliteCheckpointStore::open_in_memory().unwrap();
    // Floats and unicode exercise the encoder's number and string paths
    let payload = json!({"ratio": 0.1, "label": "Δv", "nested": {"b": [3, 1], "a": null}});
    let mut data = EventData::new();
    data.insert("chosen".into(), json!("gpt-fast"));
    let ledger = EventLedger::new()
        .record("auth", EventData::new())
        .record("model_select", data);

    let receipt = store
        .save(
            &ctx(),
            &SaveRequest {
                run_id: "R1",
                provider_name: "mock",
                model: "gpt-fast",
                payload: &payload,
                events: ledger.events(),
                last_step: "model_select",
                expected_version: None,
            },
        )
        .unwrap();
    assert_eq!(receipt.checkpoint_hash.len(), DIGEST_HEX_LEN);
    assert_eq!(
        receipt.checkpoint_hash,
        checkpoint_hash(&payload, ledger.events()).unwrap()
    );

    let checkpoint = store.load(&ctx(), "R1").unwrap().unwrap();
    assert!(checkpoint.integrity_valid);
    assert_eq!(checkpoint.events, ledger.events());
    assert_eq!(
        checkpoint_hash(&checkpoint.payload, &checkpoint.events).unwrap(),
        receipt.checkpoint_hash
    );

    assert!(store
        .verify_integrity(&ctx(), &receipt.checkpoint_id, &receipt.checkpoint_hash)
        .unwrap());
}

#[test]
fn test_edited_event_is_detected() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("vault.db");
    let store = SqliteCheckpointStore::open(&db, StoreOptions::default()).unwrap();
    let payload = json!({"q": 1});
    let mut data = EventData::new();
    data.insert("provider".into(), json!("mock"));
    let ledger = EventLedger::new().record("auth", data);

    store
        .save(
            &ctx(),
            &SaveRequest {
                run_id: "R1",
                provider_name: "mock",
                model: "gpt-demo",
                payload: &payload,
                events: ledger.events(),
                last_step: "auth",
                expected_version: None,
            },
        )
        .unwrap();

    // Swap the event row out from under the store (triggers block UPDATE)
    let conn = rusqlite::Connection::open(&db).unwrap();
    let original: String = conn
        .query_row("SELECT event_json FROM run_events WHERE run_id = 'R1'", [], |r| r.get(0))
        .unwrap();
    let forged = original.replace("\"mock\"", "\"kilo\"");
    assert_ne!(original, forged);
    conn.execute("DELETE FROM run_events WHERE run_id = 'R1'", []).unwrap();
    conn.execute(
        "INSERT INTO run_events (run_id, event_index, name, event_json) VALUES ('R1', 0, 'auth', ?1)",
        [&forged],
    )
    .unwrap();

    let checkpoint = store.load(&ctx(), "R1").unwrap().unwrap();
    assert!(!checkpoint.integrity_valid);
    assert_eq!(checkpoint.events[0].data_str("provider"), Some("kilo"));
}

#[test]
fn test_unreadable_payload_is_corrupt() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("vault.db");
    let store = SqliteCheckpointStore::open(&db, StoreOptions::default()).unwrap();
    store
        .save(
            &ctx(),
            &SaveRequest {
                run_id: "R1",
                provider_name: "mock",
                model: "gpt-demo",
                payload: &json!({}),
                events: &[],
                last_step: "",
                expected_version: None,
            },
        )
        .unwrap();

    let conn = rusqlite::Connection::open(&db).unwrap();
    conn.execute("UPDATE runs SET payload_json = '{not json' WHERE run_id = 'R1'", [])
        .unwrap();

    let err = store.load(&ctx(), "R1").unwrap_err();
    assert_eq!(err.code(), "CHECKPOINT_CORRUPT");
    assert!(!err.retryable());
}
