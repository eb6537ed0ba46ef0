use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use potiron::dictionary::reverse::{annotations_for, build_reverse_index};
use potiron::dictionary::{AnnotationKind, GlobalId};
use potiron::field::catalog;
use potiron::ingest::dissector::{DissectError, Dissector};
use potiron::ingest::ingest;
use potiron::ingest::params::RunParameters;
use potiron::ingest::pool::IngestSummary;
use potiron::ingest::worker::IngestContext;
use potiron::route::protocols::ProtocolTable;
use potiron::route::{KeyMode, KeyRouter};
use potiron::store::{keys, MemoryStore, Store};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const FILTER: &str = "ip.dst ne 255.255.255.255";

/// Documents never reach the dissector.
struct NoDissector;

impl Dissector for NoDissector {
    fn name(&self) -> &str {
        "none"
    }

    async fn dissect(
        &self,
        capture: &Path,
        _fields: &[&str],
        _display_filter: &str,
    ) -> Result<Vec<String>, DissectError> {
        Err(DissectError::Exit {
            program: "none".to_string(),
            status: "exit status: 1".to_string(),
            stderr: format!("unexpected capture {}", capture.display()),
        })
    }
}

fn context(sensor: Option<&str>) -> Arc<IngestContext> {
    let fields = catalog::resolve_filter(&["ip.src".to_string()]).unwrap();
    let params = RunParameters::new(FILTER, fields, KeyMode::Plain, "info");
    Arc::new(IngestContext::new(
        params,
        KeyRouter::new(KeyMode::Plain, ProtocolTable::default()),
        sensor.map(str::to_string),
        Duration::from_secs(60),
    ))
}

fn packet(ip: &str, asn_local: i64) -> serde_json::Value {
    json!({
        "type": 2,
        "timestamp": "2024-01-01 00:00:01.5",
        "protocol": 6,
        "ipsrc": ip,
        "a_13_ipsrc": asn_local,
    })
}

fn write_doc(dir: &Path, name: &str, objects: Vec<serde_json::Value>) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_vec(&serde_json::Value::Array(objects)).unwrap())
        .unwrap();
    path
}

async fn run(store: &MemoryStore, files: Vec<PathBuf>, workers: usize) -> IngestSummary {
    ingest(
        store.clone(),
        Arc::new(NoDissector),
        context(Some("sensor")),
        files,
        workers,
        CancellationToken::new(),
        None,
    )
    .await
    .unwrap()
}

fn registrations(store: &MemoryStore) -> BTreeMap<String, String> {
    store
        .snapshot()
        .hashes
        .get("RT_a_13_ipsrc")
        .cloned()
        .unwrap_or_default()
}

#[tokio::test]
async fn test_local_ids_translated_to_global_ids() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_doc(
        dir.path(),
        "a.json",
        vec![
            json!({"type": 1, "sensorname": "hp-a-0", "tshark_filter": FILTER}),
            packet("10.0.0.1", 1),
            packet("10.0.0.1", 1),
            json!({"type": 13, "10.0.0.1": [1, "AS64500"]}),
        ],
    );
    // Same value under another local id, plus a second value.
    let b = write_doc(
        dir.path(),
        "b.json",
        vec![
            packet("10.0.0.2", 7),
            packet("10.0.0.3", 8),
            json!({"type": 13, "10.0.0.2": [7, "AS64500"], "10.0.0.3": [8, "AS64501"]}),
        ],
    );

    let store = MemoryStore::new();
    let summary = run(&store, vec![a, b], 1).await;
    assert_eq!(summary.ingested, 2);

    let ids = registrations(&store);
    assert_eq!(ids.len(), 2);
    assert_ne!(ids["AS64500"], ids["AS64501"]);

    let state = store.snapshot();
    assert_eq!(state.strings["AR_13_10.0.0.1"], ids["AS64500"]);
    assert_eq!(state.strings["AR_13_10.0.0.2"], ids["AS64500"]);
    assert_eq!(state.strings["AR_13_10.0.0.3"], ids["AS64501"]);

    let histogram = &state.sorted_sets["sensor:20240101:a_13_ipsrc"];
    assert_eq!(histogram[&ids["AS64500"]], 3);
    assert_eq!(histogram[&ids["AS64501"]], 1);
    assert!(state.sets[keys::RTK].contains("RT_a_13_ipsrc"));
    assert!(state.sets[keys::FILES].contains("a.json"));
}

#[tokio::test]
async fn test_header_names_file_and_sensor() {
    let dir = tempfile::tempdir().unwrap();
    let doc = write_doc(
        dir.path(),
        "export-0001.json",
        vec![
            json!({"type": 1, "sensorname": "hp-a-0", "filename": "hp-a-0-20240101.cap.gz"}),
            packet("10.0.0.1", 1),
            json!({"type": 13, "10.0.0.1": [1, "AS64500"]}),
        ],
    );

    let store = MemoryStore::new();
    let summary = ingest(
        store.clone(),
        Arc::new(NoDissector),
        context(None),
        vec![doc],
        1,
        CancellationToken::new(),
        None,
    )
    .await
    .unwrap();
    assert_eq!(summary.ingested, 1);

    let state = store.snapshot();
    assert!(state.sets[keys::FILES].contains("hp-a-0-20240101.cap.gz"));
    assert!(state.sorted_sets.contains_key("hp-a-0:20240101:ipsrc"));
}

#[tokio::test]
async fn test_header_filter_mismatch_fails_file() {
    let dir = tempfile::tempdir().unwrap();
    let doc = write_doc(
        dir.path(),
        "a.json",
        vec![
            json!({"type": 1, "tshark_filter": "udp"}),
            packet("10.0.0.1", 1),
        ],
    );

    let store = MemoryStore::new();
    let summary = run(&store, vec![doc], 1).await;
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].1.contains("tshark_filter"));
    assert!(!store.snapshot().sets.contains_key(keys::FILES));
}

#[tokio::test]
async fn test_unresolved_references_become_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let doc = write_doc(
        dir.path(),
        "a.json",
        vec![
            packet("10.0.0.1", 99),
            json!({"type": 2, "timestamp": "2024-01-01 00:00:02", "ipsrc": "10.0.0.2", "a_x": 1}),
            json!({"type": 13, "10.0.0.1": [1, "AS64500"]}),
        ],
    );

    let store = MemoryStore::new();
    let summary = run(&store, vec![doc], 1).await;
    assert_eq!(summary.ingested, 1);

    let state = store.snapshot();
    let unresolved = GlobalId::UNRESOLVED.to_string();
    assert_eq!(state.sorted_sets["sensor:20240101:a_13_ipsrc"][&unresolved], 1);
    assert_eq!(state.sorted_sets["sensor:20240101:a_x"][&unresolved], 1);
    assert!(!state.strings.keys().any(|k| k.starts_with("AR_")));
    assert!(registrations(&store).is_empty());
}

#[tokio::test]
async fn test_unknown_dictionary_type_resolves_to_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let doc = write_doc(
        dir.path(),
        "a.json",
        vec![
            json!({
                "type": 2,
                "timestamp": "2024-01-01 00:00:01",
                "ipsrc": "10.0.0.1",
                "a_13_ipsrc": 1,
                "a_14_ipsrc": 1,
            }),
            json!({"type": 13, "10.0.0.1": [1, "AS64500"]}),
            json!({"type": 14, "10.0.0.1": [1, "unknown enrichment"]}),
        ],
    );

    let store = MemoryStore::new();
    let summary = run(&store, vec![doc], 1).await;
    assert_eq!(summary.ingested, 1);
    assert!(summary.is_success());

    let state = store.snapshot();
    let unresolved = GlobalId::UNRESOLVED.to_string();
    assert_eq!(state.sorted_sets["sensor:20240101:a_14_ipsrc"][&unresolved], 1);
    assert_eq!(
        state.sorted_sets["sensor:20240101:a_13_ipsrc"][&registrations(&store)["AS64500"]],
        1
    );
    assert_eq!(state.strings.keys().filter(|k| k.starts_with("AR_")).count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_files_agree_on_ids() {
    let dir = tempfile::tempdir().unwrap();
    let mut files = Vec::new();
    for i in 0..8i64 {
        let shared_ip = format!("10.0.{i}.1");
        let own_ip = format!("10.0.{i}.2");
        files.push(write_doc(
            dir.path(),
            &format!("doc{i}.json"),
            vec![
                packet(&shared_ip, 100 + i),
                packet(&own_ip, 200 + i),
                json!({
                    "type": 13,
                    shared_ip.clone(): [100 + i, "AS64500"],
                    own_ip.clone(): [200 + i, format!("AS{}", 65000 + i)],
                }),
            ],
        ));
    }

    let store = MemoryStore::new();
    let summary = run(&store, files, 8).await;
    assert_eq!(summary.ingested, 8);

    let ids = registrations(&store);
    assert_eq!(ids.len(), 9);
    let distinct: BTreeSet<&String> = ids.values().collect();
    assert_eq!(distinct.len(), ids.len());

    let state = store.snapshot();
    for i in 0..8 {
        assert_eq!(state.strings[&format!("AR_13_10.0.{i}.1")], ids["AS64500"]);
        assert_eq!(
            state.strings[&format!("AR_13_10.0.{i}.2")],
            ids[&format!("AS{}", 65000 + i)]
        );
    }
    assert_eq!(
        state.sorted_sets["sensor:20240101:a_13_ipsrc"][&ids["AS64500"]],
        8
    );

    let counter: i64 = state.strings[&AnnotationKind::Asn.counter_key()]
        .parse()
        .unwrap();
    assert!(counter >= 9);
}

#[tokio::test]
async fn test_reverse_index_and_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let doc = write_doc(
        dir.path(),
        "a.json",
        vec![
            packet("10.0.0.1", 1),
            json!({"type": 13, "10.0.0.1": [1, "AS64500"]}),
        ],
    );

    let store = MemoryStore::new();
    run(&store, vec![doc], 1).await;

    let before = annotations_for(&store, "10.0.0.1").await.unwrap();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].value, None);

    let report = build_reverse_index(&store, false).await.unwrap();
    assert_eq!(report.keys, 1);
    assert_eq!(report.entries, 1);

    let id = registrations(&store)["AS64500"].clone();
    assert_eq!(
        store.snapshot().hashes["TR_a_13_ipsrc"][&id],
        "AS64500"
    );

    let found = annotations_for(&store, "10.0.0.1").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].kind, AnnotationKind::Asn);
    assert_eq!(found[0].field, "a_13_ipsrc");
    assert_eq!(found[0].id.to_string(), id);
    assert_eq!(found[0].value.as_deref(), Some("AS64500"));

    assert!(annotations_for(&store, "192.0.2.1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reverse_index_refused_during_ingestion() {
    let store = MemoryStore::new();
    store
        .add_members(keys::INGESTING, &["a.json".to_string()])
        .await
        .unwrap();

    assert!(build_reverse_index(&store, false).await.is_err());
    assert_eq!(build_reverse_index(&store, true).await.unwrap().keys, 0);
}
