//! What survives a restart, and what housekeeping removes.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};

use crate::config::AppConfig;
use crate::host::MemoryHost;
use crate::state::default_state;
use crate::storage::{KeyValueStore, MemoryStore, SqliteStore};
use crate::testing::{test_rig_over, InstantFetcher};
use crate::AppContext;

fn context_over(durable: Arc<dyn KeyValueStore>, host: Arc<MemoryHost>) -> AppContext {
    AppContext::with_fetcher(
        AppConfig::default(),
        durable,
        Arc::new(MemoryStore::new()),
        host,
        Arc::new(InstantFetcher),
    )
    .expect("context should build")
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

#[test]
fn durable_state_survives_reopening_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daplot.db");

    {
        let durable = Arc::new(SqliteStore::open(&path).unwrap());
        let context = context_over(durable, Arc::new(MemoryHost::default()));
        context.state.update(object(json!({
            "currentFileId": "f3",
            "filters": {"region": "east"},
            "loading": true,
            "settings": {"theme": "dark"}
        })));
    }

    let durable = Arc::new(SqliteStore::open(&path).unwrap());
    let context = context_over(durable, Arc::new(MemoryHost::default()));
    let state = &context.state;
    assert_eq!(state.get("currentFileId"), Some(json!("f3")));
    assert_eq!(state.get("filters"), Some(json!({"region": "east"})));
    assert_eq!(state.get("loading"), Some(json!(false)));
    let settings = state.get("settings").unwrap();
    assert_eq!(settings["theme"], "dark");
    assert_eq!(settings["language"], "zh-CN");
}

#[test]
fn persisted_backend_url_configures_api_and_bridge() {
    let durable = Arc::new(MemoryStore::new());
    durable
        .set(
            "daplot_app_state",
            r#"{"settings":{"apiBaseUrl":"http://backend.test:9000"}}"#,
        )
        .unwrap();

    let rig = test_rig_over(
        "http://localhost:8000/index.html",
        durable,
        Arc::new(MemoryStore::new()),
    );
    assert_eq!(rig.context.api.base_url(), "http://backend.test:9000");
    assert_eq!(
        rig.context.bridge.api_url("files"),
        "http://backend.test:9000/api/files"
    );
}

#[test]
fn page_unload_sweeps_expired_payloads() {
    let durable = Arc::new(MemoryStore::new());
    let rig = test_rig_over(
        "http://localhost:8000/index.html",
        durable.clone(),
        Arc::new(MemoryStore::new()),
    );
    assert!(rig.context.files.put("fresh", &json!([1, 2, 3])));

    // a payload cached long before the expiry window
    durable
        .set(
            "daplot_file_stale",
            r#"{"data":[0],"timestamp":0,"version":"1.0"}"#,
        )
        .unwrap();
    let mut index: Vec<Value> =
        serde_json::from_str(&durable.get("daplot_file_list").unwrap().unwrap()).unwrap();
    index.push(json!({"id": "stale", "timestamp": 0, "size": 42}));
    durable
        .set("daplot_file_list", &serde_json::to_string(&index).unwrap())
        .unwrap();

    assert_eq!(rig.context.on_page_unload(), 1);
    assert_eq!(rig.context.files.get("stale"), None);
    assert_eq!(rig.context.files.get("fresh"), Some(json!([1, 2, 3])));
    let ids: Vec<String> = rig
        .context
        .files
        .list()
        .into_iter()
        .map(|entry| entry.id)
        .collect();
    assert_eq!(ids, vec!["fresh".to_string()]);
}

#[test]
fn full_reset_forgets_everything_durable() {
    let durable = Arc::new(MemoryStore::new());
    let rig = test_rig_over(
        "http://localhost:8000/visualization.html",
        durable.clone(),
        Arc::new(MemoryStore::new()),
    );
    rig.context
        .state
        .update(object(json!({"currentFileId": "f1", "filters": {"a": 1}})));

    rig.context.state.reset(None);
    assert_eq!(rig.host.reload_count(), 1);
    assert_eq!(durable.get("daplot_app_state").unwrap(), None);

    // the reloaded page starts from defaults
    let reloaded = test_rig_over(
        "http://localhost:8000/visualization.html",
        durable,
        Arc::new(MemoryStore::new()),
    );
    assert_eq!(
        reloaded.context.state.snapshot(),
        default_state("http://localhost:8001")
    );
}

#[test]
fn full_durable_store_degrades_without_failing_callers() {
    let durable = Arc::new(MemoryStore::with_quota(600));
    let rig = test_rig_over(
        "http://localhost:8000/index.html",
        durable.clone(),
        Arc::new(MemoryStore::new()),
    );

    let rows: Vec<Value> = (0..100).map(|row| json!([row, row * 2])).collect();
    assert!(!rig.context.files.put("big", &Value::Array(rows)));
    assert_eq!(rig.context.files.get("big"), None);
    assert!(rig.context.files.list().is_empty());

    rig.context
        .state
        .update(object(json!({"filters": {"note": "x".repeat(1_000)}})));
    assert_eq!(
        rig.context.state.get("filters").unwrap()["note"]
            .as_str()
            .map(str::len),
        Some(1_000)
    );
}

#[test]
fn stale_page_snapshots_are_dropped_on_load_and_unload() {
    let durable = Arc::new(MemoryStore::new());
    let stale = r#"{"timestamp":0,"page":"prediction","state":{},"version":"1.0"}"#;
    durable.set("daplot_page_state_prediction", stale).unwrap();

    let rig = test_rig_over(
        "http://localhost:8000/visualization.html",
        durable.clone(),
        Arc::new(MemoryStore::new()),
    );
    assert_eq!(durable.get("daplot_page_state_prediction").unwrap(), None);

    let page_states = &rig.context.page_states;
    page_states.set_current_page("visualization", &json!({}));
    assert_eq!(
        page_states.set_current_page("prediction", &json!({"xAxis": "time"})),
        None
    );
    durable.set("daplot_page_state_data_edit", stale).unwrap();

    assert_eq!(rig.context.on_page_unload(), 1);
    assert_eq!(
        page_states.load("visualization"),
        Some(json!({"xAxis": "time"}))
    );
    assert_eq!(durable.get("daplot_page_state_data_edit").unwrap(), None);
}
