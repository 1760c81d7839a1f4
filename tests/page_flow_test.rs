//! A user's trip across pages, driven through the public API.

mod common;

use std::sync::{Arc, Mutex};

use common::{open_page, ScriptedFetcher};
use daplot_lib::api::RequestOptions;
use daplot_lib::bus::event_types::{
    EVENT_FILE_UPLOADED, EVENT_LIBRARY_FAILED, EVENT_LIBRARY_LOADED,
};
use daplot_lib::host::MemoryHost;
use daplot_lib::loader::{plotly, LoadError};
use daplot_lib::storage::{KeyValueStore, MemoryStore, Page};
use daplot_lib::AppContext;
use httpmock::Method::GET;
use httpmock::MockServer;
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

#[tokio::test]
async fn chart_page_falls_back_to_a_cdn_when_the_local_copy_is_missing() {
    let spec = plotly();
    let page = open_page(
        "http://localhost:8000/visualization.html",
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStore::new()),
        ScriptedFetcher::new().with_broken(&spec.local_path),
    );

    let loaded = Arc::new(Mutex::new(Vec::new()));
    let sink = loaded.clone();
    page.context
        .bus
        .subscribe(EVENT_LIBRARY_LOADED, move |event| {
            sink.lock().unwrap().push(event.payload["source"].clone());
            Ok(())
        })
        .unwrap();

    let source = page
        .context
        .loader
        .load_for_current_page()
        .await
        .expect("visualization pages need charts")
        .expect("first CDN should work");

    assert_eq!(source, spec.cdn_urls[0]);
    assert_eq!(
        page.fetcher.attempts(),
        vec![spec.local_path.clone(), spec.cdn_urls[0].clone()]
    );
    assert_eq!(
        page.host.status_history(),
        vec!["Loading plotly...".to_string(), "Trying CDN 1/4...".to_string()]
    );
    assert_eq!(page.host.status(), None);
    assert_eq!(*loaded.lock().unwrap(), vec![json!(spec.cdn_urls[0])]);

    // later calls reuse the loaded copy
    assert_eq!(page.context.loader.load(&spec).await, Ok(source));
    assert_eq!(page.fetcher.attempts().len(), 2);
}

#[tokio::test]
async fn unreachable_library_reports_every_source_and_can_be_retried() {
    let spec = plotly();
    let fetcher = spec
        .sources()
        .iter()
        .fold(ScriptedFetcher::new(), |fetcher, src| fetcher.with_broken(src));
    let page = open_page(
        "http://localhost:8000/prediction.html",
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStore::new()),
        fetcher,
    );

    let failures = Arc::new(Mutex::new(0));
    let counter = failures.clone();
    page.context
        .bus
        .subscribe(EVENT_LIBRARY_FAILED, move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        })
        .unwrap();

    let error = page.context.loader.load(&spec).await.unwrap_err();
    match &error {
        LoadError::AllSourcesFailed { library, attempts } => {
            assert_eq!(library, "plotly");
            assert_eq!(attempts.len(), 5);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(page.host.errors().len(), 1);
    assert_eq!(*failures.lock().unwrap(), 1);
    assert!(!page.context.loader.is_loaded("plotly"));

    assert!(page.context.loader.load(&spec).await.is_err());
    assert_eq!(page.fetcher.attempts().len(), 10);
}

#[tokio::test]
async fn upload_then_visualize_against_the_backend() {
    let server = MockServer::start();
    let listing = server.mock(|when, then| {
        when.method(GET).path("/api/files/f9");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"id": "f9", "rows": [[0, 1.0], [1, 2.5]]}));
    });

    let durable = Arc::new(MemoryStore::new());
    let session = Arc::new(MemoryStore::new());
    durable
        .set(
            "daplot_app_state",
            &json!({"settings": {"apiBaseUrl": server.base_url()}}).to_string(),
        )
        .unwrap();

    let home = open_page(
        "http://localhost:8000/index.html",
        durable.clone(),
        session.clone(),
        ScriptedFetcher::new(),
    );
    assert_eq!(home.context.loader.load_for_current_page().await, None);

    let state = home.context.state.clone();
    home.context
        .bus
        .subscribe(EVENT_FILE_UPLOADED, move |event| {
            state.update(object(json!({"currentFileId": event.payload["fileId"]})));
            Ok(())
        })
        .unwrap();
    home.context
        .bus
        .publish(EVENT_FILE_UPLOADED, json!({"fileId": "f9"}));

    let response = home
        .context
        .api
        .get("/api/files/f9", RequestOptions::default())
        .await
        .expect("backend should answer");
    listing.assert();
    let data = response.data.as_json().cloned().expect("json body");
    assert!(home.context.files.put("f9", &data));

    let url = home
        .context
        .bridge
        .navigate_to_page(Page::Visualization, "f9")
        .unwrap();
    let target = reqwest::Url::parse(&url).unwrap();
    assert_eq!(target.path(), "/visualization.html");
    assert!(target
        .query_pairs()
        .any(|(key, value)| key == "currentFileId" && value == "f9"));

    let viewer = open_page(&url, durable, Arc::new(session.attach_context()), ScriptedFetcher::new());
    assert_eq!(viewer.context.state.get("currentFileId"), Some(json!("f9")));
    assert_eq!(
        viewer.context.bridge.get_shared_value("currentFileId"),
        Some(json!("f9"))
    );
    assert_eq!(viewer.context.files.get("f9"), Some(data));
    assert!(viewer
        .context
        .loader
        .load_for_current_page()
        .await
        .expect("charts needed")
        .is_ok());
}

#[test]
fn open_uses_a_sqlite_store_in_the_data_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("DAPLOT_DATA_DIR", dir.path());

    {
        let context = AppContext::open(Arc::new(MemoryHost::default())).unwrap();
        context
            .state
            .update(object(json!({"filters": {"region": "west"}})));
    }
    assert!(dir.path().join("daplot.db").exists());

    let reopened = AppContext::open(Arc::new(MemoryHost::default())).unwrap();
    assert_eq!(
        reopened.state.get("filters"),
        Some(json!({"region": "west"}))
    );

    std::env::remove_var("DAPLOT_DATA_DIR");
}
