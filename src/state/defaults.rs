use serde_json::{json, Map, Value};

pub fn default_chart_config() -> Value {
    json!({
        "title": "",
        "xAxis": "",
        "yAxis": "",
        "chartType": "scatter",
        "style": {}
    })
}

pub fn default_settings(api_base_url: &str) -> Value {
    json!({
        "theme": "light",
        "language": "zh-CN",
        "autoSave": true,
        "apiBaseUrl": api_base_url
    })
}

/// Initial contents of the state container.
pub fn default_state(api_base_url: &str) -> Map<String, Value> {
    let mut state = Map::new();
    state.insert("currentPage".to_string(), json!("home"));
    state.insert("files".to_string(), json!({}));
    state.insert("currentFileId".to_string(), Value::Null);
    state.insert("currentFileData".to_string(), Value::Null);
    state.insert("loading".to_string(), json!(false));
    state.insert("error".to_string(), Value::Null);
    state.insert("filters".to_string(), json!({}));
    state.insert("chartConfig".to_string(), default_chart_config());
    state.insert("settings".to_string(), default_settings(api_base_url));
    state
}
