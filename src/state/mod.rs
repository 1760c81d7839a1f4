//! Application-wide observable state.
//!
//! One JSON object holds everything the pages render from. Updates merge one
//! level deep, notify keyed and wildcard subscribers, and persist the durable
//! subset to the durable store.

mod app_state;
mod defaults;

pub use app_state::{AppState, StateSubscription, PERSISTED_KEYS, STATE_STORAGE_KEY, WILDCARD};
pub use defaults::{default_chart_config, default_settings, default_state};
