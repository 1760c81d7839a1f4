//! Well-known event names.
//!
//! Names are `namespace.local`; the namespace is what
//! [`EventBus::unsubscribe_namespace`](super::EventBus::unsubscribe_namespace)
//! and [`EventBus::scope`](super::EventBus::scope) operate on.

// ---------------------------------------------------------------------------
// Namespaces
// ---------------------------------------------------------------------------

pub const NAMESPACE_FILE: &str = "file";
pub const NAMESPACE_PREDICTION: &str = "prediction";
pub const NAMESPACE_BRIDGE: &str = "bridge";
pub const NAMESPACE_LOADER: &str = "loader";

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

pub const EVENT_FILE_UPLOADED: &str = "file.uploaded";
pub const EVENT_FILE_DELETED: &str = "file.deleted";
pub const EVENT_PREDICTION_COMPLETED: &str = "prediction.completed";

/// Payload: `{"key": .., "value": ..}`.
pub const EVENT_SHARED_DATA_CHANGED: &str = "bridge.shared_data_changed";
/// Payload: the full shared mapping as written by another page.
pub const EVENT_PAGE_DATA_UPDATED: &str = "bridge.page_data_updated";

/// Payload: `{"library": .., "source": ..}`.
pub const EVENT_LIBRARY_LOADED: &str = "loader.library_loaded";
/// Payload: `{"library": .., "error": ..}`.
pub const EVENT_LIBRARY_FAILED: &str = "loader.library_failed";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::split_event_name;

    #[test]
    fn event_names_sit_in_their_namespaces() {
        let cases = [
            (EVENT_FILE_UPLOADED, NAMESPACE_FILE),
            (EVENT_FILE_DELETED, NAMESPACE_FILE),
            (EVENT_PREDICTION_COMPLETED, NAMESPACE_PREDICTION),
            (EVENT_SHARED_DATA_CHANGED, NAMESPACE_BRIDGE),
            (EVENT_PAGE_DATA_UPDATED, NAMESPACE_BRIDGE),
            (EVENT_LIBRARY_LOADED, NAMESPACE_LOADER),
            (EVENT_LIBRARY_FAILED, NAMESPACE_LOADER),
        ];
        for (name, namespace) in cases {
            assert_eq!(split_event_name(name).map(|(ns, _)| ns), Some(namespace));
        }
    }
}
