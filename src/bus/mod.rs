//! In-process event bus for decoupled UI notifications.
//!
//! The bus provides:
//! - Ordered listener lists per event name, with opaque removal tokens
//! - One-shot listeners and async listeners
//! - Namespace grouping (`file.uploaded` lives in `file`) for bulk removal
//! - `*`-wildcard broadcast over registered names
//!
//! # Dispatch
//!
//! Every dispatch works on a snapshot of the listener list taken before the
//! first listener runs. A listener that fails (returns `Err` or panics) is
//! logged and skipped; it never reaches the publisher or its siblings.

pub mod event_types;
mod event_bus;
mod scope;

pub use event_bus::{
    split_event_name, BusEvent, BusStats, DispatchOutcome, EventBus, EventStats, ListenerError,
    ListenerId, Subscription,
};
pub(crate) use event_bus::panic_message;
pub use scope::ScopedBus;
