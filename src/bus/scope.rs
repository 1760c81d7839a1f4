use std::future::Future;

use serde_json::Value;

use super::event_bus::{BusEvent, DispatchOutcome, EventBus, ListenerError, ListenerId, Subscription};
use crate::AppError;

/// A view of an [`EventBus`] that prefixes `namespace.` onto every name.
#[derive(Clone)]
pub struct ScopedBus {
    bus: EventBus,
    namespace: String,
}

impl ScopedBus {
    pub(super) fn new(bus: EventBus, namespace: &str) -> Self {
        Self {
            bus,
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn full_name(&self, event: &str) -> String {
        format!("{}.{event}", self.namespace)
    }

    pub fn subscribe<F>(&self, event: &str, callback: F) -> Result<Subscription, AppError>
    where
        F: Fn(&BusEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.bus.subscribe(&self.full_name(event), callback)
    }

    pub fn subscribe_async<F, Fut>(&self, event: &str, callback: F) -> Result<Subscription, AppError>
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ListenerError>> + Send + 'static,
    {
        self.bus.subscribe_async(&self.full_name(event), callback)
    }

    pub fn subscribe_once<F>(&self, event: &str, callback: F) -> Result<Subscription, AppError>
    where
        F: Fn(&BusEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.bus.subscribe_once(&self.full_name(event), callback)
    }

    pub fn unsubscribe(&self, event: &str, id: Option<ListenerId>) -> bool {
        self.bus.unsubscribe(&self.full_name(event), id)
    }

    pub fn publish(&self, event: &str, data: Value) -> bool {
        self.bus.publish(&self.full_name(event), data)
    }

    pub async fn publish_async(&self, event: &str, data: Value) -> Vec<DispatchOutcome> {
        self.bus.publish_async(&self.full_name(event), data).await
    }

    /// Remove everything registered under this namespace.
    pub fn clear(&self) -> bool {
        self.bus.unsubscribe_namespace(&self.namespace)
    }
}

impl EventBus {
    pub fn scope(&self, namespace: &str) -> ScopedBus {
        ScopedBus::new(self.clone(), namespace)
    }
}
