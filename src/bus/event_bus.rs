use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::AppError;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque token identifying one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Error produced by a listener. Never propagated to the publisher.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl From<String> for ListenerError {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ListenerError {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub id: String,
    pub seq: i64,
    pub namespace: Option<String>,
    pub name: String,
    pub payload: Value,
    pub created_at: String,
}

/// Result of one listener under [`EventBus::publish_async`].
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Success(Value),
    Failure(ListenerError),
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    pub listener_count: usize,
    pub has_once: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub total_events: usize,
    pub total_listeners: usize,
    pub namespaces: usize,
    pub once_events: usize,
    pub events: BTreeMap<String, EventStats>,
}

type SyncCallback = Arc<dyn Fn(&BusEvent) -> Result<(), ListenerError> + Send + Sync>;
type AsyncCallback =
    Arc<dyn Fn(BusEvent) -> BoxFuture<'static, Result<Value, ListenerError>> + Send + Sync>;

#[derive(Clone)]
enum Callback {
    Sync(SyncCallback),
    Async(AsyncCallback),
}

#[derive(Clone)]
struct Listener {
    id: ListenerId,
    callback: Callback,
    context: Option<String>,
    /// Set for one-shot listeners; flips on the first claimed invocation.
    once: Option<Arc<AtomicBool>>,
}

#[derive(Default)]
struct Registry {
    events: BTreeMap<String, Vec<Listener>>,
    namespaces: HashMap<String, BTreeSet<String>>,
}

impl Registry {
    fn remove(&mut self, name: &str, id: Option<ListenerId>) -> bool {
        let Some(listeners) = self.events.get_mut(name) else {
            return false;
        };

        let removed = match id {
            Some(id) => match listeners.iter().position(|listener| listener.id == id) {
                Some(index) => {
                    listeners.remove(index);
                    true
                }
                None => false,
            },
            None => {
                listeners.clear();
                true
            }
        };

        if listeners.is_empty() {
            self.events.remove(name);
            self.forget_name(name);
        }
        removed
    }

    fn forget_name(&mut self, name: &str) {
        let Some((namespace, _)) = split_event_name(name) else {
            return;
        };
        if let Some(names) = self.namespaces.get_mut(namespace) {
            names.remove(name);
            if names.is_empty() {
                self.namespaces.remove(namespace);
            }
        }
    }
}

/// Splits `ns.local.rest` into `("ns", "local.rest")`.
pub fn split_event_name(name: &str) -> Option<(&str, &str)> {
    match name.split_once('.') {
        Some((namespace, local)) if !namespace.is_empty() => Some((namespace, local)),
        _ => None,
    }
}

/// Handle returned by every `subscribe*` call.
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    name: String,
    id: ListenerId,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn event_name(&self) -> &str {
        &self.name
    }

    /// Remove this registration. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut guard = registry.lock().expect("event registry mutex poisoned");
        guard.remove(&self.name, Some(self.id))
    }
}

/// Synchronous publish/subscribe registry.
///
/// Cloning yields another handle onto the same registry. The registry lock is
/// never held while listeners run, so listeners may subscribe, unsubscribe or
/// publish re-entrantly; such changes apply to the next dispatch pass only.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    seq: Arc<AtomicI64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, name: &str, callback: F) -> Result<Subscription, AppError>
    where
        F: Fn(&BusEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.register(name, Callback::Sync(Arc::new(callback)), None, false)
    }

    /// Like [`subscribe`](Self::subscribe), tagging the listener with a context
    /// label that shows up in dispatch logs.
    pub fn subscribe_with_context<F>(
        &self,
        name: &str,
        context: &str,
        callback: F,
    ) -> Result<Subscription, AppError>
    where
        F: Fn(&BusEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.register(
            name,
            Callback::Sync(Arc::new(callback)),
            Some(context.to_string()),
            false,
        )
    }

    pub fn subscribe_async<F, Fut>(&self, name: &str, callback: F) -> Result<Subscription, AppError>
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ListenerError>> + Send + 'static,
    {
        self.register(name, wrap_async(callback), None, false)
    }

    pub fn subscribe_once<F>(&self, name: &str, callback: F) -> Result<Subscription, AppError>
    where
        F: Fn(&BusEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.register(name, Callback::Sync(Arc::new(callback)), None, true)
    }

    pub fn subscribe_once_async<F, Fut>(
        &self,
        name: &str,
        callback: F,
    ) -> Result<Subscription, AppError>
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ListenerError>> + Send + 'static,
    {
        self.register(name, wrap_async(callback), None, true)
    }

    fn register(
        &self,
        name: &str,
        callback: Callback,
        context: Option<String>,
        once: bool,
    ) -> Result<Subscription, AppError> {
        if name.trim().is_empty() {
            return Err(AppError::Validation(
                "event name must not be empty".to_string(),
            ));
        }

        let id = ListenerId::next();
        let listener = Listener {
            id,
            callback,
            context: context.clone(),
            once: once.then(|| Arc::new(AtomicBool::new(false))),
        };

        {
            let mut guard = self.registry.lock().expect("event registry mutex poisoned");
            guard
                .events
                .entry(name.to_string())
                .or_default()
                .push(listener);
            if let Some((namespace, _)) = split_event_name(name) {
                guard
                    .namespaces
                    .entry(namespace.to_string())
                    .or_default()
                    .insert(name.to_string());
            }
        }

        tracing::debug!(event = name, ?context, once, "subscribed");
        Ok(Subscription {
            registry: Arc::downgrade(&self.registry),
            name: name.to_string(),
            id,
        })
    }

    /// Remove one listener (`Some(id)`) or every listener of `name` (`None`).
    pub fn unsubscribe(&self, name: &str, id: Option<ListenerId>) -> bool {
        let removed = {
            let mut guard = self.registry.lock().expect("event registry mutex poisoned");
            guard.remove(name, id)
        };
        if removed {
            tracing::debug!(event = name, ?id, "unsubscribed");
        }
        removed
    }

    /// Remove every event name registered under `namespace`.
    pub fn unsubscribe_namespace(&self, namespace: &str) -> bool {
        let mut guard = self.registry.lock().expect("event registry mutex poisoned");
        let Some(names) = guard.namespaces.remove(namespace) else {
            return false;
        };

        let mut count = 0;
        for name in &names {
            if guard.events.remove(name).is_some() {
                count += 1;
            }
        }
        tracing::debug!(namespace, count, "namespace unsubscribed");
        count > 0
    }

    /// Invoke every current listener of `name` in registration order.
    ///
    /// Returns true iff at least one listener ran without failing
    /// synchronously. Async listeners are spawned and not awaited.
    pub fn publish(&self, name: &str, data: Value) -> bool {
        let listeners = self.snapshot(name);
        if listeners.is_empty() {
            tracing::debug!(event = name, "no listeners");
            return false;
        }

        let event = self.build_event(name, data);
        tracing::debug!(event = name, listeners = listeners.len(), "publishing");

        let mut executed = 0usize;
        for listener in &listeners {
            if !self.claim(name, listener) {
                continue;
            }
            match &listener.callback {
                Callback::Sync(callback) => {
                    match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                        Ok(Ok(())) => executed += 1,
                        Ok(Err(error)) => log_listener_failure(name, listener, &error.0),
                        Err(panic) => {
                            log_listener_failure(name, listener, &panic_message(panic.as_ref()))
                        }
                    }
                }
                Callback::Async(callback) => {
                    match catch_unwind(AssertUnwindSafe(|| callback(event.clone()))) {
                        Ok(future) => {
                            spawn_detached(name, listener.context.clone(), future);
                            executed += 1;
                        }
                        Err(panic) => {
                            log_listener_failure(name, listener, &panic_message(panic.as_ref()))
                        }
                    }
                }
            }
        }

        executed > 0
    }

    /// Invoke every current listener of `name` one after another, awaiting
    /// each before starting the next, and report each outcome.
    pub async fn publish_async(&self, name: &str, data: Value) -> Vec<DispatchOutcome> {
        let listeners = self.snapshot(name);
        if listeners.is_empty() {
            tracing::debug!(event = name, "no listeners");
            return Vec::new();
        }

        let event = self.build_event(name, data);
        tracing::debug!(event = name, listeners = listeners.len(), "publishing async");

        let mut outcomes = Vec::with_capacity(listeners.len());
        for listener in &listeners {
            if !self.claim(name, listener) {
                continue;
            }
            let outcome = match &listener.callback {
                Callback::Sync(callback) => {
                    match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                        Ok(Ok(())) => DispatchOutcome::Success(Value::Null),
                        Ok(Err(error)) => DispatchOutcome::Failure(error),
                        Err(panic) => DispatchOutcome::Failure(ListenerError(format!(
                            "listener panicked: {}",
                            panic_message(panic.as_ref())
                        ))),
                    }
                }
                Callback::Async(callback) => {
                    let future = AssertUnwindSafe(async { callback(event.clone()).await });
                    match future.catch_unwind().await {
                        Ok(Ok(value)) => DispatchOutcome::Success(value),
                        Ok(Err(error)) => DispatchOutcome::Failure(error),
                        Err(panic) => DispatchOutcome::Failure(ListenerError(format!(
                            "listener panicked: {}",
                            panic_message(panic.as_ref())
                        ))),
                    }
                }
            };
            if let DispatchOutcome::Failure(error) = &outcome {
                log_listener_failure(name, listener, &error.0);
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Publish to every registered name containing `pattern`, where `*`
    /// matches any run of characters. Returns how many names dispatched.
    pub fn publish_pattern(&self, pattern: &str, data: Value) -> usize {
        let matcher = match pattern_matcher(pattern) {
            Ok(matcher) => matcher,
            Err(error) => {
                tracing::warn!(pattern, "invalid event pattern: {error}");
                return 0;
            }
        };

        let mut count = 0;
        for name in self.event_names() {
            if matcher.is_match(&name) && self.publish(&name, data.clone()) {
                count += 1;
            }
        }
        tracing::debug!(pattern, count, "pattern published");
        count
    }

    pub fn listener_count(&self, name: &str) -> usize {
        let guard = self.registry.lock().expect("event registry mutex poisoned");
        guard.events.get(name).map_or(0, Vec::len)
    }

    pub fn has_listeners(&self, name: &str) -> bool {
        self.listener_count(name) > 0
    }

    pub fn event_names(&self) -> Vec<String> {
        let guard = self.registry.lock().expect("event registry mutex poisoned");
        guard.events.keys().cloned().collect()
    }

    pub fn stats(&self) -> BusStats {
        let guard = self.registry.lock().expect("event registry mutex poisoned");
        let mut stats = BusStats {
            total_events: guard.events.len(),
            namespaces: guard.namespaces.len(),
            ..BusStats::default()
        };
        for (name, listeners) in &guard.events {
            let has_once = listeners.iter().any(|listener| listener.once.is_some());
            stats.total_listeners += listeners.len();
            if has_once {
                stats.once_events += 1;
            }
            stats.events.insert(
                name.clone(),
                EventStats {
                    listener_count: listeners.len(),
                    has_once,
                },
            );
        }
        stats
    }

    /// Drop every registration, returning the stats from just before.
    pub fn clear(&self) -> BusStats {
        let stats = self.stats();
        let mut guard = self.registry.lock().expect("event registry mutex poisoned");
        guard.events.clear();
        guard.namespaces.clear();
        tracing::debug!(
            events = stats.total_events,
            listeners = stats.total_listeners,
            "bus cleared"
        );
        stats
    }

    fn snapshot(&self, name: &str) -> Vec<Listener> {
        let guard = self.registry.lock().expect("event registry mutex poisoned");
        guard.events.get(name).cloned().unwrap_or_default()
    }

    /// One-shot listeners are removed before they run and never run twice.
    fn claim(&self, name: &str, listener: &Listener) -> bool {
        let Some(fired) = &listener.once else {
            return true;
        };
        if fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.unsubscribe(name, Some(listener.id));
        true
    }

    fn build_event(&self, name: &str, payload: Value) -> BusEvent {
        BusEvent {
            id: Uuid::new_v4().to_string(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            namespace: split_event_name(name).map(|(namespace, _)| namespace.to_string()),
            name: name.to_string(),
            payload,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

fn wrap_async<F, Fut>(callback: F) -> Callback
where
    F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ListenerError>> + Send + 'static,
{
    Callback::Async(Arc::new(move |event| callback(event).boxed()))
}

fn pattern_matcher(pattern: &str) -> Result<regex::Regex, regex::Error> {
    let source = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    regex::Regex::new(&source)
}

fn spawn_detached(
    name: &str,
    context: Option<String>,
    future: BoxFuture<'static, Result<Value, ListenerError>>,
) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(event = name, "no async runtime available, async listener dropped");
        return;
    };

    let name = name.to_string();
    handle.spawn(async move {
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                tracing::error!(event = %name, ?context, "async listener failed: {error}");
            }
            Err(panic) => {
                tracing::error!(
                    event = %name,
                    ?context,
                    "async listener panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    });
}

fn log_listener_failure(name: &str, listener: &Listener, message: &str) {
    tracing::error!(
        event = name,
        listener = ?listener.id,
        context = ?listener.context,
        "listener failed: {message}"
    );
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
