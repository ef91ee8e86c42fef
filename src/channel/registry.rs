//! Correlation of call ids with the handlers awaiting their replies

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::framing::{Payload, Response};

/// Receives the reply to one call.
///
/// Handlers run on the reader task, so they should hand work off rather than
/// block.
pub trait CallHandler: Send + Sync + 'static {
    /// Called with the reply payload
    fn on_data(&self, data: Payload);

    /// Called with the remote error message. Return `true` if the error was
    /// handled; `false` surfaces it as a channel-level failure.
    fn on_error(&self, message: &str) -> bool;
}

/// Closure-backed [`CallHandler`]
pub struct FnHandler<D, E> {
    on_data: D,
    on_error: E,
}

impl<D, E> FnHandler<D, E>
where
    D: Fn(Payload) + Send + Sync + 'static,
    E: Fn(&str) -> bool + Send + Sync + 'static,
{
    pub fn new(on_data: D, on_error: E) -> Self {
        Self { on_data, on_error }
    }
}

impl<D> FnHandler<D, fn(&str) -> bool>
where
    D: Fn(Payload) + Send + Sync + 'static,
{
    /// Handler that only observes data; remote errors propagate
    pub fn on_data_only(on_data: D) -> Self {
        Self {
            on_data,
            on_error: |_| false,
        }
    }
}

impl<D, E> CallHandler for FnHandler<D, E>
where
    D: Fn(Payload) + Send + Sync + 'static,
    E: Fn(&str) -> bool + Send + Sync + 'static,
{
    fn on_data(&self, data: Payload) {
        (self.on_data)(data)
    }

    fn on_error(&self, message: &str) -> bool {
        (self.on_error)(message)
    }
}

/// Single-slot handler used by blocking calls: the first reply wins
pub(crate) struct ReplySlot {
    tx: Mutex<Option<oneshot::Sender<std::result::Result<Payload, String>>>>,
}

impl ReplySlot {
    pub(crate) fn new() -> (Self, oneshot::Receiver<std::result::Result<Payload, String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl CallHandler for ReplySlot {
    fn on_data(&self, data: Payload) {
        if let Some(tx) = self.tx.lock().take() {
            // Receiver gone means the caller already gave up
            let _ = tx.send(Ok(data));
        }
    }

    fn on_error(&self, message: &str) -> bool {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(Err(message.to_string()));
        }
        true
    }
}

/// What happened to a decoded reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Data handed to its handler
    Delivered,
    /// Error handed to a handler that marked it handled
    Suppressed,
    /// Error nobody handled
    Unhandled(String),
    /// No handler registered under the id
    Orphan,
    /// The handler panicked; the reply is lost
    HandlerPanicked,
}

/// Maps call ids to pending handlers. Each channel owns one.
pub struct CorrelationRegistry {
    /// Distinguishes ids of this channel instance from any other
    discriminator: String,

    /// Call id counter, scoped to the channel
    counter: AtomicU64,

    /// Handlers awaiting a reply
    pending: Mutex<HashMap<String, Box<dyn CallHandler>>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self {
            discriminator: uuid[..8].to_string(),
            counter: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve an id and store the handler under it.
    ///
    /// Without a handler the call is fire-and-forget: the id is empty and
    /// nothing is stored.
    pub fn reserve(&self, handler: Option<Box<dyn CallHandler>>) -> String {
        let Some(handler) = handler else {
            return String::new();
        };
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}_{}", self.discriminator, seq);
        self.pending.lock().insert(id.clone(), handler);
        id
    }

    /// Remove and return the handler for `id`
    pub fn take(&self, id: &str) -> Option<Box<dyn CallHandler>> {
        self.pending.lock().remove(id)
    }

    /// Drop the handler for `id` without invoking it
    pub fn forget(&self, id: &str) -> bool {
        self.take(id).is_some()
    }

    /// Drop every pending handler, returning how many there were
    pub fn clear(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route a reply to its handler. A handler fires at most once.
    pub fn dispatch(&self, response: Response) -> DispatchOutcome {
        let Some(handler) = self.take(response.id()) else {
            return DispatchOutcome::Orphan;
        };

        // The lock is released before user code runs
        let outcome = catch_unwind(AssertUnwindSafe(|| match response {
            Response::Data { data, .. } => {
                handler.on_data(data);
                DispatchOutcome::Delivered
            }
            Response::Error { message, .. } => {
                if handler.on_error(&message) {
                    DispatchOutcome::Suppressed
                } else {
                    DispatchOutcome::Unhandled(message)
                }
            }
        }));

        outcome.unwrap_or(DispatchOutcome::HandlerPanicked)
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn recording_handler() -> (Box<dyn CallHandler>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let data_log = log.clone();
        let error_log = log.clone();
        let handler = FnHandler::new(
            move |data: Payload| data_log.lock().push(format!("data:{}", json!(data))),
            move |message: &str| {
                error_log.lock().push(format!("error:{}", message));
                message != "unhandled"
            },
        );
        (Box::new(handler), log)
    }

    fn data(id: &str, value: serde_json::Value) -> Response {
        Response::Data {
            id: id.to_string(),
            data: value.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_reserved_ids_are_unique() {
        let registry = CorrelationRegistry::new();
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            let (handler, _) = recording_handler();
            assert!(ids.insert(registry.reserve(Some(handler))));
        }
        assert_eq!(registry.len(), 1000);
    }

    #[test]
    fn test_ids_differ_across_registries() {
        let a = CorrelationRegistry::new();
        let b = CorrelationRegistry::new();
        let (ha, _) = recording_handler();
        let (hb, _) = recording_handler();
        assert_ne!(a.reserve(Some(ha)), b.reserve(Some(hb)));
    }

    #[test]
    fn test_fire_and_forget_stores_nothing() {
        let registry = CorrelationRegistry::new();
        assert_eq!(registry.reserve(None), "");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dispatch_is_pop_once() {
        let registry = CorrelationRegistry::new();
        let (handler, log) = recording_handler();
        let id = registry.reserve(Some(handler));

        assert_eq!(
            registry.dispatch(data(&id, json!({"n": 1}))),
            DispatchOutcome::Delivered
        );
        assert_eq!(
            registry.dispatch(data(&id, json!({"n": 2}))),
            DispatchOutcome::Orphan
        );
        assert_eq!(*log.lock(), vec!["data:{\"n\":1}".to_string()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dispatch_errors() {
        let registry = CorrelationRegistry::new();

        let (handler, _) = recording_handler();
        let id = registry.reserve(Some(handler));
        let outcome = registry.dispatch(Response::Error {
            id,
            message: "boom".to_string(),
        });
        assert_eq!(outcome, DispatchOutcome::Suppressed);

        let (handler, _) = recording_handler();
        let id = registry.reserve(Some(handler));
        let outcome = registry.dispatch(Response::Error {
            id,
            message: "unhandled".to_string(),
        });
        assert_eq!(outcome, DispatchOutcome::Unhandled("unhandled".to_string()));
    }

    #[test]
    fn test_orphan_error_is_dropped() {
        let registry = CorrelationRegistry::new();
        let outcome = registry.dispatch(Response::Error {
            id: "nobody".to_string(),
            message: "late".to_string(),
        });
        assert_eq!(outcome, DispatchOutcome::Orphan);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let registry = CorrelationRegistry::new();
        let id = registry.reserve(Some(Box::new(FnHandler::on_data_only(|_: Payload| {
            panic!("handler bug")
        }))));
        assert_eq!(
            registry.dispatch(data(&id, json!({}))),
            DispatchOutcome::HandlerPanicked
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reply_slot_keeps_first_reply() {
        let (slot, mut rx) = ReplySlot::new();
        slot.on_data(json!({"first": true}).as_object().cloned().unwrap());
        assert!(slot.on_error("second"));
        let reply = rx.try_recv().unwrap().unwrap();
        assert_eq!(reply.get("first"), Some(&json!(true)));
    }

    #[test]
    fn test_forget_and_clear() {
        let registry = CorrelationRegistry::new();
        let (h1, _) = recording_handler();
        let (h2, _) = recording_handler();
        let id = registry.reserve(Some(h1));
        registry.reserve(Some(h2));

        assert!(registry.forget(&id));
        assert!(!registry.forget(&id));
        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
    }
}
