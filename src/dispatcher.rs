//! Topic-keyed in-process pub/sub used between transports, the registry and
//! the entity layer.

use crate::error::Result;
use futures_core::stream::Stream;
use log::warn;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A signal handler. Handlers run synchronously inside [`Dispatcher::send`]
/// and must hand long work off to a spawned task.
pub type Handler = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

/// Maps a signal name to its handlers, invoked in registration order.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` on `signal`. Registering the same handler twice
    /// on one signal is a no-op; returns whether it was added.
    pub fn connect(&self, signal: impl Into<String>, handler: Handler) -> bool {
        let mut guard = self.handlers.write();
        let list = guard.entry(signal.into()).or_default();
        if list.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return false;
        }
        list.push(handler);
        true
    }

    /// Wraps a closure into a [`Handler`], registers it and returns the handle
    /// needed for [`disconnect`](Self::disconnect).
    pub fn connect_fn<F>(&self, signal: impl Into<String>, f: F) -> Handler
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(f);
        self.connect(signal, handler.clone());
        handler
    }

    pub fn disconnect(&self, signal: &str, handler: &Handler) -> bool {
        let mut guard = self.handlers.write();
        let Some(list) = guard.get_mut(signal) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| !Arc::ptr_eq(h, handler));
        let removed = list.len() != before;
        if list.is_empty() {
            guard.remove(signal);
        }
        removed
    }

    /// Invokes every handler registered on `signal` and returns how many ran.
    /// A failing handler is logged and does not stop the others.
    pub fn send(&self, signal: &str, payload: &Value) -> usize {
        // Snapshot so handlers may connect or send re-entrantly.
        let handlers = match self.handlers.read().get(signal) {
            Some(list) => list.clone(),
            None => return 0,
        };
        for handler in &handlers {
            if let Err(e) = (**handler)(payload) {
                warn!("Handler for signal '{}' failed: {}", signal, e);
            }
        }
        handlers.len()
    }

    pub fn has_handlers(&self, signal: &str) -> bool {
        self.handlers.read().contains_key(signal)
    }

    /// Drops every registration.
    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    /// Returns a Stream of every payload published on `signal` from now on.
    pub fn stream(&self, signal: &str) -> impl Stream<Item = Value> + Send + 'static {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.connect_fn(signal, move |payload| {
            // A dropped stream only leaves an inert handler behind.
            let _ = tx.send(payload.clone());
            Ok(())
        });
        async_stream::stream! {
            while let Some(payload) = rx.recv().await {
                yield payload;
            }
        }
    }
}
