//! Typed observer lists.
//!
//! # Responsibilities
//! - Ordered subscribe/unsubscribe/raise for each exposed event
//! - Guarantee handlers run in subscription order
//! - Fallible variant for the request pipeline, where a handler error
//!   aborts the remaining stages
//!
//! # Design Decisions
//! - Handlers are cloned out of the list before invocation so a handler may
//!   subscribe or unsubscribe without deadlocking the event
//! - Unsubscription is by token, not by handler identity

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Boxed error produced by a pipeline handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Token returned by `subscribe`, used to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(usize);

static NEXT_SUBSCRIPTION: AtomicUsize = AtomicUsize::new(1);

fn next_token() -> usize {
    NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed)
}

/// Ordered list of infallible handlers for one event.
pub struct EventHandlers<T: ?Sized> {
    handlers: Mutex<Vec<(usize, Arc<dyn Fn(&mut T) + Send + Sync>)>>,
}

impl<T: ?Sized> EventHandlers<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        let token = next_token();
        self.handlers
            .lock()
            .unwrap()
            .push((token, Arc::new(handler)));
        Subscription(token)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.handlers
            .lock()
            .unwrap()
            .retain(|(token, _)| *token != subscription.0);
    }

    /// Invoke every handler in subscription order.
    pub fn raise(&self, args: &mut T) {
        let snapshot: Vec<_> = self
            .handlers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler(args);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().unwrap().is_empty()
    }
}

impl<T: ?Sized> Default for EventHandlers<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered list of fallible handlers for one pipeline stage.
///
/// `raise` stops at the first handler that returns an error and hands that
/// error back to the caller; later handlers do not run.
pub struct PipelineHandlers<T: ?Sized> {
    handlers: Mutex<Vec<(usize, Arc<dyn Fn(&mut T) -> Result<(), HandlerError> + Send + Sync>)>>,
}

impl<T: ?Sized> PipelineHandlers<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&mut T) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let token = next_token();
        self.handlers
            .lock()
            .unwrap()
            .push((token, Arc::new(handler)));
        Subscription(token)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.handlers
            .lock()
            .unwrap()
            .retain(|(token, _)| *token != subscription.0);
    }

    pub fn raise(&self, args: &mut T) -> Result<(), HandlerError> {
        let snapshot: Vec<_> = self
            .handlers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler(args)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().unwrap().is_empty()
    }
}

impl<T: ?Sized> Default for PipelineHandlers<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn handlers_run_in_subscription_order() {
        let event: EventHandlers<Vec<&'static str>> = EventHandlers::new();
        event.subscribe(|log| log.push("first"));
        event.subscribe(|log| log.push("second"));
        event.subscribe(|log| log.push("third"));

        let mut log = Vec::new();
        event.raise(&mut log);
        assert_eq!(log, vec!["first", "second", "third"]);
    }

    #[test]
    fn unsubscribe_removes_only_the_named_handler() {
        let event: EventHandlers<Vec<&'static str>> = EventHandlers::new();
        event.subscribe(|log| log.push("keep"));
        let token = event.subscribe(|log| log.push("drop"));
        event.unsubscribe(token);

        let mut log = Vec::new();
        event.raise(&mut log);
        assert_eq!(log, vec!["keep"]);
    }

    #[test]
    fn pipeline_stops_at_first_error() {
        let stage: PipelineHandlers<u32> = PipelineHandlers::new();
        let calls = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&calls);
        stage.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        stage.subscribe(|_| Err("boom".into()));
        let c = Arc::clone(&calls);
        stage.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut arg = 0;
        let result = stage.raise(&mut arg);
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_unsubscribe_itself_during_raise() {
        let event: Arc<EventHandlers<u32>> = Arc::new(EventHandlers::new());
        let token_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let ev = Arc::clone(&event);
        let slot = Arc::clone(&token_slot);
        let token = event.subscribe(move |count| {
            *count += 1;
            if let Some(token) = slot.lock().unwrap().take() {
                ev.unsubscribe(token);
            }
        });
        *token_slot.lock().unwrap() = Some(token);

        let mut count = 0;
        event.raise(&mut count);
        event.raise(&mut count);
        assert_eq!(count, 1);
    }
}
