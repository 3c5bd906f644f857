//! Per-printer notification hub.
//!
//! Every printer owns one [`EventBus`]. The job controller, the listen
//! thread and the firmware update thread publish into it; callers either
//! register a filtered handler or take a channel receiver.

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::events::{EventCategory, PrinterEvent};

/// Events buffered per receiver before a slow one starts lagging
pub const RECEIVER_BACKLOG: usize = 256;

/// Which events a handler wants
#[derive(Debug, Clone, Default)]
pub enum EventFilter {
    /// Receive all events.
    #[default]
    All,
    /// Receive events matching any of these categories.
    Categories(Vec<EventCategory>),
}

impl EventFilter {
    /// Check if an event matches this filter
    pub fn matches(&self, event: &PrinterEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Categories(categories) => categories.contains(&event.category()),
        }
    }
}

struct Handler {
    filter: EventFilter,
    callback: Box<dyn Fn(PrinterEvent) + Send + Sync>,
}

/// Publish/subscribe hub for one printer's notifications
///
/// Handlers run synchronously on the publishing thread (often the listen
/// thread), so they must return quickly. Consumers that want to do real
/// work should take a [`receiver`](EventBus::receiver) instead.
pub struct EventBus {
    channel: broadcast::Sender<PrinterEvent>,
    handlers: RwLock<Vec<Handler>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(RECEIVER_BACKLOG);
        Self {
            channel,
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Deliver an event to matching handlers, then to every receiver
    ///
    /// Returns how many handlers and receivers saw it. Nobody listening is
    /// not an error.
    pub fn publish(&self, event: PrinterEvent) -> usize {
        tracing::trace!("event: {}", event.description());

        let handlers = self.handlers.read();
        let mut delivered = 0;
        for handler in handlers.iter().filter(|h| h.filter.matches(&event)) {
            (handler.callback)(event.clone());
            delivered += 1;
        }
        drop(handlers);

        delivered + self.channel.send(event).unwrap_or(0)
    }

    /// Register a handler for the events `filter` accepts
    ///
    /// Handlers live as long as the printer.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F)
    where
        F: Fn(PrinterEvent) + Send + Sync + 'static,
    {
        tracing::debug!("Event handler added ({:?})", filter);
        self.handlers.write().push(Handler {
            filter,
            callback: Box::new(handler),
        });
    }

    /// Channel receiver seeing every event published from now on
    ///
    /// Works from async tasks (`recv().await`) as well as plain threads
    /// (`try_recv`, `blocking_recv`).
    pub fn receiver(&self) -> broadcast::Receiver<PrinterEvent> {
        self.channel.subscribe()
    }

    /// Registered handlers plus open receivers
    pub fn listener_count(&self) -> usize {
        self.handlers.read().len() + self.channel.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PrinterState;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn connected() -> PrinterEvent {
        PrinterEvent::StateChanged {
            from: PrinterState::Connecting,
            to: PrinterState::Connected,
        }
    }

    #[test]
    fn test_publish_without_listeners() {
        let bus = EventBus::new();
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(bus.publish(connected()), 0);
    }

    #[test]
    fn test_handlers_see_events_in_publish_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        bus.subscribe(EventFilter::All, move |event| {
            log.lock().push(event.category());
        });

        assert_eq!(bus.publish(connected()), 1);
        bus.publish(PrinterEvent::FirmwareUpdateProgress(50.0));
        assert_eq!(
            *seen.lock(),
            vec![EventCategory::State, EventCategory::Firmware]
        );
    }

    #[test]
    fn test_category_filter() {
        let bus = EventBus::new();
        let faults = Arc::new(AtomicUsize::new(0));
        let states = Arc::new(AtomicUsize::new(0));

        let f = faults.clone();
        bus.subscribe(EventFilter::Categories(vec![EventCategory::Fault]), move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = states.clone();
        bus.subscribe(EventFilter::Categories(vec![EventCategory::State]), move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(connected());
        bus.publish(PrinterEvent::Fault {
            message: "Printer halted".to_string(),
        });
        assert_eq!(bus.publish(PrinterEvent::FirmwareInvalidated), 0);

        assert_eq!(faults.load(Ordering::SeqCst), 1);
        assert_eq!(states.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_receiver_gets_events_after_handlers() {
        let bus = EventBus::new();
        bus.subscribe(EventFilter::All, |_| {});
        let mut receiver = bus.receiver();
        assert_eq!(bus.listener_count(), 2);

        assert_eq!(bus.publish(connected()), 2);
        match receiver.try_recv() {
            Ok(PrinterEvent::StateChanged { to, .. }) => assert_eq!(to, PrinterState::Connected),
            other => panic!("Wrong event received: {:?}", other),
        }
        assert!(receiver.try_recv().is_err());
    }
}
