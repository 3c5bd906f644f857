//! # Event Bus Module
//!
//! Typed observer interface between the printer and its external
//! collaborators. Each printer owns one bus; there is no global instance.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fdmlink_core::event_bus::{EventBus, EventCategory, EventFilter, PrinterEvent};
//!
//! let bus = EventBus::new();
//! bus.subscribe(
//!     EventFilter::Categories(vec![EventCategory::Fault]),
//!     |event| {
//!         if let PrinterEvent::Fault { message } = event {
//!             eprintln!("printer fault: {}", message);
//!         }
//!     },
//! );
//!
//! let mut updates = bus.receiver();
//! while let Ok(event) = updates.try_recv() {
//!     println!("{}", event.description());
//! }
//! ```

mod bus;
mod events;

pub use bus::*;
pub use events::*;
