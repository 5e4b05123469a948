//! Lifecycle event bus for the hotplug plugin lifecycle manager.
//!
//! The manager publishes a [`PluginEvent`] for every lifecycle step
//! (`plugin:building`, `plugin:ready`, `plugin:loaded`, `plugin:unloaded`,
//! `plugin:error`). Adapters subscribe with [`EventBus::subscribe`] and
//! poll the returned [`EventReceiver`].
//!
//! # Example
//!
//! ```rust
//! use hotplug_events::{EventBus, EventMetadata, PluginEvent};
//!
//! # async fn example() {
//! let bus = EventBus::new();
//! let mut receiver = bus.subscribe();
//!
//! bus.publish(PluginEvent::Loaded {
//!     metadata: EventMetadata::new("manager"),
//!     plugin_id: "0b7f…".to_string(),
//!     name: "weather".to_string(),
//! });
//!
//! let event = receiver.recv().await.unwrap();
//! assert_eq!(event.event_type(), "plugin:loaded");
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod bus;
mod event;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventReceiver};
pub use event::{EventMetadata, PluginEvent};
