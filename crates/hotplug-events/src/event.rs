//! Lifecycle event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata attached to every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique id of this event.
    pub event_id: Uuid,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Component that emitted the event.
    pub source: String,
}

impl EventMetadata {
    /// Create metadata stamped with the current time.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
        }
    }
}

/// A plugin lifecycle notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginEvent {
    /// An install has started for a plugin.
    Building {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin name (the id is not known until the manifest is read).
        name: String,
    },
    /// A plugin has been registered or installed and can be loaded.
    Ready {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin identifier, when one has been assigned.
        plugin_id: Option<String>,
        /// Plugin name.
        name: String,
    },
    /// A plugin's components are now active on the host.
    Loaded {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin identifier.
        plugin_id: String,
        /// Plugin name.
        name: String,
    },
    /// A plugin's components have been removed from the host.
    Unloaded {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin identifier.
        plugin_id: String,
        /// Plugin name.
        name: String,
    },
    /// A lifecycle operation failed.
    Error {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin identifier, when one has been assigned.
        plugin_id: Option<String>,
        /// Plugin name.
        name: String,
        /// Failure message.
        error: String,
    },
}

impl PluginEvent {
    /// The `plugin:*` event name.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Building { .. } => "plugin:building",
            Self::Ready { .. } => "plugin:ready",
            Self::Loaded { .. } => "plugin:loaded",
            Self::Unloaded { .. } => "plugin:unloaded",
            Self::Error { .. } => "plugin:error",
        }
    }

    /// Event metadata.
    #[must_use]
    pub fn metadata(&self) -> &EventMetadata {
        match self {
            Self::Building { metadata, .. }
            | Self::Ready { metadata, .. }
            | Self::Loaded { metadata, .. }
            | Self::Unloaded { metadata, .. }
            | Self::Error { metadata, .. } => metadata,
        }
    }

    /// Name of the plugin the event concerns.
    #[must_use]
    pub fn plugin_name(&self) -> &str {
        match self {
            Self::Building { name, .. }
            | Self::Ready { name, .. }
            | Self::Loaded { name, .. }
            | Self::Unloaded { name, .. }
            | Self::Error { name, .. } => name,
        }
    }
}
