//! The configuration plane: document model and validator, the atomically
//! replaceable snapshot store, and the two candidate producers that feed it
//! (file watcher and control-plane push client).

pub mod metrics_defs;
pub mod model;
pub mod protocol;
pub mod push;
pub mod snapshot;
pub mod store;
pub mod watcher;

pub use snapshot::{ConfigError, ConfigSource, Placement, PlacementKey, RoutingKey, Snapshot};
pub use store::{ConfigStore, ReplacementEvent};
