pub mod api;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod entity;
pub mod push;
pub mod registry;
pub mod snapshot;

#[cfg(test)]
mod mock;

pub use cache::CacheEntry;
pub use cache::EntityStateCache;
pub use config::format_diagnostics;
pub use config::Config;
pub use config::Diagnostic;
pub use config::LogLevel;
pub use coordinator::Coordinator;
pub use coordinator::CoordinatorEvent;
pub use coordinator::PollSettings;
pub use dispatcher::CommandDispatcher;
pub use dispatcher::CommandError;
pub use entity::UnitSystem;
pub use push::PushListener;
pub use registry::DeviceRegistry;
pub use snapshot::Metric;
pub use snapshot::Snapshot;
