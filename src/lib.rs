//! client-queue – durable per-client MQTT delivery queues.
//!
//! This crate exports
//!  * `core`    – queue engine, entries, policies and the async writer facade
//!  * `storage` – per-bucket transaction journals (in-memory and file-backed)
//!  * `config`  – TOML + environment driven runtime configuration
//!  * `logging` – tracing subscriber setup
//!
//! The engine consumes already-decoded PUBLISH/PUBREL values; wire framing,
//! topic matching and networking live upstream.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;
pub mod storage;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use crate::config::Config;
pub use crate::core::{
    ClientQueuePersistence, ClientQueueService, DiscardPolicy, InMemoryPayloadStore,
    InflightMessage, LoggingDropService, MessageDroppedService, PayloadPersistence, Publish,
    Pubrel, Qos, QueueError, QueueResult, QueuedMessage,
};
