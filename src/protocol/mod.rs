//! # Protocol Module
//!
//! Turns inbound (topic, payload) pairs into typed requests, hands them to the
//! application's handlers and publishes the correlated responses.
//!
//! ## Module Architecture
//!
//! ```text
//! protocol/
//! ├── model.rs           - JSON payload schemas for every topic category
//! ├── handlers.rs        - application capability traits and the handler set
//! ├── events.rs          - typed view of `events/down` service events
//! ├── worker_pool.rs     - bounded, non-blocking task pool
//! ├── file_urls.rs       - upload/download URLs keyed by object name
//! ├── log_collection.rs  - platform-triggered log harvesting loops
//! └── dispatcher.rs      - classification and routing of inbound messages
//! ```
//!
//! ## Dispatch Flow
//!
//! 1. The connection supervisor forwards every inbound message to the queue
//!    the [`Dispatcher`] drains.
//! 2. Each message is handled on a pool slot; a full pool drops it with a
//!    warning instead of stalling the transport.
//! 3. Topics registered at runtime are checked first, then the category is
//!    derived from the topic suffix.
//! 4. Request/response categories answer on the response topic carrying the
//!    same `request_id`.
//!
//! A payload that fails to decode is logged and dropped; the handler is not
//! called and no response is sent.

pub mod dispatcher;
pub mod events;
pub mod file_urls;
pub mod handlers;
pub mod log_collection;
pub mod model;
pub mod worker_pool;

pub use dispatcher::Dispatcher;
pub use events::{FileAction, PlatformEvent};
pub use file_urls::FileUrlTable;
pub use handlers::{
    CommandHandler, DeviceHandlers, LogCategory, LogCollector, MessageHandler, OtaHandler,
    PropertiesSetHandler, PropertyQueryHandler, RawMessageHandler, RuleActionHandler,
    ShadowResponseHandler, SubDeviceHandler, TimeSyncHandler, UpgradeKind,
};
pub use worker_pool::WorkerPool;
