//! # devicelink
//!
//! Device-side client for an MQTT-based IoT platform.
//!
//! ```text
//! src/
//! ├── config.rs     - identity and connection settings, TOML loading
//! ├── error.rs      - error taxonomy
//! ├── mqtt/         - transport seam, credentials, reconnection, offline buffer
//! ├── protocol/     - payload schemas, handlers and the inbound dispatcher
//! ├── rules/        - local rule evaluation and timer scheduling
//! ├── persistence/  - cached provisioning result
//! └── device.rs     - the facade applications talk to
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod mqtt;
pub mod persistence;
pub mod protocol;
pub mod rules;

pub use config::{ConnectionConfig, DeviceConfig, DeviceIdentity};
pub use device::IotDevice;
pub use protocol::DeviceHandlers;
