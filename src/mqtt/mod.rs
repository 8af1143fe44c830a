//! # MQTT Connection Module
//!
//! Keeps one authenticated session to the platform broker alive for the
//! lifetime of the device and hides transient failures from the application.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── transport.rs       - Transport/session traits and connect options
//! ├── rumqtt.rs          - rumqttc implementation of the transport
//! ├── tls.rs             - trust root loading and chain-based verification
//! ├── credentials.rs     - HMAC password and client id derivation
//! ├── backoff.rs         - exponential backoff with jitter
//! ├── offline_buffer.rs  - bounded FIFO of publishes made while disconnected
//! ├── provisioning.rs    - one-shot handshake resolving the real broker
//! ├── topics.rs          - topic templates and request-id correlation
//! └── connection.rs      - the connection manager tying it together
//! ```
//!
//! ## Connection Lifecycle
//!
//! 1. Optionally resolve the broker through provisioning, or reuse the
//!    cached server record from a previous run.
//! 2. Derive fresh credentials for the current hour and open a session.
//! 3. Subscribe to the platform downlink topics and any application topics.
//! 4. Drain the offline buffer in order.
//! 5. On loss, notify the listener and run the same loop again.
//!
//! Failed attempts sleep per the backoff policy and retry until success while
//! auto-reconnect is enabled. Only configuration problems are fatal, and those
//! surface when the manager is built.

pub mod backoff;
pub mod connection;
pub mod credentials;
pub mod offline_buffer;
pub mod provisioning;
pub mod rumqtt;
pub mod tls;
pub mod topics;
pub mod transport;

pub use connection::{
    publish_json, ConnectionListener, ConnectionManager, ConnectionState, InboundMessage,
    Publisher,
};
pub use rumqtt::RumqttTransport;
pub use transport::{ConnectOptions, EventSink, Transport, TransportEvent, TransportSession};
