//! # Persistence Module
//!
//! The client keeps exactly one piece of state on disk: the broker address and
//! secret resolved by the provisioning handshake. It is written after every
//! successful handshake and read on startup so a provisioned device skips
//! the handshake on later runs.
//!
//! ## Error Handling Strategy
//! A missing or corrupt record is not an error, it simply means the device
//! provisions again. Only failures while writing are reported, and the
//! connection manager logs them without failing the connect attempt.

pub mod server_record;

pub use server_record::{ServerRecord, ServerRecordStore};
