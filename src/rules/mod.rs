//! # Local Rule Engine
//!
//! Evaluates platform-authored automation rules on the device, so they keep
//! working while the platform is unreachable.
//!
//! ```text
//! rules/
//! ├── model.rs       - wire form of rule definitions
//! ├── time_range.rs  - weekday and time-of-day windows
//! ├── condition.rs   - device-data comparisons
//! ├── timer.rs       - DAILY_TIMER and SIMPLE_TIMER jobs
//! ├── registry.rs    - membership, definitions and timers with their locks
//! └── engine.rs      - push handling, reactive evaluation, config requests
//! ```
//!
//! Rules fire in two ways. A successful property report is checked against
//! every installed rule before the report call returns. Timer conditions run
//! on their own tasks and are cancelled whenever their rule is replaced or
//! removed.

pub mod condition;
pub mod engine;
pub mod model;
pub mod registry;
pub mod time_range;
pub mod timer;

pub use engine::{CommandActionHandler, RuleEngine};
pub use model::{RuleDefinition, RULE_SERVICE_ID};
pub use registry::{InstallOutcome, RuleRegistry};
pub use timer::TimerJob;
