//! # MQTT transport
//!
//! Everything that touches the broker or its wire formats lives here. The
//! bridge core above only sees decoded readings, acknowledgements and a
//! `CommandPublisher`.
//!
//! ```text
//! mqtt/
//! ├── topic.rs            - Subscription patterns and command topic templates
//! ├── codec.rs            - JSON decoding of telemetry/acks, command encoding
//! ├── publish_tracker.rs  - Waits for PubAck/PubComp of outbound publishes
//! └── connection.rs       - Connection state machine and ConnectionManager
//! ```
//!
//! The connection runs as a statum typestate machine
//! (`Disconnected -> Connecting -> Connected`) on its own task and falls
//! back to `Connecting` after any transport error, retrying on a fixed
//! interval until cancelled.

pub mod codec;
pub mod connection;
pub mod publish_tracker;
pub mod topic;
