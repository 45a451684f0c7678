pub mod bridge;
pub mod config;
pub mod error;
pub mod model;
pub mod mqtt;

pub use bridge::stream::{LiveStream, StreamEvent};
pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::BridgeError;
