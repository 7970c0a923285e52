//! Connection registry, routing, and lifecycle engine (§4.2, §4.3).

pub mod connection;
pub mod manager;
pub mod registry;
pub mod selector;
pub mod writer;

pub use connection::Connection;
pub use manager::{Hub, HubStats, SendResult};
pub use registry::ConnectionRegistry;
pub use selector::Selector;
pub use writer::ConnectionWriter;
