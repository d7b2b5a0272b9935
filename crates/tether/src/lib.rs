pub mod client;
pub mod codec;
pub mod protocol;

/// Generated wire types, for callers that need raw frames.
pub use tether_proto as proto;

/// Default broker address. Loopback only; clients run on the same host.
pub const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:13000";
