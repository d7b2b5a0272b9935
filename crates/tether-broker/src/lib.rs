pub mod broker;
pub mod config;
pub mod error;
pub mod fencing;
pub mod registry;
pub mod session;

mod manager;
mod writer;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use error::BrokerError;
pub use registry::{InMemoryRegistry, Resource, ResourceRegistry};
pub use session::SessionId;
