pub mod broker;
pub mod queue;
pub mod session;
pub mod config;
pub mod metrics;

pub use broker::Broker;
pub use config::{BrokerConfig, SessionMode};
pub use queue::TaskQueue;
pub use session::SessionHandler;
