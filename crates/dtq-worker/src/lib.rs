pub mod worker;
pub mod handler;
pub mod executor;
pub mod config;

pub use worker::{CycleOutcome, Worker};
pub use handler::{EchoHandler, SimulatedHandler, TaskHandler};
pub use executor::TaskExecutor;
pub use config::WorkerConfig;
