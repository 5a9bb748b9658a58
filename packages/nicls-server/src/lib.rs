pub mod acquisition;
pub mod bus;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod data_log;
pub mod jobs;
pub mod protocol;
pub mod signal_processing;

pub use bus::{EventBus, PublisherId, Topic};
pub use config::{ExperimentConfig, ServerConfig};
pub use protocol::{ServerContext, TaskServer};
