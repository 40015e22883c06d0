pub mod alerting;
pub mod capture;
pub mod commands;
pub mod config;
pub mod events;
pub mod monitor;
pub mod native;
pub mod persistence;
pub mod scoring;
pub mod utils;

pub use commands::{Collaborators, Command, CommandResponse, MonitorEngine};
pub use config::EngineConfig;
pub use events::ChangeEvent;
