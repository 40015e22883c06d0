pub mod models;
pub mod poll;
pub mod registry;
pub mod scheduler;
