pub mod config;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod stages;
