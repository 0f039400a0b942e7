//! Core domain types for the Deckflow processing queue: task, worker, deck,
//! and progress models, configuration, and the shared error type.

pub mod config;
pub mod error;
pub mod models;

pub use config::{BaseConfig, Config, QueueConfig, WorkerConfig};
pub use error::{AppError, LogLevel};
