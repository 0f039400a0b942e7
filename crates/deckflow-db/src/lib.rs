//! Database repositories for the Deckflow queue.
//!
//! The task repository is the single coordination point between the API tier
//! and workers: every lease, progress report, and completion goes through a
//! serialisable transaction here. The worker repository owns worker liveness;
//! the deck repository owns the parent-deck projection.

pub mod db;

pub use db::deck::DeckRepository;
pub use db::task::{LeaseSweep, TaskRepository, TASK_NOTIFY_CHANNEL};
pub use db::worker::WorkerRepository;
