//! Deckflow API: dispatcher endpoints for the upload path and the
//! worker-facing lease/progress/completion surface, backed by the queue
//! repositories.

pub mod constants;
pub mod error;
pub mod handlers;
pub mod maintenance;
pub mod services;
pub mod setup;
pub mod state;
