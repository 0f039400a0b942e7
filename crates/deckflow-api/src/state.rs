//! Application state shared by all handlers.

use sqlx::PgPool;

use crate::services::DispatchService;
use deckflow_core::Config;
use deckflow_db::{DeckRepository, TaskRepository, WorkerRepository};

pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub tasks: TaskRepository,
    pub workers: WorkerRepository,
    pub decks: DeckRepository,
    pub dispatch: DispatchService,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let tasks = TaskRepository::new(pool.clone());
        let workers = WorkerRepository::new(pool.clone());
        let decks = DeckRepository::new(pool.clone());
        let dispatch = DispatchService::new(tasks.clone(), decks.clone(), config.queue.clone());

        Self {
            pool,
            config,
            tasks,
            workers,
            decks,
            dispatch,
        }
    }
}
