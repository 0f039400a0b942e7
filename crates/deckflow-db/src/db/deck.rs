//! Deck repository: the queue's projection of the user-facing pitch deck.
//!
//! The completion handler (task repository) is the sole writer of
//! `processing_status` and `results_file_path`; this repository only creates
//! decks, reads them, and maintains the dispatcher's
//! `current_processing_task_id` pointer.

use sqlx::{PgPool, Postgres};

use deckflow_core::models::Deck;
use deckflow_core::AppError;

const DECK_COLUMNS: &str = "id, company_id, file_path, processing_status, results_file_path, \
     current_processing_task_id, created_at, updated_at";

#[derive(Clone)]
pub struct DeckRepository {
    pool: PgPool,
}

impl DeckRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self))]
    pub async fn create_deck(&self, company_id: &str, file_path: &str) -> Result<Deck, AppError> {
        if file_path.trim().is_empty() {
            return Err(AppError::InvalidInput("file_path must not be empty".to_string()));
        }
        let sql = format!(
            "INSERT INTO decks (company_id, file_path) VALUES ($1, $2) RETURNING {DECK_COLUMNS}"
        );
        let deck = sqlx::query_as::<Postgres, Deck>(&sql)
            .bind(company_id)
            .bind(file_path)
            .fetch_one(&self.pool)
            .await?;

        tracing::info!(deck_id = deck.id, company_id, "Deck created");
        Ok(deck)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_deck(&self, deck_id: i64) -> Result<Option<Deck>, AppError> {
        let sql = format!("SELECT {DECK_COLUMNS} FROM decks WHERE id = $1");
        let deck = sqlx::query_as::<Postgres, Deck>(&sql)
            .bind(deck_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(deck)
    }

    /// Point the deck at the head of its current analysis chain. Weak
    /// back-reference: tasks never dereference it.
    #[tracing::instrument(skip(self))]
    pub async fn set_current_task(&self, deck_id: i64, task_id: i64) -> Result<Deck, AppError> {
        let sql = format!(
            "UPDATE decks SET current_processing_task_id = $2, updated_at = NOW() \
             WHERE id = $1 RETURNING {DECK_COLUMNS}"
        );
        let deck = sqlx::query_as::<Postgres, Deck>(&sql)
            .bind(deck_id)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Deck {} not found", deck_id)))?;
        Ok(deck)
    }
}
