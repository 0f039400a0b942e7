use serde::{Deserialize, Serialize};

/// Ordering constraint between tasks. A `success_only` dependent runs only
/// when its upstream completed successfully; a `completion` dependent runs on
/// any terminal upstream outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "dependency_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DependencyMode {
    Completion,
    SuccessOnly,
}

/// Dependency declaration in an enqueue request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencySpec {
    pub depends_on_id: i64,
    #[serde(default = "DependencySpec::default_mode")]
    pub mode: DependencyMode,
}

impl DependencySpec {
    fn default_mode() -> DependencyMode {
        DependencyMode::SuccessOnly
    }
}
