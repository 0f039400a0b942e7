//! Analyser seam.
//!
//! The queue does not know what analysis means; it hands a claimed task to an
//! [`Analyzer`] and expects an outcome. The production implementation posts
//! the task to the GPU processor's HTTP endpoint. Because a crashed worker
//! causes re-execution, analyser side effects on shared storage must be
//! overwrite-idempotent.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use deckflow_core::models::TaskResponse;
use deckflow_core::WorkerConfig;

/// Result of a successful analysis: where the results landed on shared
/// storage, plus processor-reported metadata.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub result_path: String,
    pub metadata: serde_json::Value,
}

/// Where the analyser reports progress. Each report renews the task lease;
/// a failed report whose cause is a lost lease cancels the analysis through
/// the token handed to [`Analyzer::analyze`].
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(
        &self,
        progress: i32,
        step_name: Option<&str>,
        message: Option<&str>,
    ) -> Result<()>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Run the analysis for a claimed task. Implementations must observe
    /// `cancel` and abort promptly when it fires.
    async fn analyze(
        &self,
        task: &TaskResponse,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<AnalysisOutcome>;
}

/// Request sent to the GPU processor.
#[derive(Debug, serde::Serialize)]
struct ProcessorRequest<'a> {
    task_id: i64,
    task_kind: String,
    file_path: &'a str,
    company_id: &'a str,
    options: &'a serde_json::Value,
}

/// Response from the GPU processor.
#[derive(Debug, serde::Deserialize)]
struct ProcessorResponse {
    results_file_path: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

/// Drives the GPU processor over HTTP.
pub struct HttpAnalyzer {
    client: reqwest::Client,
    processor_url: String,
}

impl HttpAnalyzer {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.processor_timeout_secs))
            .build()
            .context("Failed to create processor HTTP client")?;

        Ok(Self {
            client,
            processor_url: config.processor_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(
        &self,
        task: &TaskResponse,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<AnalysisOutcome> {
        progress
            .report(
                10,
                Some("analysis"),
                Some("sending deck to the processor"),
            )
            .await?;

        let request = ProcessorRequest {
            task_id: task.id,
            task_kind: task.task_kind.to_string(),
            file_path: &task.file_path,
            company_id: &task.company_id,
            options: &task.options,
        };
        let url = format!("{}/analyze", self.processor_url);

        // The processor call runs for tens of seconds to minutes; lease
        // keep-alive happens in the runner, not here.
        let response = tokio::select! {
            result = self.client.post(&url).json(&request).send() => {
                result.with_context(|| format!("Processor request failed for task {}", task.id))?
            }
            _ = cancel.cancelled() => {
                anyhow::bail!("analysis cancelled for task {}", task.id);
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "processor answered {} for task {}: {}",
                status,
                task.id,
                body
            );
        }

        let result: ProcessorResponse = response
            .json()
            .await
            .context("Failed to parse processor response")?;

        progress
            .report(90, Some("finalizing"), Some("storing analysis results"))
            .await?;

        Ok(AnalysisOutcome {
            result_path: result.results_file_path,
            metadata: result.metadata,
        })
    }
}
