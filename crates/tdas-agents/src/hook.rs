use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tdas_models::opinion::{RawOpinion, ScoringRequest};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::parser::parse_raw_opinion;

/// External, swappable scoring function for one role. Mockable for testing.
#[async_trait]
pub trait ScoringHook: Send + Sync {
    async fn score(&self, request: &ScoringRequest) -> Result<RawOpinion, AgentError>;
}

/// Runs an external program per request.
///
/// The request is written as JSON to the program's stdin; the first JSON object
/// on stdout is the raw opinion. The child is killed if the budget runs out.
#[derive(Debug, Clone)]
pub struct CommandHook {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandHook {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Run the program and return its raw stdout.
    pub async fn invoke(&self, input: &str) -> Result<String, AgentError> {
        debug!(program = %self.program, "Invoking scoring hook");

        let run = async {
            let mut child = Command::new(&self.program)
                .args(&self.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| AgentError::Hook(format!("Failed to spawn {}: {e}", self.program)))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .await
                    .map_err(|e| AgentError::Hook(format!("Failed to write request: {e}")))?;
                // Dropping stdin closes the pipe so the program sees EOF.
            }

            child
                .wait_with_output()
                .await
                .map_err(|e| AgentError::Hook(format!("Failed to wait for {}: {e}", self.program)))
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| AgentError::ProviderTimeout {
                provider: self.program.clone(),
                budget_ms: self.timeout.as_millis() as u64,
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(program = %self.program, status = %output.status, stderr = %stderr, "Scoring hook failed");
            return Err(AgentError::Hook(format!(
                "{} exited {}: {}",
                self.program, output.status, stderr
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if stdout.trim().is_empty() {
            return Err(AgentError::Hook(format!(
                "{} returned empty output",
                self.program
            )));
        }

        Ok(stdout)
    }
}

#[async_trait]
impl ScoringHook for CommandHook {
    async fn score(&self, request: &ScoringRequest) -> Result<RawOpinion, AgentError> {
        let input = serde_json::to_string(request)?;
        let raw_output = self.invoke(&input).await?;
        parse_raw_opinion(&raw_output)
    }
}
