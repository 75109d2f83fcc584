//! Apply one operation across many hosts.
//!
//! Targets are resolved against the registry at dispatch time. Each host runs
//! independently under its own timeout; a failure is recorded in that host's
//! entry and never stops the others. Results come back in target order no
//! matter which host finishes first.
//!
//! Only a malformed request fails the call as a whole, and it does so before
//! anything is dispatched.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::{ErrorKind, RemoteError};
use super::manager::{HostFilter, RemoteManager};
use super::operation::{OperationKind, OperationOutcome};

/// One user action: what to do, and where.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub operation: OperationKind,
    pub targets: HostFilter,
}

impl OperationRequest {
    pub fn all(operation: OperationKind) -> Self {
        Self {
            operation,
            targets: HostFilter::All,
        }
    }

    pub fn hosts<I, S>(operation: OperationKind, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            operation,
            targets: HostFilter::Hosts(hosts.into_iter().map(Into::into).collect()),
        }
    }

    fn validate(&self) -> Result<(), RemoteError> {
        self.operation.validate()?;
        self.operation.command_line()?;
        if let HostFilter::Hosts(hosts) = &self.targets {
            if hosts.iter().any(|h| h.trim().is_empty()) {
                return Err(RemoteError::InvalidRequest(
                    "host names must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostOutcome {
    Success {
        output: String,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
}

impl From<Result<OperationOutcome, RemoteError>> for HostOutcome {
    fn from(result: Result<OperationOutcome, RemoteError>) -> Self {
        match result {
            Ok(outcome) => HostOutcome::Success {
                output: outcome.output,
            },
            Err(e) => HostOutcome::Failure {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HostResult {
    pub host: String,
    #[serde(flatten)]
    pub outcome: HostOutcome,
}

impl HostResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, HostOutcome::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            HostOutcome::Failure { kind, .. } => Some(*kind),
            HostOutcome::Success { .. } => None,
        }
    }
}

/// Aggregate report of one fan-out. Built once, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OperationResult {
    operation: String,
    results: Vec<HostResult>,
    succeeded: usize,
    failed: usize,
}

impl OperationResult {
    fn new(operation: String, results: Vec<HostResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let failed = results.len() - succeeded;
        Self {
            operation,
            results,
            succeeded,
            failed,
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn results(&self) -> &[HostResult] {
        &self.results
    }

    pub fn get(&self, host: &str) -> Option<&HostResult> {
        self.results.iter().find(|r| r.host == host)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Clone)]
pub struct FanOutExecutor {
    manager: Arc<RemoteManager>,
    pool_size: usize,
    operation_timeout: Duration,
}

impl FanOutExecutor {
    pub fn new(manager: Arc<RemoteManager>) -> Self {
        let config = manager.config();
        let pool_size = config.pool_size.max(1);
        let operation_timeout = config.operation_timeout;
        Self {
            manager,
            pool_size,
            operation_timeout,
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub async fn execute(&self, request: &OperationRequest) -> Result<OperationResult, RemoteError> {
        self.execute_with_cancel(request, &CancellationToken::new()).await
    }

    /// Like [`execute`](Self::execute); hosts not yet dispatched when `cancel`
    /// fires are recorded as cancelled. In-flight hosts run to completion.
    pub async fn execute_with_cancel(
        &self,
        request: &OperationRequest,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, RemoteError> {
        request.validate()?;

        let label = request.operation.label();
        let targets = self.manager.resolve_targets(&request.targets);
        if targets.is_empty() {
            info!("{}: no target hosts", label);
            return Ok(OperationResult::new(label, Vec::new()));
        }

        info!("{}: dispatching to {} host(s)", label, targets.len());
        let operation = &request.operation;
        let bound = self.operation_timeout;

        let results: Vec<HostResult> = stream::iter(targets.into_iter().map(|(host, session)| {
            async move {
                let result = if cancel.is_cancelled() {
                    Err(RemoteError::Cancelled { host: host.clone() })
                } else {
                    match session {
                        Some(session) => session.execute(operation, bound).await,
                        None => Err(RemoteError::session_closed(&host)),
                    }
                };
                if let Err(e) = &result {
                    warn!("{} on {} failed: {}", operation.label(), host, e);
                }
                HostResult {
                    host,
                    outcome: result.into(),
                }
            }
        }))
        .buffered(self.pool_size)
        .collect()
        .await;

        let report = OperationResult::new(label, results);
        info!(
            "{}: {} succeeded, {} failed",
            report.operation(),
            report.succeeded(),
            report.failed()
        );
        Ok(report)
    }
}
