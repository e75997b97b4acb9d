//! Single-flight tool runner
//!
//! Owns one adapter per stage. Invocations are serialized behind a dispatch
//! lock so at most one tool runs at any moment, each run is bounded by its
//! adapter's timeout, and raw output is persisted to the log store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

use swarm_core::fail_open::fail_open;
use swarm_core::{Evidence, FailureType, Result, SwarmConfig, SwarmError, ToolStage};
use swarm_store::LogStore;

use crate::adapter::{ToolAdapter, ToolRequest, ToolResult};
use crate::command::CommandAdapter;

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Dispatches tool requests to stage adapters, one at a time
pub struct ToolRunner {
    adapters: HashMap<ToolStage, Arc<dyn ToolAdapter>>,
    logs: LogStore,
    dispatch: Mutex<()>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ToolRunner {
    pub fn new(logs: LogStore) -> Self {
        Self {
            adapters: HashMap::new(),
            logs,
            dispatch: Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Runner with a command adapter for every configured stage
    pub fn from_config(config: &SwarmConfig, logs: LogStore) -> Self {
        CommandAdapter::from_config(config)
            .into_iter()
            .fold(Self::new(logs), |runner, adapter| runner.with_adapter(adapter))
    }

    /// Register an adapter, replacing any existing one for its stage
    pub fn with_adapter(self, adapter: impl ToolAdapter + 'static) -> Self {
        self.with_shared_adapter(Arc::new(adapter))
    }

    pub fn with_shared_adapter(mut self, adapter: Arc<dyn ToolAdapter>) -> Self {
        self.adapters.insert(adapter.stage(), adapter);
        self
    }

    pub fn has_stage(&self, stage: ToolStage) -> bool {
        self.adapters.contains_key(&stage)
    }

    /// Highest number of simultaneous invocations observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Run one request to completion
    ///
    /// Adapter errors (the tool could not be started) and timeouts come back
    /// as failed results, never as `Err`; only a missing adapter is an error.
    pub async fn run(&self, request: &ToolRequest) -> Result<ToolResult> {
        let adapter = self
            .adapters
            .get(&request.stage)
            .ok_or_else(|| SwarmError::MissingAdapter(request.stage.to_string()))?;

        let _dispatch = self.dispatch.lock().await;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let limit = adapter.timeout();
        let started = Instant::now();
        let mut result = match tokio::time::timeout(limit, adapter.invoke(request)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!("{} {} could not run: {}", request.module, request.stage, e);
                ToolResult::fail(request.stage, FailureType::Functional)
                    .with_evidence(Evidence::raw(e.to_string()))
            }
            Err(_) => {
                warn!(
                    "{} {} timed out after {}s",
                    request.module,
                    request.stage,
                    limit.as_secs()
                );
                ToolResult::timed_out(request.stage, limit)
            }
        };
        if result.duration_ms == 0 {
            result.duration_ms = started.elapsed().as_millis() as u64;
        }

        let text = result.log_text(request);
        result.log_path = fail_open("tool_log", || {
            self.logs
                .write(&request.module, request.attempt, request.stage, &text)
        })
        .await;

        info!(
            "{} {} attempt {}: {} ({}ms)",
            request.module,
            request.stage,
            request.attempt,
            match result.failure_type {
                None => "pass".to_string(),
                Some(ft) => ft.to_string(),
            },
            result.duration_ms
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ToolOptions;
    use crate::ScriptedAdapter;
    use std::time::Duration;
    use tempfile::TempDir;

    fn request(stage: ToolStage) -> ToolRequest {
        ToolRequest {
            module: "m1".to_string(),
            stage,
            attempt: 1,
            workdir: std::env::temp_dir(),
            inputs: vec![],
            options: ToolOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_missing_adapter() {
        let dir = TempDir::new().unwrap();
        let runner = ToolRunner::new(LogStore::new(dir.path()));
        let result = runner.run(&request(ToolStage::Harden)).await;
        assert!(matches!(result, Err(SwarmError::MissingAdapter(_))));
    }

    #[tokio::test]
    async fn test_timeout_becomes_failure() {
        let dir = TempDir::new().unwrap();
        let runner = ToolRunner::new(LogStore::new(dir.path())).with_adapter(
            ScriptedAdapter::new(ToolStage::Simulate)
                .with_delay(Duration::from_secs(5))
                .with_timeout(Duration::from_millis(50)),
        );

        let result = runner.run(&request(ToolStage::Simulate)).await.unwrap();
        assert_eq!(result.failure_type, Some(FailureType::Timeout));
        assert!(result.log_path.unwrap().exists());
    }

    #[tokio::test]
    async fn test_runs_are_serialized() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(
            ToolRunner::new(LogStore::new(dir.path())).with_adapter(
                ScriptedAdapter::new(ToolStage::Lint).with_delay(Duration::from_millis(20)),
            ),
        );

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let runner = runner.clone();
                tokio::spawn(async move { runner.run(&request(ToolStage::Lint)).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().success);
        }
        assert_eq!(runner.peak_in_flight(), 1);
    }
}
