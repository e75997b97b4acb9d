//! Scripted tool adapter for tests and dry runs

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use swarm_core::{Result, ToolStage};

use crate::adapter::{ToolAdapter, ToolRequest, ToolResult};

/// Adapter that replays queued results, then a default
pub struct ScriptedAdapter {
    stage: ToolStage,
    queue: Mutex<VecDeque<ToolResult>>,
    default: ToolResult,
    delay: Option<Duration>,
    timeout: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<ToolRequest>>,
}

impl ScriptedAdapter {
    /// Adapter that passes every invocation
    pub fn new(stage: ToolStage) -> Self {
        Self {
            stage,
            queue: Mutex::new(VecDeque::new()),
            default: ToolResult::pass(stage),
            delay: None,
            timeout: Duration::from_secs(60),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a result for the next unanswered invocation
    pub fn with_result(self, result: ToolResult) -> Self {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(result);
        }
        self
    }

    /// Result returned once the queue is empty
    pub fn with_default(mut self, result: ToolResult) -> Self {
        self.default = result;
        self
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests seen so far, in order
    pub fn requests(&self) -> Vec<ToolRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ToolAdapter for ScriptedAdapter {
    fn stage(&self) -> ToolStage {
        self.stage
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn invoke(&self, request: &ToolRequest) -> Result<ToolResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        Ok(next.unwrap_or_else(|| self.default.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ToolOptions;
    use std::path::PathBuf;
    use swarm_core::FailureType;

    fn request() -> ToolRequest {
        ToolRequest {
            module: "m1".to_string(),
            stage: ToolStage::Lint,
            attempt: 1,
            workdir: PathBuf::from("/tmp"),
            inputs: vec![],
            options: ToolOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_queue_then_default() {
        let adapter = ScriptedAdapter::new(ToolStage::Lint)
            .with_result(ToolResult::fail(ToolStage::Lint, FailureType::Syntax));

        let first = adapter.invoke(&request()).await.unwrap();
        let second = adapter.invoke(&request()).await.unwrap();
        assert!(!first.success);
        assert!(second.success);
        assert_eq!(adapter.calls(), 2);
        assert_eq!(adapter.requests().len(), 2);
    }
}
