use crate::error::OrchestratorError;
use crate::orchestrator::{
    Orchestrator, OrchestratorEvent, OrchestratorEventKind, OrchestratorFile, OrchestratorRequest,
    OrchestratorResult,
};
use crate::types::{CodeModeDiff, DiffMap, FileBuffer};
use cm_events::Subscription;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::error::Elapsed;

/// Bridges local sessions onto the orchestrator's own session/event model.
#[derive(Clone)]
pub struct OrchestratorAdapter {
    orchestrator: Arc<dyn Orchestrator>,
    request_timeout: Duration,
    cancel_timeout: Duration,
}

/// A started orchestrator session plus the event stream opened before it
/// was started, so its outcome cannot be missed.
pub struct StartedTask {
    pub orchestrator_session_id: String,
    events: Subscription<OrchestratorEvent>,
}

impl OrchestratorAdapter {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        request_timeout: Duration,
        cancel_timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            request_timeout,
            cancel_timeout,
        }
    }

    pub fn subscribe(&self) -> Subscription<OrchestratorEvent> {
        self.orchestrator.subscribe()
    }

    pub fn build_request(task: &str, rules: Option<&str>, files: &[FileBuffer]) -> OrchestratorRequest {
        OrchestratorRequest {
            task: task.to_string(),
            rules: rules.map(str::to_string),
            files: files.iter().map(OrchestratorFile::from).collect(),
        }
    }

    pub async fn start(&self, request: OrchestratorRequest) -> Result<StartedTask, OrchestratorError> {
        let events = self.orchestrator.subscribe();
        let orchestrator_session_id = self.orchestrator.start_session(request).await?;
        tracing::debug!(orchestrator_session_id = %orchestrator_session_id, "orchestrator session started");
        Ok(StartedTask {
            orchestrator_session_id,
            events,
        })
    }

    /// Runs `work` against the request timeout. The orchestrator is not told
    /// to stop when the race is lost; callers cancel it separately.
    pub async fn race<F: Future>(&self, work: F) -> Result<F::Output, Elapsed> {
        tokio::time::timeout(self.request_timeout, work).await
    }

    /// Best-effort cancel with a bounded wait. Failures are logged, never
    /// returned. Returns whether the orchestrator acknowledged in time.
    pub async fn cancel(&self, orchestrator_session_id: &str) -> bool {
        match tokio::time::timeout(
            self.cancel_timeout,
            self.orchestrator.cancel_session(orchestrator_session_id),
        )
        .await
        {
            Ok(Ok(())) => {
                tracing::debug!(orchestrator_session_id, "orchestrator session cancelled");
                true
            }
            Ok(Err(err)) => {
                tracing::warn!(orchestrator_session_id, error = %err, "orchestrator cancel failed");
                false
            }
            Err(_) => {
                tracing::warn!(
                    orchestrator_session_id,
                    timeout = ?self.cancel_timeout,
                    "orchestrator cancel timed out"
                );
                false
            }
        }
    }

    /// Groups the orchestrator's diffs by file path, keeping their order.
    pub fn translate(result: &OrchestratorResult) -> DiffMap {
        let mut diffs = DiffMap::new();
        for diff in &result.diffs {
            diffs
                .entry(diff.file_path.clone())
                .or_default()
                .push(CodeModeDiff {
                    kind: diff.kind,
                    line_start: diff.line_start,
                    line_end: diff.line_end,
                    content: diff.new_content.clone(),
                    original_content: diff.old_content.clone(),
                    confidence: diff.confidence,
                });
        }
        diffs
    }
}

impl StartedTask {
    /// Waits for this session's completion or failure, ignoring other sessions.
    pub async fn outcome(&mut self) -> Result<OrchestratorResult, OrchestratorError> {
        loop {
            let record = self
                .events
                .recv()
                .await
                .ok_or(OrchestratorError::StreamClosed)?;
            if record.body.orchestrator_session_id != self.orchestrator_session_id {
                continue;
            }
            match record.body.kind {
                OrchestratorEventKind::Completed { result } => return Ok(result),
                OrchestratorEventKind::Failed { error } => {
                    return Err(OrchestratorError::TaskFailed(error));
                }
                OrchestratorEventKind::Started | OrchestratorEventKind::Progress { .. } => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{MockOrchestrator, MockScript, OrchestratorDiff};
    use crate::types::DiffKind;

    fn adapter(mock: &Arc<MockOrchestrator>) -> OrchestratorAdapter {
        OrchestratorAdapter::new(
            mock.clone(),
            Duration::from_millis(200),
            Duration::from_millis(50),
        )
    }

    fn diff(path: &str, line: usize) -> OrchestratorDiff {
        OrchestratorDiff {
            file_path: path.to_string(),
            kind: DiffKind::Modify,
            line_start: line,
            line_end: None,
            new_content: format!("// {line}"),
            old_content: Some("old".to_string()),
            confidence: Some(0.9),
        }
    }

    #[test]
    fn translate_groups_by_path_in_order() {
        let result = OrchestratorResult {
            diffs: vec![diff("b.ts", 3), diff("a.ts", 1), diff("b.ts", 0)],
            summary: None,
        };
        let diffs = OrchestratorAdapter::translate(&result);
        assert_eq!(diffs.len(), 2);
        let b: Vec<usize> = diffs["b.ts"].iter().map(|d| d.line_start).collect();
        assert_eq!(b, vec![3, 0]);
        assert_eq!(diffs["a.ts"][0].content, "// 1");
        assert_eq!(diffs["a.ts"][0].original_content.as_deref(), Some("old"));
        assert_eq!(diffs["a.ts"][0].confidence, Some(0.9));
    }

    #[tokio::test(start_paused = true)]
    async fn outcome_resolves_on_completion() {
        let mock = Arc::new(MockOrchestrator::new(MockScript::complete(vec![diff("a.ts", 1)])));
        let adapter = adapter(&mock);
        let mut task = adapter
            .start(OrchestratorAdapter::build_request("t", None, &[]))
            .await
            .unwrap();
        let result = adapter.race(task.outcome()).await.unwrap().unwrap();
        assert_eq!(result.diffs.len(), 1);
        assert_eq!(mock.start_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn outcome_surfaces_task_failure() {
        let mock = Arc::new(MockOrchestrator::new(MockScript::fail("model unavailable")));
        let adapter = adapter(&mock);
        let mut task = adapter
            .start(OrchestratorAdapter::build_request("t", None, &[]))
            .await
            .unwrap();
        let err = adapter.race(task.outcome()).await.unwrap().unwrap_err();
        assert_eq!(err, OrchestratorError::TaskFailed("model unavailable".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn race_times_out_on_hung_task() {
        let mock = Arc::new(MockOrchestrator::new(MockScript::Hang));
        let adapter = adapter(&mock);
        let mut task = adapter
            .start(OrchestratorAdapter::build_request("t", None, &[]))
            .await
            .unwrap();
        assert!(adapter.race(task.outcome()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_bounded_and_swallows_failures() {
        let mock = Arc::new(MockOrchestrator::new(MockScript::Hang).with_unresponsive_cancel());
        let bounded = adapter(&mock);
        let task = bounded
            .start(OrchestratorAdapter::build_request("t", None, &[]))
            .await
            .unwrap();
        assert!(!bounded.cancel(&task.orchestrator_session_id).await);
        assert_eq!(mock.cancel_count(), 1);

        let responsive = Arc::new(MockOrchestrator::new(MockScript::Hang));
        assert!(!adapter(&responsive).cancel("orch_unknown").await);
    }
}
