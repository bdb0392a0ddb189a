use crate::error::OrchestratorError;
use crate::orchestrator::{
    Orchestrator, OrchestratorDiff, OrchestratorEvent, OrchestratorEventKind, OrchestratorRequest,
    OrchestratorResult,
};
use async_trait::async_trait;
use cm_events::{EventBus, Subscription};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use ulid::Ulid;

const DEFAULT_DELAY: Duration = Duration::from_millis(10);

/// What every started session does.
#[derive(Debug, Clone)]
pub enum MockScript {
    Complete {
        result: OrchestratorResult,
        delay: Duration,
    },
    Fail {
        error: String,
        delay: Duration,
    },
    /// Emits `started` and then nothing.
    Hang,
    /// `start_session` itself fails.
    Reject(String),
}

impl MockScript {
    pub fn complete(diffs: Vec<OrchestratorDiff>) -> Self {
        Self::Complete {
            result: OrchestratorResult {
                diffs,
                summary: None,
            },
            delay: DEFAULT_DELAY,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self::Fail {
            error: error.into(),
            delay: DEFAULT_DELAY,
        }
    }
}

/// In-process orchestrator driven by a [`MockScript`]. Counts starts and
/// cancels and records every request it receives.
pub struct MockOrchestrator {
    script: MockScript,
    events: EventBus<OrchestratorEvent>,
    /// Scripted tasks that have not settled yet.
    running: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    requests: Mutex<Vec<OrchestratorRequest>>,
    starts: AtomicUsize,
    cancels: AtomicUsize,
    unresponsive_cancel: bool,
}

impl MockOrchestrator {
    pub fn new(script: MockScript) -> Self {
        Self {
            script,
            events: EventBus::default(),
            running: Arc::new(Mutex::new(HashMap::new())),
            requests: Mutex::new(Vec::new()),
            starts: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            unresponsive_cancel: false,
        }
    }

    /// `cancel_session` never returns.
    pub fn with_unresponsive_cancel(mut self) -> Self {
        self.unresponsive_cancel = true;
        self
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<OrchestratorRequest> {
        self.requests.lock().await.clone()
    }

    fn emit(events: &EventBus<OrchestratorEvent>, id: &str, kind: OrchestratorEventKind) {
        events.publish(
            Some(id.to_string()),
            OrchestratorEvent {
                orchestrator_session_id: id.to_string(),
                kind,
            },
        );
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn start_session(&self, request: OrchestratorRequest) -> Result<String, OrchestratorError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request);
        let script = self.script.clone();
        if let MockScript::Reject(reason) = script {
            return Err(OrchestratorError::Rejected(reason));
        }

        let id = format!("orch_{}", Ulid::new());
        let events = self.events.clone();
        let running = Arc::clone(&self.running);
        let task_id = id.clone();
        // Held across the spawn so the task cannot prune its entry before it
        // is inserted.
        let mut tasks = self.running.lock().await;
        let handle = tokio::spawn(async move {
            Self::emit(&events, &task_id, OrchestratorEventKind::Started);
            match script {
                MockScript::Complete { result, delay } => {
                    Self::emit(
                        &events,
                        &task_id,
                        OrchestratorEventKind::Progress {
                            progress: Some(0.5),
                            message: Some("generating edits".to_string()),
                        },
                    );
                    tokio::time::sleep(delay).await;
                    Self::emit(&events, &task_id, OrchestratorEventKind::Completed { result });
                }
                MockScript::Fail { error, delay } => {
                    tokio::time::sleep(delay).await;
                    Self::emit(&events, &task_id, OrchestratorEventKind::Failed { error });
                }
                MockScript::Hang | MockScript::Reject(_) => return,
            }
            running.lock().await.remove(&task_id);
        });
        tasks.insert(id.clone(), handle);
        Ok(id)
    }

    async fn cancel_session(&self, orchestrator_session_id: &str) -> Result<(), OrchestratorError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.unresponsive_cancel {
            std::future::pending::<()>().await;
        }
        let handle = self
            .running
            .lock()
            .await
            .remove(orchestrator_session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(orchestrator_session_id.to_string()))?;
        handle.abort();
        Self::emit(
            &self.events,
            orchestrator_session_id,
            OrchestratorEventKind::Failed {
                error: "cancelled".to_string(),
            },
        );
        Ok(())
    }

    fn subscribe(&self) -> Subscription<OrchestratorEvent> {
        self.events.subscribe()
    }
}
