use crate::error::CodeModeError;
use crate::service::CodeModeService;
use crate::types::{CodeModeResponse, DiffMap, FileBuffer, IntegrationEvent, Session, SessionId};
use cm_events::Subscription;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What a UI consumer renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingState {
    pub session: Option<Session>,
    pub is_processing: bool,
    pub last_response: Option<CodeModeResponse>,
    pub error: Option<String>,
}

/// Adapts the facade into observable state plus imperative actions for a
/// single consumer. Owns at most one session at a time.
///
/// Must be created inside a tokio runtime; it follows service events for
/// its session until dropped.
pub struct IntegrationBinding {
    inner: Arc<BindingInner>,
    follower: JoinHandle<()>,
}

struct BindingInner {
    service: CodeModeService,
    state: watch::Sender<BindingState>,
}

impl IntegrationBinding {
    pub fn new(service: CodeModeService) -> Self {
        let events = service.subscribe();
        let (state, _) = watch::channel(BindingState::default());
        let inner = Arc::new(BindingInner { service, state });
        let follower = tokio::spawn(follow(Arc::downgrade(&inner), events));
        Self { inner, follower }
    }

    pub fn watch(&self) -> watch::Receiver<BindingState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> BindingState {
        self.inner.state.borrow().clone()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.current()
    }

    /// Cancels the current session, if any, and starts a new one.
    pub async fn start_session(&self, files: Vec<FileBuffer>) -> Result<SessionId, CodeModeError> {
        if let Some(previous) = self.inner.current() {
            self.inner.service.cancel_session(&previous).await;
        }
        match self.inner.service.create_session(files).await {
            Ok(id) => {
                let session = self.inner.service.get_session_info(&id).await;
                self.inner.state.send_modify(|state| {
                    *state = BindingState {
                        session,
                        ..BindingState::default()
                    };
                });
                Ok(id)
            }
            Err(err) => {
                self.inner.state.send_modify(|state| {
                    *state = BindingState {
                        error: Some(err.user_message()),
                        ..BindingState::default()
                    };
                });
                Err(err)
            }
        }
    }

    /// `None` when there is no current session.
    pub async fn execute_task(
        &self,
        task: &str,
        rules: Option<&str>,
        selected_files: Option<&[String]>,
    ) -> Option<CodeModeResponse> {
        let id = self.require_session()?;
        self.inner.state.send_modify(|state| {
            state.is_processing = true;
            state.error = None;
        });
        let response = self
            .inner
            .service
            .execute_code_task(&id, task, rules, selected_files)
            .await;
        self.inner.finish(response.clone()).await;
        Some(response)
    }

    /// Applies the session's pending diffs.
    pub async fn apply_pending(&self) -> Option<CodeModeResponse> {
        let id = self.require_session()?;
        let pending = self
            .inner
            .service
            .get_session_info(&id)
            .await
            .map(|session| session.pending_diffs)
            .unwrap_or_default();
        self.apply(&pending).await
    }

    pub async fn apply(&self, diffs: &DiffMap) -> Option<CodeModeResponse> {
        let id = self.require_session()?;
        let response = self.inner.service.apply_diffs(&id, diffs).await;
        self.inner.finish(response.clone()).await;
        Some(response)
    }

    pub async fn cancel(&self) {
        let Some(id) = self.inner.current() else {
            return;
        };
        self.inner.service.cancel_session(&id).await;
        self.inner.state.send_modify(|state| state.is_processing = false);
        self.inner.refresh().await;
    }

    fn require_session(&self) -> Option<SessionId> {
        let id = self.inner.current();
        if id.is_none() {
            self.inner
                .state
                .send_modify(|state| state.error = Some("No active code session.".to_string()));
        }
        id
    }
}

impl Drop for IntegrationBinding {
    fn drop(&mut self) {
        self.follower.abort();
    }
}

impl BindingInner {
    fn current(&self) -> Option<SessionId> {
        self.state
            .borrow()
            .session
            .as_ref()
            .map(|session| session.id.clone())
    }

    async fn refresh(&self) {
        let Some(id) = self.current() else {
            return;
        };
        let session = self.service.get_session_info(&id).await;
        self.state.send_modify(|state| {
            // The current session may have changed while we were reading.
            if state.session.as_ref().is_some_and(|current| current.id == id) {
                state.session = session;
            }
        });
    }

    async fn finish(&self, response: CodeModeResponse) {
        let error = if response.success() {
            None
        } else {
            response.message().map(str::to_string)
        };
        self.state.send_modify(|state| {
            state.is_processing = false;
            state.error = error;
            state.last_response = Some(response);
        });
        self.refresh().await;
    }
}

async fn follow(inner: Weak<BindingInner>, mut events: Subscription<IntegrationEvent>) {
    while let Some(record) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        let ours = inner.current().as_ref() == Some(record.body.session_id());
        if ours {
            inner.refresh().await;
        }
    }
}
