use crate::config::CodeModeConfig;
use crate::dedup::RequestDeduplicator;
use crate::diff::DiffApplicator;
use crate::error::{CodeModeError, DiffError, OrchestratorError};
use crate::fingerprint::{file_set_fingerprint, request_key, task_key};
use crate::orchestrator::{
    Orchestrator, OrchestratorAdapter, OrchestratorEvent, OrchestratorEventKind, OrchestratorRequest,
    OrchestratorResult,
};
use crate::registry::{CancelOutcome, CreateOutcome, SessionRegistry};
use crate::types::{
    CodeModeRequest, CodeModeResponse, DiffMap, FileBuffer, FileFailure, IntegrationEvent, Session,
    SessionId, SessionStats, SessionStatus,
};
use crate::validation::ValidatorRegistry;
use chrono::{DateTime, Utc};
use cm_events::{EventBus, Subscription};
use futures::FutureExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// The code mode facade. Cheap to clone; clones share one session registry.
///
/// Lifecycle calls (`create_session`) return `Result`. Request calls
/// (`process_request`, `execute_code_task`, `apply_diffs`) never fail: errors
/// come back as [`CodeModeResponse::Error`] and mark the session failed.
#[derive(Clone)]
pub struct CodeModeService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: CodeModeConfig,
    registry: Mutex<SessionRegistry>,
    requests: RequestDeduplicator<CodeModeResponse>,
    events: EventBus<IntegrationEvent>,
    applicator: DiffApplicator,
    adapter: OrchestratorAdapter,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CodeModeService {
    pub fn new(config: CodeModeConfig, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self::with_validators(config, orchestrator, ValidatorRegistry::default())
    }

    pub fn with_validators(
        config: CodeModeConfig,
        orchestrator: Arc<dyn Orchestrator>,
        validators: ValidatorRegistry,
    ) -> Self {
        let adapter = OrchestratorAdapter::new(
            orchestrator,
            config.request_timeout(),
            config.cancel_timeout(),
        );
        Self {
            inner: Arc::new(ServiceInner {
                registry: Mutex::new(SessionRegistry::default()),
                requests: RequestDeduplicator::new(),
                events: EventBus::new(config.event_capacity),
                applicator: DiffApplicator::new(validators, config.auto_validate_syntax),
                adapter,
                background: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &CodeModeConfig {
        &self.inner.config
    }

    /// Starts the expiry sweep and orchestrator event correlation. Calling it
    /// again while running is a no-op.
    pub async fn init(&self) {
        let mut background = self.inner.background.lock().await;
        if !background.is_empty() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        background.push(tokio::spawn(sweep_loop(
            weak.clone(),
            self.inner.config.sweep_interval(),
        )));
        background.push(tokio::spawn(correlate(weak, self.inner.adapter.subscribe())));
        tracing::debug!(
            sweep_interval_secs = self.inner.config.sweep_interval_secs,
            "code mode service started"
        );
    }

    /// Stops background work and releases every session.
    pub async fn destroy(&self) {
        for handle in self.inner.background.lock().await.drain(..) {
            handle.abort();
        }
        let released: Vec<(SessionId, Option<CancelOutcome>)> = {
            let mut registry = self.inner.registry.lock().await;
            registry
                .ids()
                .into_iter()
                .map(|id| {
                    let outcome = registry.cancel(&id);
                    registry.remove(&id);
                    (id, outcome)
                })
                .collect()
        };
        let count = released.len();
        for (id, outcome) in released {
            let Some(outcome) = outcome else { continue };
            self.emit(IntegrationEvent::SessionCancelled {
                session_id: id,
                forced: outcome.forced,
            });
            if let Some(orchestrator_session_id) = outcome.orchestrator_session_id {
                self.inner.adapter.cancel(&orchestrator_session_id).await;
            }
        }
        tracing::info!(released = count, "code mode service destroyed");
    }

    pub fn subscribe(&self) -> Subscription<IntegrationEvent> {
        self.inner.events.subscribe()
    }

    /// Returns the id of a live session with the same file-set shape if one
    /// exists; otherwise creates a session.
    pub async fn create_session(&self, files: Vec<FileBuffer>) -> Result<SessionId, CodeModeError> {
        let file_count = files.len();
        let outcome = self
            .inner
            .registry
            .lock()
            .await
            .create(files, self.inner.config.max_concurrent_sessions);
        match outcome {
            Ok(CreateOutcome::Created(id)) => {
                tracing::info!(session_id = %id, file_count, "session created");
                self.emit(IntegrationEvent::SessionCreated {
                    session_id: id.clone(),
                    file_count,
                });
                Ok(id)
            }
            Ok(CreateOutcome::Existing(id)) => {
                tracing::debug!(session_id = %id, "reusing session with identical file set");
                Ok(id)
            }
            Err(err) => {
                tracing::warn!(error = %err, "session creation rejected");
                Err(err)
            }
        }
    }

    pub async fn process_request(
        &self,
        session_id: &SessionId,
        request: CodeModeRequest,
    ) -> CodeModeResponse {
        let key = request_key(session_id, &request);
        let service = self.clone();
        let id = session_id.clone();
        let outcome = self
            .inner
            .requests
            .run(key, move || {
                async move { service.handle_request(&id, request).await }.boxed()
            })
            .await;
        if outcome.joined {
            tracing::debug!(session_id = %session_id, "joined in-flight request");
        }
        self.settle(session_id, outcome.value).await
    }

    pub async fn execute_code_task(
        &self,
        session_id: &SessionId,
        task: &str,
        rules: Option<&str>,
        selected_files: Option<&[String]>,
    ) -> CodeModeResponse {
        let key = task_key(session_id, task, rules, selected_files);
        let service = self.clone();
        let id = session_id.clone();
        let task = task.to_string();
        let rules = rules.map(str::to_string);
        let selected = selected_files.map(<[String]>::to_vec);
        let outcome = self
            .inner
            .requests
            .run(key, move || {
                async move {
                    service
                        .run_task(&id, &task, rules.as_deref(), selected.as_deref())
                        .await
                }
                .boxed()
            })
            .await;
        if outcome.joined {
            tracing::debug!(session_id = %session_id, "joined in-flight code task");
        }
        self.settle(session_id, outcome.value).await
    }

    /// Applies diffs file by file. A rejected file does not block the others;
    /// the session ends `completed` only if every file applied. Refused while
    /// a code task runs on the session.
    pub async fn apply_diffs(&self, session_id: &SessionId, diffs: &DiffMap) -> CodeModeResponse {
        let mut registry = self.inner.registry.lock().await;
        let Some(session) = registry.get_mut(session_id) else {
            drop(registry);
            return self.reject(
                session_id,
                CodeModeError::SessionNotFound {
                    session_id: session_id.clone(),
                },
            );
        };
        match session.status {
            SessionStatus::Cancelled => {
                drop(registry);
                return self.reject(
                    session_id,
                    CodeModeError::invalid(session_id, "session was cancelled; create a new session"),
                );
            }
            SessionStatus::Processing => {
                drop(registry);
                return self.reject(
                    session_id,
                    CodeModeError::invalid(session_id, "session is processing a task"),
                );
            }
            _ => {}
        }

        let mut applied = Vec::new();
        let mut errors = Vec::new();
        for (path, file_diffs) in diffs {
            let result = match session.file_mut(path) {
                Some(file) => self.inner.applicator.apply(file, file_diffs),
                None => Err(DiffError::FileNotFound { path: path.clone() }),
            };
            match result {
                Ok(()) => applied.push(path.clone()),
                Err(err) => {
                    tracing::warn!(session_id = %session_id, path = %path, error = %err, "diff rejected");
                    errors.push(FileFailure {
                        path: path.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        session
            .pending_diffs
            .retain(|path, _| !applied.contains(path));
        session.fingerprint = file_set_fingerprint(&session.files);
        session.last_activity = Utc::now();

        let message = if errors.is_empty() {
            format!("applied diffs to {} file(s)", applied.len())
        } else {
            format!(
                "applied diffs to {} file(s); {} file(s) failed",
                applied.len(),
                errors.len()
            )
        };
        let success = errors.is_empty();
        if success {
            registry.set_status(session_id, SessionStatus::Completed, None);
        } else {
            registry.set_status(session_id, SessionStatus::Failed, Some(message.clone()));
        }
        drop(registry);

        tracing::info!(
            session_id = %session_id,
            applied = applied.len(),
            failed = errors.len(),
            "diffs applied"
        );
        self.emit(IntegrationEvent::DiffsApplied {
            session_id: session_id.clone(),
            applied: applied.clone(),
            failed: errors.iter().map(|failure| failure.path.clone()).collect(),
        });
        self.emit(if success {
            IntegrationEvent::SessionCompleted {
                session_id: session_id.clone(),
            }
        } else {
            IntegrationEvent::SessionFailed {
                session_id: session_id.clone(),
                error: message.clone(),
            }
        });

        CodeModeResponse::Confirmation {
            session_id: session_id.clone(),
            success,
            message,
            applied,
            errors,
        }
    }

    /// Flips the session to `cancelled` at once, then asks the orchestrator to
    /// stop with a bounded wait. Unknown or already cancelled ids are a no-op.
    pub async fn cancel_session(&self, session_id: &SessionId) {
        let outcome = self.inner.registry.lock().await.cancel(session_id);
        let Some(outcome) = outcome else {
            tracing::debug!(session_id = %session_id, "cancel ignored");
            return;
        };
        tracing::info!(session_id = %session_id, forced = outcome.forced, "session cancelled");
        self.emit(IntegrationEvent::SessionCancelled {
            session_id: session_id.clone(),
            forced: outcome.forced,
        });
        if let Some(orchestrator_session_id) = outcome.orchestrator_session_id {
            self.inner.adapter.cancel(&orchestrator_session_id).await;
        }
    }

    pub async fn get_session_info(&self, session_id: &SessionId) -> Option<Session> {
        self.inner.registry.lock().await.get(session_id).cloned()
    }

    pub async fn update_session_files(&self, session_id: &SessionId, files: Vec<FileBuffer>) -> bool {
        match self
            .inner
            .registry
            .lock()
            .await
            .replace_files(session_id, files)
        {
            Ok(()) => true,
            Err(reason) => {
                tracing::debug!(session_id = %session_id, reason = %reason, "file update refused");
                false
            }
        }
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        self.inner.registry.lock().await.list()
    }

    pub async fn stats(&self) -> SessionStats {
        self.inner
            .registry
            .lock()
            .await
            .stats(self.inner.config.max_concurrent_sessions)
    }

    pub async fn sweep_expired(&self) -> Vec<SessionId> {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Cancels and removes every session idle longer than the session timeout
    /// as of `now`.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let ttl = chrono::Duration::from_std(self.inner.config.session_timeout())
            .unwrap_or(chrono::Duration::MAX);
        let expired: Vec<(SessionId, Option<String>)> = {
            let mut registry = self.inner.registry.lock().await;
            registry
                .idle_since(now, ttl)
                .into_iter()
                .map(|id| {
                    let orchestrator_session_id = registry
                        .cancel(&id)
                        .and_then(|outcome| outcome.orchestrator_session_id);
                    registry.remove(&id);
                    (id, orchestrator_session_id)
                })
                .collect()
        };

        let mut ids = Vec::with_capacity(expired.len());
        for (id, orchestrator_session_id) in expired {
            tracing::info!(session_id = %id, "session expired");
            self.emit(IntegrationEvent::SessionExpired {
                session_id: id.clone(),
            });
            if let Some(orchestrator_session_id) = orchestrator_session_id {
                self.inner.adapter.cancel(&orchestrator_session_id).await;
            }
            ids.push(id);
        }
        ids
    }

    async fn handle_request(&self, id: &SessionId, request: CodeModeRequest) -> CodeModeResponse {
        let mut registry = self.inner.registry.lock().await;
        // A request arriving while a code task runs must not end that task's
        // processing state.
        let was_busy = match registry.get(id) {
            Some(session) => session.status == SessionStatus::Processing,
            None => {
                drop(registry);
                return self.reject(
                    id,
                    CodeModeError::SessionNotFound {
                        session_id: id.clone(),
                    },
                );
            }
        };
        // Only a busy session stays live afterwards, so only then can a
        // changed file set collide with another live session.
        let claimed = if was_busy {
            registry.live_fingerprints_except(id)
        } else {
            HashSet::new()
        };
        let result = match registry.begin_processing(id) {
            Ok(session) => self.answer(session, request, &claimed),
            Err(err) => {
                drop(registry);
                return self.reject(id, err);
            }
        };

        match result {
            Ok(response) => {
                if !was_busy {
                    registry.set_status(id, SessionStatus::Completed, None);
                }
                drop(registry);
                tracing::debug!(session_id = %id, response = response.kind(), "request handled");
                if !was_busy {
                    self.emit(IntegrationEvent::SessionCompleted {
                        session_id: id.clone(),
                    });
                }
                response
            }
            Err(err) if was_busy => {
                drop(registry);
                self.reject(id, err)
            }
            Err(err) => {
                registry.set_status(id, SessionStatus::Failed, Some(err.to_string()));
                drop(registry);
                self.report_failure(id, err)
            }
        }
    }

    /// `claimed` holds fingerprints the session's file set must not take on.
    fn answer(
        &self,
        session: &mut Session,
        request: CodeModeRequest,
        claimed: &HashSet<String>,
    ) -> Result<CodeModeResponse, CodeModeError> {
        let id = session.id.clone();
        match request {
            CodeModeRequest::ReadFile { path } => {
                let file = session
                    .file(&path)
                    .cloned()
                    .ok_or_else(|| CodeModeError::invalid(&id, format!("file not found: {path}")))?;
                Ok(CodeModeResponse::FileContent {
                    session_id: id,
                    success: true,
                    file,
                })
            }
            CodeModeRequest::ListFiles => Ok(CodeModeResponse::FileList {
                session_id: id,
                success: true,
                files: session.files.iter().map(FileBuffer::summary).collect(),
            }),
            CodeModeRequest::WriteDiff { diffs } => {
                let mut previews = BTreeMap::new();
                for (path, file_diffs) in &diffs {
                    let file = session.file(path).ok_or_else(|| {
                        CodeModeError::invalid(&id, format!("file not found: {path}"))
                    })?;
                    let preview = self
                        .inner
                        .applicator
                        .preview(&file.content, &file.language, file_diffs)
                        .map_err(|err| CodeModeError::invalid(&id, format!("{path}: {err}")))?;
                    previews.insert(path.clone(), preview);
                }
                session.pending_diffs = diffs.clone();
                Ok(CodeModeResponse::DiffPreview {
                    session_id: id,
                    success: true,
                    diffs,
                    previews,
                    summary: None,
                })
            }
            CodeModeRequest::CreateFile { path, content } => {
                if session.file(&path).is_some() {
                    return Err(CodeModeError::invalid(&id, format!("file already exists: {path}")));
                }
                let mut file = FileBuffer::new(path.clone(), content);
                file.has_edits = true;
                let mut files = session.files.clone();
                files.push(file);
                let fingerprint = claim(&id, &files, claimed)?;
                session.files = files;
                session.fingerprint = fingerprint;
                Ok(CodeModeResponse::Confirmation {
                    session_id: id,
                    success: true,
                    message: format!("created {path}"),
                    applied: vec![path],
                    errors: Vec::new(),
                })
            }
            CodeModeRequest::DeleteFile { path } => {
                if session.file(&path).is_none() {
                    return Err(CodeModeError::invalid(&id, format!("file not found: {path}")));
                }
                let files: Vec<FileBuffer> = session
                    .files
                    .iter()
                    .filter(|file| file.path != path)
                    .cloned()
                    .collect();
                let fingerprint = claim(&id, &files, claimed)?;
                session.files = files;
                session.pending_diffs.remove(&path);
                session.fingerprint = fingerprint;
                Ok(CodeModeResponse::Confirmation {
                    session_id: id,
                    success: true,
                    message: format!("deleted {path}"),
                    applied: vec![path],
                    errors: Vec::new(),
                })
            }
        }
    }

    async fn run_task(
        &self,
        id: &SessionId,
        task: &str,
        rules: Option<&str>,
        selected: Option<&[String]>,
    ) -> CodeModeResponse {
        let request = {
            let mut registry = self.inner.registry.lock().await;
            let Some(session) = registry.get(id) else {
                drop(registry);
                return self.reject(
                    id,
                    CodeModeError::SessionNotFound {
                        session_id: id.clone(),
                    },
                );
            };
            match session.status {
                SessionStatus::Processing => {
                    drop(registry);
                    return self.reject(
                        id,
                        CodeModeError::invalid(id, "session is already processing a task"),
                    );
                }
                SessionStatus::Cancelled => {
                    drop(registry);
                    return self.reject(
                        id,
                        CodeModeError::invalid(id, "session was cancelled; create a new session"),
                    );
                }
                // Going live again would share the file set with another
                // live session.
                status
                    if !status.is_active()
                        && registry.fingerprint_taken(id, &session.fingerprint) =>
                {
                    drop(registry);
                    return self.reject(
                        id,
                        CodeModeError::invalid(id, "another live session has the same file set"),
                    );
                }
                _ => {}
            }
            let files: Vec<FileBuffer> = match selected {
                Some(selected) => session
                    .files
                    .iter()
                    .filter(|file| selected.contains(&file.path))
                    .cloned()
                    .collect(),
                None => session.files.clone(),
            };
            if files.is_empty() {
                let err = CodeModeError::invalid(id, "no files selected for the task");
                registry.set_status(id, SessionStatus::Failed, Some(err.to_string()));
                drop(registry);
                return self.report_failure(id, err);
            }
            if let Err(err) = registry.begin_processing(id) {
                drop(registry);
                return self.reject(id, err);
            }
            OrchestratorAdapter::build_request(task, rules, &files)
        };

        tracing::info!(session_id = %id, files = request.files.len(), "code task started");
        let mut started = None;
        let raced = self
            .inner
            .adapter
            .race(self.drive(id, request, &mut started))
            .await;
        let result = match raced {
            Ok(result) => result.map_err(|err| CodeModeError::from_orchestrator(id, &err)),
            Err(_) => Err(CodeModeError::Timeout {
                session_id: id.clone(),
                timeout_ms: self.inner.config.request_timeout_ms,
            }),
        };

        match result {
            Ok(result) => self.finish_task(id, result).await,
            Err(err) => {
                {
                    let mut registry = self.inner.registry.lock().await;
                    match registry.get(id).map(|session| session.status) {
                        None => {
                            drop(registry);
                            return self.reject(
                                id,
                                CodeModeError::SessionNotFound {
                                    session_id: id.clone(),
                                },
                            );
                        }
                        Some(SessionStatus::Cancelled) => {
                            drop(registry);
                            return self.reject(
                                id,
                                CodeModeError::invalid(id, "session was cancelled during the task"),
                            );
                        }
                        Some(_) => {
                            registry.set_status(id, SessionStatus::Failed, Some(err.to_string()));
                        }
                    }
                }
                if let Some(orchestrator_session_id) = started {
                    self.inner.adapter.cancel(&orchestrator_session_id).await;
                }
                self.report_failure(id, err)
            }
        }
    }

    /// Starts the orchestrator and waits for its outcome. `started` is set once
    /// the orchestrator session is bound to `id`.
    async fn drive(
        &self,
        id: &SessionId,
        request: OrchestratorRequest,
        started: &mut Option<String>,
    ) -> Result<OrchestratorResult, OrchestratorError> {
        let mut task = self.inner.adapter.start(request).await?;
        let orchestrator_session_id = task.orchestrator_session_id.clone();
        let bound = {
            let mut registry = self.inner.registry.lock().await;
            let live = registry
                .get(id)
                .is_some_and(|session| session.status == SessionStatus::Processing);
            live && registry.bind_orchestrator(id, &orchestrator_session_id)
        };
        if !bound {
            self.inner.adapter.cancel(&orchestrator_session_id).await;
            return Err(OrchestratorError::Internal(
                "session left processing before the orchestrator started".to_string(),
            ));
        }
        *started = Some(orchestrator_session_id.clone());
        self.emit(IntegrationEvent::SessionStarted {
            session_id: id.clone(),
            orchestrator_session_id,
        });
        task.outcome().await
    }

    async fn finish_task(&self, id: &SessionId, result: OrchestratorResult) -> CodeModeResponse {
        let diffs = OrchestratorAdapter::translate(&result);
        let mut registry = self.inner.registry.lock().await;
        let Some(session) = registry.get_mut(id) else {
            drop(registry);
            return self.reject(
                id,
                CodeModeError::SessionNotFound {
                    session_id: id.clone(),
                },
            );
        };
        if session.status == SessionStatus::Cancelled {
            drop(registry);
            return self.reject(
                id,
                CodeModeError::invalid(id, "session was cancelled during the task"),
            );
        }

        let mut previews = BTreeMap::new();
        for (path, file_diffs) in &diffs {
            let Some(file) = session.file(path) else {
                tracing::debug!(session_id = %id, path = %path, "diff targets a file outside the session");
                continue;
            };
            match self
                .inner
                .applicator
                .preview(&file.content, &file.language, file_diffs)
            {
                Ok(preview) => {
                    previews.insert(path.clone(), preview);
                }
                Err(err) => {
                    tracing::debug!(session_id = %id, path = %path, error = %err, "no preview for diff");
                }
            }
        }
        session.pending_diffs = diffs.clone();
        session.last_activity = Utc::now();
        registry.set_status(id, SessionStatus::Completed, None);
        drop(registry);

        tracing::info!(session_id = %id, files = diffs.len(), "code task completed");
        self.emit(IntegrationEvent::SessionCompleted {
            session_id: id.clone(),
        });
        CodeModeResponse::DiffPreview {
            session_id: id.clone(),
            success: true,
            diffs,
            previews,
            summary: result.summary,
        }
    }

    /// Mirrors an orchestrator event onto the local session it belongs to.
    async fn mirror(&self, event: OrchestratorEvent) {
        let orchestrator_session_id = event.orchestrator_session_id;
        let session_id = {
            let mut registry = self.inner.registry.lock().await;
            let Some(session_id) = registry
                .session_for_orchestrator(&orchestrator_session_id)
                .cloned()
            else {
                tracing::trace!(orchestrator_session_id = %orchestrator_session_id, "uncorrelated orchestrator event");
                return;
            };
            match &event.kind {
                OrchestratorEventKind::Progress { .. } => {
                    registry.touch(&session_id);
                }
                OrchestratorEventKind::Failed { error } => {
                    let processing = registry
                        .get(&session_id)
                        .is_some_and(|session| session.status == SessionStatus::Processing);
                    if processing {
                        registry.set_status(&session_id, SessionStatus::Failed, Some(error.clone()));
                    }
                }
                OrchestratorEventKind::Started | OrchestratorEventKind::Completed { .. } => {}
            }
            session_id
        };

        match event.kind {
            // Announced by the task that started the orchestrator.
            OrchestratorEventKind::Started => {}
            OrchestratorEventKind::Progress { progress, message } => {
                self.emit(IntegrationEvent::SessionProgress {
                    session_id,
                    orchestrator_session_id,
                    progress,
                    message,
                });
            }
            OrchestratorEventKind::Completed { result } => {
                self.emit(IntegrationEvent::OrchestratorCompleted {
                    session_id,
                    orchestrator_session_id,
                    diff_count: result.diffs.len(),
                });
            }
            OrchestratorEventKind::Failed { error } => {
                tracing::warn!(session_id = %session_id, error = %error, "orchestrator reported failure");
                self.emit(IntegrationEvent::OrchestratorFailed {
                    session_id,
                    orchestrator_session_id,
                    error,
                });
            }
        }
    }

    async fn settle(
        &self,
        session_id: &SessionId,
        value: Result<CodeModeResponse, String>,
    ) -> CodeModeResponse {
        match value {
            Ok(response) => response,
            Err(reason) => {
                tracing::error!(session_id = %session_id, reason = %reason, "request aborted");
                let err = CodeModeError::Unknown {
                    message: reason,
                    session_id: Some(session_id.clone()),
                };
                {
                    let mut registry = self.inner.registry.lock().await;
                    let cancelled = registry
                        .get(session_id)
                        .is_none_or(|session| session.status == SessionStatus::Cancelled);
                    if !cancelled {
                        registry.set_status(session_id, SessionStatus::Failed, Some(err.to_string()));
                    }
                }
                self.report_failure(session_id, err)
            }
        }
    }

    /// For failures already recorded on the session.
    fn report_failure(&self, session_id: &SessionId, err: CodeModeError) -> CodeModeResponse {
        self.emit(IntegrationEvent::SessionFailed {
            session_id: session_id.clone(),
            error: err.to_string(),
        });
        self.reject(session_id, err)
    }

    /// Reports an error without touching session state.
    fn reject(&self, session_id: &SessionId, err: CodeModeError) -> CodeModeResponse {
        tracing::warn!(session_id = %session_id, code = err.code(), error = %err, "request failed");
        self.emit(IntegrationEvent::SessionError {
            session_id: session_id.clone(),
            kind: err.kind(),
            message: err.to_string(),
        });
        CodeModeResponse::error(session_id, &err)
    }

    fn emit(&self, event: IntegrationEvent) {
        tracing::trace!(event = event.name(), session_id = %event.session_id(), "emit");
        let session_id = event.session_id().to_string();
        self.inner.events.publish(Some(session_id), event);
    }
}

/// Fingerprints `files`, refusing shapes another live session owns.
fn claim(
    id: &SessionId,
    files: &[FileBuffer],
    claimed: &HashSet<String>,
) -> Result<String, CodeModeError> {
    let fingerprint = file_set_fingerprint(files);
    if claimed.contains(&fingerprint) {
        return Err(CodeModeError::invalid(
            id,
            "another live session has the same file set",
        ));
    }
    Ok(fingerprint)
}

async fn sweep_loop(inner: Weak<ServiceInner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        let expired = CodeModeService { inner }.sweep_expired().await;
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "expiry sweep removed sessions");
        }
    }
}

async fn correlate(inner: Weak<ServiceInner>, mut events: Subscription<OrchestratorEvent>) {
    while let Some(record) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        CodeModeService { inner }.mirror(record.body).await;
    }
    tracing::debug!("orchestrator event stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{MockOrchestrator, MockScript, OrchestratorDiff};
    use crate::types::{CodeModeDiff, DiffKind, ErrorKind};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn config() -> CodeModeConfig {
        CodeModeConfig {
            request_timeout_ms: 1_000,
            cancel_timeout_ms: 100,
            ..CodeModeConfig::default()
        }
    }

    fn service(script: MockScript) -> (CodeModeService, Arc<MockOrchestrator>) {
        service_with(script, config())
    }

    fn service_with(
        script: MockScript,
        config: CodeModeConfig,
    ) -> (CodeModeService, Arc<MockOrchestrator>) {
        let mock = Arc::new(MockOrchestrator::new(script));
        (CodeModeService::new(config, mock.clone()), mock)
    }

    fn modify(path: &str, line: usize, content: &str) -> OrchestratorDiff {
        OrchestratorDiff {
            file_path: path.to_string(),
            kind: DiffKind::Modify,
            line_start: line,
            line_end: None,
            new_content: content.to_string(),
            old_content: None,
            confidence: Some(0.8),
        }
    }

    fn drain(events: &mut Subscription<IntegrationEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Some(record) = events.try_recv() {
            names.push(record.body.name());
        }
        names
    }

    async fn wait_for(events: &mut Subscription<IntegrationEvent>, name: &str) -> IntegrationEvent {
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                let record = events.recv().await.expect("event bus closed");
                if record.body.name() == name {
                    return record.body;
                }
            }
        })
        .await
        .expect("event not received")
    }

    async fn wait_until_processing(service: &CodeModeService, id: &SessionId) {
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                let status = service.get_session_info(id).await.map(|s| s.status);
                if status == Some(SessionStatus::Processing) {
                    return;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("session never started processing");
    }

    #[tokio::test]
    async fn create_is_idempotent_per_file_set_shape() {
        let (service, _) = service(MockScript::Hang);
        let mut events = service.subscribe();
        let first = service
            .create_session(vec![FileBuffer::new("a.ts", "abc"), FileBuffer::new("b.ts", "de")])
            .await
            .unwrap();
        let second = service
            .create_session(vec![FileBuffer::new("b.ts", "xy"), FileBuffer::new("a.ts", "xyz")])
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(service.stats().await.active(), 1);
        assert_eq!(drain(&mut events), vec!["session_created"]);
    }

    #[tokio::test]
    async fn session_limit_frees_a_slot_on_cancel() {
        let (service, _) = service_with(
            MockScript::Hang,
            CodeModeConfig {
                max_concurrent_sessions: 2,
                ..config()
            },
        );
        let a = service
            .create_session(vec![FileBuffer::new("a.ts", "")])
            .await
            .unwrap();
        service
            .create_session(vec![FileBuffer::new("b.ts", "")])
            .await
            .unwrap();

        let err = service
            .create_session(vec![FileBuffer::new("c.ts", "")])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionLimitExceeded);

        service.cancel_session(&a).await;
        assert!(
            service
                .create_session(vec![FileBuffer::new("c.ts", "")])
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn identical_in_flight_requests_execute_once() {
        let (service, _) = service(MockScript::Hang);
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "a\nb\nc")])
            .await
            .unwrap();
        let mut events = service.subscribe();

        let mut diffs = DiffMap::new();
        diffs.insert("a.ts".to_string(), vec![CodeModeDiff::add(0, "X")]);
        let request = CodeModeRequest::WriteDiff { diffs };
        let (first, second) = tokio::join!(
            service.process_request(&id, request.clone()),
            service.process_request(&id, request)
        );

        assert_eq!(first, second);
        assert_eq!(first.kind(), "diff_preview");
        let completions = drain(&mut events)
            .into_iter()
            .filter(|name| *name == "session_completed")
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn write_diff_previews_without_mutating() {
        let (service, _) = service(MockScript::Hang);
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "a\nb\nc")])
            .await
            .unwrap();
        let mut diffs = DiffMap::new();
        diffs.insert("a.ts".to_string(), vec![CodeModeDiff::modify(1, None, "B")]);

        let response = service
            .process_request(&id, CodeModeRequest::WriteDiff { diffs: diffs.clone() })
            .await;
        let CodeModeResponse::DiffPreview { previews, .. } = response else {
            panic!("expected diff preview, got {response:?}");
        };
        assert_eq!(previews["a.ts"], "a\nB\nc");

        let session = service.get_session_info(&id).await.unwrap();
        assert_eq!(session.file("a.ts").unwrap().content, "a\nb\nc");
        assert_eq!(session.pending_diffs, diffs);
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn file_requests_read_list_create_and_delete() {
        let (service, _) = service(MockScript::Hang);
        let id = service
            .create_session(vec![FileBuffer::new("src/a.ts", "x")])
            .await
            .unwrap();

        let read = service
            .process_request(
                &id,
                CodeModeRequest::ReadFile {
                    path: "src/a.ts".to_string(),
                },
            )
            .await;
        assert!(matches!(read, CodeModeResponse::FileContent { ref file, .. } if file.name == "a.ts"));

        let created = service
            .process_request(
                &id,
                CodeModeRequest::CreateFile {
                    path: "b.json".to_string(),
                    content: "{}".to_string(),
                },
            )
            .await;
        assert!(created.success());

        let duplicate = service
            .process_request(
                &id,
                CodeModeRequest::CreateFile {
                    path: "b.json".to_string(),
                    content: "[]".to_string(),
                },
            )
            .await;
        assert_eq!(duplicate.error_kind(), Some(ErrorKind::InvalidRequest));

        let deleted = service
            .process_request(
                &id,
                CodeModeRequest::DeleteFile {
                    path: "src/a.ts".to_string(),
                },
            )
            .await;
        assert!(deleted.success());

        let CodeModeResponse::FileList { files, .. } =
            service.process_request(&id, CodeModeRequest::ListFiles).await
        else {
            panic!("expected file list");
        };
        let paths: Vec<&str> = files.iter().map(|file| file.path.as_str()).collect();
        assert_eq!(paths, vec!["b.json"]);
        assert!(files[0].has_edits);
    }

    #[tokio::test]
    async fn failed_request_marks_session_and_emits_error() {
        let (service, _) = service(MockScript::Hang);
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "")])
            .await
            .unwrap();
        let mut events = service.subscribe();

        let response = service
            .process_request(
                &id,
                CodeModeRequest::ReadFile {
                    path: "missing.ts".to_string(),
                },
            )
            .await;
        assert_eq!(response.error_kind(), Some(ErrorKind::InvalidRequest));
        let session = service.get_session_info(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.error.unwrap().contains("missing.ts"));
        assert_eq!(drain(&mut events), vec!["session_failed", "session_error"]);
    }

    #[tokio::test]
    async fn unknown_session_yields_error_response() {
        let (service, _) = service(MockScript::Hang);
        let ghost = SessionId::generate();
        let response = service.process_request(&ghost, CodeModeRequest::ListFiles).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::SessionNotFound));
        assert_eq!(response.session_id(), &ghost);

        let response = service.execute_code_task(&ghost, "task", None, None).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::SessionNotFound));
    }

    #[tokio::test]
    async fn diff_order_is_normalized() {
        let (service, _) = service(MockScript::Hang);
        let id = service
            .create_session(vec![FileBuffer::new("a.txt", "a\nb\nc")])
            .await
            .unwrap();
        let mut diffs = DiffMap::new();
        diffs.insert(
            "a.txt".to_string(),
            vec![CodeModeDiff::remove(1, Some(1)), CodeModeDiff::add(0, "X")],
        );

        let response = service.apply_diffs(&id, &diffs).await;
        assert!(response.success());
        let session = service.get_session_info(&id).await.unwrap();
        assert_eq!(session.file("a.txt").unwrap().content, "X\na\nc");
    }

    #[tokio::test]
    async fn one_bad_file_does_not_block_the_others() {
        let (service, _) = service(MockScript::Hang);
        let id = service
            .create_session(vec![
                FileBuffer::new("a.txt", "one\ntwo"),
                FileBuffer::new("b.txt", "one\ntwo"),
            ])
            .await
            .unwrap();
        let mut events = service.subscribe();
        let mut diffs = DiffMap::new();
        diffs.insert("a.txt".to_string(), vec![CodeModeDiff::modify(9, None, "nope")]);
        diffs.insert("b.txt".to_string(), vec![CodeModeDiff::modify(1, None, "TWO")]);

        let CodeModeResponse::Confirmation {
            success,
            applied,
            errors,
            ..
        } = service.apply_diffs(&id, &diffs).await
        else {
            panic!("expected confirmation");
        };
        assert!(!success);
        assert_eq!(applied, vec!["b.txt".to_string()]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "a.txt");

        let session = service.get_session_info(&id).await.unwrap();
        assert_eq!(session.file("a.txt").unwrap().content, "one\ntwo");
        assert!(!session.file("a.txt").unwrap().has_edits);
        assert_eq!(session.file("b.txt").unwrap().content, "one\nTWO");
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(drain(&mut events), vec!["diffs_applied", "session_failed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_orchestrator_times_out() {
        let (service, mock) = service(MockScript::Hang);
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "x")])
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let response = service.execute_code_task(&id, "never finishes", None, None).await;
        let elapsed = started.elapsed();

        assert_eq!(response.error_kind(), Some(ErrorKind::TimeoutError));
        assert!(elapsed >= Duration::from_millis(1_000));
        assert!(elapsed <= Duration::from_millis(1_000 + 100 + 50));
        let session = service.get_session_info(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.error.as_deref(), Some("Request timed out"));
        assert_eq!(mock.cancel_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn orchestrator_failure_becomes_error_response() {
        let (service, _) = service(MockScript::fail("model overloaded"));
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "x")])
            .await
            .unwrap();
        let response = service.execute_code_task(&id, "task", None, None).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::UnknownError));
        let session = service.get_session_info(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.error.unwrap().contains("model overloaded"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_start_is_reported_without_cancel() {
        let (service, mock) = service(MockScript::Reject("quota".to_string()));
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "x")])
            .await
            .unwrap();
        let response = service.execute_code_task(&id, "task", None, None).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::UnknownError));
        assert_eq!(mock.cancel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_tasks_are_refused() {
        let (service, _) = service(MockScript::Hang);
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "x")])
            .await
            .unwrap();

        let running = {
            let service = service.clone();
            let id = id.clone();
            tokio::spawn(async move { service.execute_code_task(&id, "first", None, None).await })
        };
        wait_until_processing(&service, &id).await;

        let second = service.execute_code_task(&id, "second", None, None).await;
        assert_eq!(second.error_kind(), Some(ErrorKind::InvalidRequest));
        assert_eq!(
            service.get_session_info(&id).await.unwrap().status,
            SessionStatus::Processing
        );

        let first = running.await.unwrap();
        assert_eq!(first.error_kind(), Some(ErrorKind::TimeoutError));
    }

    #[tokio::test(start_paused = true)]
    async fn identical_concurrent_tasks_share_one_orchestrator_run() {
        let (service, mock) = service(MockScript::complete(vec![modify("a.ts", 0, "y")]));
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "x")])
            .await
            .unwrap();
        let (first, second) = tokio::join!(
            service.execute_code_task(&id, "same", None, None),
            service.execute_code_task(&id, "same", None, None)
        );
        assert_eq!(first, second);
        assert_eq!(first.kind(), "diff_preview");
        assert_eq!(mock.start_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn selection_filters_files_sent_to_orchestrator() {
        let (service, mock) = service(MockScript::complete(Vec::new()));
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "x"), FileBuffer::new("b.ts", "y")])
            .await
            .unwrap();

        let selected = vec!["b.ts".to_string()];
        let response = service
            .execute_code_task(&id, "task", Some("keep it short"), Some(&selected))
            .await;
        assert!(response.success());
        let requests = mock.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].files.len(), 1);
        assert_eq!(requests[0].files[0].path, "b.ts");
        assert_eq!(requests[0].rules.as_deref(), Some("keep it short"));

        let none = vec!["zzz.ts".to_string()];
        let response = service.execute_code_task(&id, "task", None, Some(&none)).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::InvalidRequest));
        assert_eq!(mock.start_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_immediate_and_idempotent() {
        let (service, mock) = service(MockScript::Hang);
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "x")])
            .await
            .unwrap();
        let mut events = service.subscribe();

        let running = {
            let service = service.clone();
            let id = id.clone();
            tokio::spawn(async move { service.execute_code_task(&id, "task", None, None).await })
        };
        wait_until_processing(&service, &id).await;
        tokio::task::yield_now().await;

        service.cancel_session(&id).await;
        assert_eq!(
            service.get_session_info(&id).await.unwrap().status,
            SessionStatus::Cancelled
        );
        service.cancel_session(&id).await;
        assert_eq!(
            service.get_session_info(&id).await.unwrap().status,
            SessionStatus::Cancelled
        );

        let response = running.await.unwrap();
        assert_eq!(response.error_kind(), Some(ErrorKind::InvalidRequest));
        assert_eq!(mock.cancel_count(), 1);

        let cancelled: Vec<IntegrationEvent> = std::iter::from_fn(|| events.try_recv())
            .map(|record| record.body)
            .filter(|event| event.name() == "session_cancelled")
            .collect();
        assert_eq!(
            cancelled,
            vec![IntegrationEvent::SessionCancelled {
                session_id: id.clone(),
                forced: true,
            }]
        );

        let response = service.process_request(&id, CodeModeRequest::ListFiles).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::InvalidRequest));
        assert_eq!(
            service.get_session_info(&id).await.unwrap().status,
            SessionStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn cancel_unknown_session_is_a_noop() {
        let (service, mock) = service(MockScript::Hang);
        let mut events = service.subscribe();
        service.cancel_session(&SessionId::generate()).await;
        assert!(drain(&mut events).is_empty());
        assert_eq!(mock.cancel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_cancel_is_bounded() {
        let mock = Arc::new(MockOrchestrator::new(MockScript::Hang).with_unresponsive_cancel());
        let service = CodeModeService::new(config(), mock.clone());
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "x")])
            .await
            .unwrap();
        let running = {
            let service = service.clone();
            let id = id.clone();
            tokio::spawn(async move { service.execute_code_task(&id, "task", None, None).await })
        };
        wait_until_processing(&service, &id).await;
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        service.cancel_session(&id).await;
        assert!(started.elapsed() <= Duration::from_millis(150));
        assert_eq!(mock.cancel_count(), 1);
        running.abort();
    }

    #[tokio::test]
    async fn expiry_sweep_removes_idle_sessions_once() {
        let (service, _) = service(MockScript::Hang);
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "")])
            .await
            .unwrap();
        let mut events = service.subscribe();

        assert!(service.sweep_expired().await.is_empty());
        let later = Utc::now() + chrono::Duration::minutes(11);
        assert_eq!(service.sweep_expired_at(later).await, vec![id.clone()]);
        assert!(service.sweep_expired_at(later).await.is_empty());

        assert!(service.get_session_info(&id).await.is_none());
        assert_eq!(drain(&mut events), vec!["session_expired"]);
    }

    #[tokio::test]
    async fn update_session_files_refuses_unknown_and_cancelled() {
        let (service, _) = service(MockScript::Hang);
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "")])
            .await
            .unwrap();
        assert!(
            service
                .update_session_files(&id, vec![FileBuffer::new("b.ts", "new")])
                .await
        );
        let session = service.get_session_info(&id).await.unwrap();
        assert_eq!(session.files[0].path, "b.ts");

        assert!(
            !service
                .update_session_files(&SessionId::generate(), Vec::new())
                .await
        );
        service.cancel_session(&id).await;
        assert!(!service.update_session_files(&id, Vec::new()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn correlated_orchestrator_events_are_mirrored() {
        let (service, _) = service(MockScript::complete(vec![modify("a.ts", 0, "y")]));
        service.init().await;
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "x")])
            .await
            .unwrap();
        let mut events = service.subscribe();

        let response = service.execute_code_task(&id, "task", None, None).await;
        assert!(response.success());

        let started = wait_for(&mut events, "session_started").await;
        assert_eq!(started.session_id(), &id);
        let progress = wait_for(&mut events, "session_progress").await;
        assert!(matches!(
            progress,
            IntegrationEvent::SessionProgress {
                progress: Some(_),
                ..
            }
        ));
        let completed = wait_for(&mut events, "orchestrator_completed").await;
        assert!(matches!(
            completed,
            IntegrationEvent::OrchestratorCompleted { diff_count: 1, .. }
        ));
        service.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_runs_on_interval() {
        let (service, _) = service_with(
            MockScript::Hang,
            CodeModeConfig {
                session_timeout_secs: 60,
                sweep_interval_secs: 2,
                ..config()
            },
        );
        let mut events = service.subscribe();
        service.init().await;
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "")])
            .await
            .unwrap();
        service
            .inner
            .registry
            .lock()
            .await
            .get_mut(&id)
            .unwrap()
            .last_activity = Utc::now() - chrono::Duration::hours(1);

        let expired = wait_for(&mut events, "session_expired").await;
        assert_eq!(expired.session_id(), &id);
        service.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_wait_for_the_running_task() {
        let (service, mock) = service(MockScript::Hang);
        let id = service
            .create_session(vec![FileBuffer::new("a.ts", "x\ny")])
            .await
            .unwrap();

        let running = {
            let service = service.clone();
            let id = id.clone();
            tokio::spawn(async move { service.execute_code_task(&id, "first", None, None).await })
        };
        wait_until_processing(&service, &id).await;

        let mut diffs = DiffMap::new();
        diffs.insert("a.ts".to_string(), vec![CodeModeDiff::modify(0, None, "X")]);
        let applied = service.apply_diffs(&id, &diffs).await;
        assert_eq!(applied.error_kind(), Some(ErrorKind::InvalidRequest));
        assert!(
            !service
                .update_session_files(&id, vec![FileBuffer::new("b.ts", "new")])
                .await
        );

        let session = service.get_session_info(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Processing);
        assert_eq!(session.files.len(), 1);
        assert_eq!(session.file("a.ts").unwrap().content, "x\ny");

        let second = service.execute_code_task(&id, "second", None, None).await;
        assert_eq!(second.error_kind(), Some(ErrorKind::InvalidRequest));

        let first = running.await.unwrap();
        assert_eq!(first.error_kind(), Some(ErrorKind::TimeoutError));
        assert_eq!(mock.start_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn file_set_changes_keep_live_fingerprints_unique() {
        let (service, mock) = service(MockScript::Hang);
        let a = service
            .create_session(vec![FileBuffer::new("a.ts", "abc")])
            .await
            .unwrap();
        let b = service
            .create_session(vec![FileBuffer::new("b.ts", "xy")])
            .await
            .unwrap();

        assert!(
            !service
                .update_session_files(&b, vec![FileBuffer::new("a.ts", "zzz")])
                .await
        );
        let fingerprint = |id: &SessionId| {
            let service = service.clone();
            let id = id.clone();
            async move { service.get_session_info(&id).await.unwrap().fingerprint }
        };
        assert_ne!(fingerprint(&a).await, fingerprint(&b).await);
        let again = service
            .create_session(vec![FileBuffer::new("a.ts", "123")])
            .await
            .unwrap();
        assert_eq!(again, a);

        // A busy session cannot shrink into a live session's shape either.
        assert!(
            service
                .update_session_files(
                    &b,
                    vec![FileBuffer::new("a.ts", "abc"), FileBuffer::new("b.ts", "xy")],
                )
                .await
        );
        let running = {
            let service = service.clone();
            let id = b.clone();
            tokio::spawn(async move { service.execute_code_task(&id, "task", None, None).await })
        };
        wait_until_processing(&service, &b).await;
        let deleted = service
            .process_request(
                &b,
                CodeModeRequest::DeleteFile {
                    path: "b.ts".to_string(),
                },
            )
            .await;
        assert_eq!(deleted.error_kind(), Some(ErrorKind::InvalidRequest));
        let session = service.get_session_info(&b).await.unwrap();
        assert_eq!(session.files.len(), 2);
        assert_eq!(session.status, SessionStatus::Processing);
        assert_eq!(running.await.unwrap().error_kind(), Some(ErrorKind::TimeoutError));
        assert_eq!(mock.start_count(), 1);
    }

    #[tokio::test]
    async fn settled_session_cannot_go_live_over_a_newer_twin() {
        let (service, mock) = service(MockScript::Hang);
        let first = service
            .create_session(vec![FileBuffer::new("a.ts", "abc")])
            .await
            .unwrap();
        let listed = service.process_request(&first, CodeModeRequest::ListFiles).await;
        assert!(listed.success());

        let twin = service
            .create_session(vec![FileBuffer::new("a.ts", "xyz")])
            .await
            .unwrap();
        assert_ne!(twin, first);

        let response = service.execute_code_task(&first, "task", None, None).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::InvalidRequest));
        assert_eq!(mock.start_count(), 0);
        assert_eq!(
            service.get_session_info(&first).await.unwrap().status,
            SessionStatus::Completed
        );
    }

    #[tokio::test]
    async fn destroy_releases_everything() {
        let (service, _) = service(MockScript::Hang);
        service.init().await;
        service
            .create_session(vec![FileBuffer::new("a.ts", "")])
            .await
            .unwrap();
        service
            .create_session(vec![FileBuffer::new("b.ts", "")])
            .await
            .unwrap();
        let mut events = service.subscribe();

        service.destroy().await;
        assert!(service.list_sessions().await.is_empty());
        assert_eq!(
            drain(&mut events),
            vec!["session_cancelled", "session_cancelled"]
        );
    }
}
