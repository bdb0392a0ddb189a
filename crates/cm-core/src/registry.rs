use crate::error::CodeModeError;
use crate::fingerprint::file_set_fingerprint;
use crate::types::{DiffMap, FileBuffer, Session, SessionId, SessionStats, SessionStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(SessionId),
    Existing(SessionId),
}

impl CreateOutcome {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Created(id) | Self::Existing(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    /// The session was `processing` when cancelled.
    pub forced: bool,
    pub orchestrator_session_id: Option<String>,
}

/// In-memory session map plus an orchestrator-id index.
///
/// Not synchronized; the owning service keeps it behind a mutex.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    by_orchestrator: HashMap<String, SessionId>,
}

impl SessionRegistry {
    /// Returns the live session with the same fingerprint if there is one,
    /// otherwise allocates a new `initializing` session.
    pub fn create(
        &mut self,
        files: Vec<FileBuffer>,
        max_active: usize,
    ) -> Result<CreateOutcome, CodeModeError> {
        ensure_unique_paths(&files).map_err(|path| CodeModeError::InvalidRequest {
            message: format!("duplicate file path: {path}"),
            session_id: None,
        })?;

        let fingerprint = file_set_fingerprint(&files);
        if let Some(existing) = self.find_active_by_fingerprint(&fingerprint) {
            return Ok(CreateOutcome::Existing(existing));
        }

        if self.active_count() >= max_active {
            return Err(CodeModeError::SessionLimitExceeded { max: max_active });
        }

        let now = Utc::now();
        let id = SessionId::generate();
        self.sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                orchestrator_session_id: String::new(),
                status: SessionStatus::Initializing,
                created_at: now,
                last_activity: now,
                files,
                pending_diffs: DiffMap::new(),
                error: None,
                fingerprint,
            },
        );
        Ok(CreateOutcome::Created(id))
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|session| session.status.is_active())
            .count()
    }

    pub fn find_active_by_fingerprint(&self, fingerprint: &str) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|session| session.status.is_active() && session.fingerprint == fingerprint)
            .map(|session| session.id.clone())
    }

    /// Another live session already owns `fingerprint`.
    pub fn fingerprint_taken(&self, id: &SessionId, fingerprint: &str) -> bool {
        self.live_fingerprints_except(id).contains(fingerprint)
    }

    pub fn live_fingerprints_except(&self, id: &SessionId) -> HashSet<String> {
        self.sessions
            .values()
            .filter(|session| &session.id != id && session.status.is_active())
            .map(|session| session.fingerprint.clone())
            .collect()
    }

    /// Moves a session to `status`. `error` is kept only for `failed`.
    pub fn set_status(&mut self, id: &SessionId, status: SessionStatus, error: Option<String>) -> bool {
        let Some(session) = self.sessions.get_mut(id) else {
            return false;
        };
        session.status = status;
        session.error = if status == SessionStatus::Failed {
            error
        } else {
            None
        };
        true
    }

    /// Stamps activity and flips to `processing`. Refuses cancelled sessions.
    pub fn begin_processing(&mut self, id: &SessionId) -> Result<&mut Session, CodeModeError> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| CodeModeError::SessionNotFound {
                session_id: id.clone(),
            })?;
        if session.status == SessionStatus::Cancelled {
            return Err(CodeModeError::invalid(
                id,
                "session was cancelled; create a new session",
            ));
        }
        session.last_activity = Utc::now();
        session.status = SessionStatus::Processing;
        session.error = None;
        Ok(session)
    }

    pub fn touch(&mut self, id: &SessionId) -> bool {
        let Some(session) = self.sessions.get_mut(id) else {
            return false;
        };
        session.last_activity = Utc::now();
        true
    }

    /// Swaps the working set. Refused while a task runs, and when a live
    /// session would end up sharing another's fingerprint.
    pub fn replace_files(&mut self, id: &SessionId, files: Vec<FileBuffer>) -> Result<(), String> {
        ensure_unique_paths(&files).map_err(|path| format!("duplicate file path: {path}"))?;
        let fingerprint = file_set_fingerprint(&files);
        let status = self
            .sessions
            .get(id)
            .map(|session| session.status)
            .ok_or_else(|| format!("session not found: {id}"))?;
        match status {
            SessionStatus::Cancelled => return Err("session was cancelled".to_string()),
            SessionStatus::Processing => return Err("session is processing a task".to_string()),
            _ => {}
        }
        if status.is_active() && self.fingerprint_taken(id, &fingerprint) {
            return Err("another live session has the same file set".to_string());
        }
        let Some(session) = self.sessions.get_mut(id) else {
            return Err(format!("session not found: {id}"));
        };
        let paths: HashSet<&str> = files.iter().map(|file| file.path.as_str()).collect();
        session
            .pending_diffs
            .retain(|path, _| paths.contains(path.as_str()));
        session.fingerprint = fingerprint;
        session.files = files;
        session.last_activity = Utc::now();
        Ok(())
    }

    pub fn bind_orchestrator(&mut self, id: &SessionId, orchestrator_session_id: &str) -> bool {
        let Some(session) = self.sessions.get_mut(id) else {
            return false;
        };
        if !session.orchestrator_session_id.is_empty() {
            self.by_orchestrator.remove(&session.orchestrator_session_id);
        }
        session.orchestrator_session_id = orchestrator_session_id.to_string();
        self.by_orchestrator
            .insert(orchestrator_session_id.to_string(), id.clone());
        true
    }

    pub fn session_for_orchestrator(&self, orchestrator_session_id: &str) -> Option<&SessionId> {
        self.by_orchestrator.get(orchestrator_session_id)
    }

    /// Marks the session cancelled and clears its pending work. Returns `None`
    /// for unknown or already cancelled sessions.
    pub fn cancel(&mut self, id: &SessionId) -> Option<CancelOutcome> {
        let session = self.sessions.get_mut(id)?;
        if session.status == SessionStatus::Cancelled {
            return None;
        }
        let forced = session.status == SessionStatus::Processing;
        session.status = SessionStatus::Cancelled;
        session.pending_diffs.clear();
        session.error = None;
        session.last_activity = Utc::now();

        let orchestrator_session_id = if session.orchestrator_session_id.is_empty() {
            None
        } else {
            self.by_orchestrator.remove(&session.orchestrator_session_id);
            Some(session.orchestrator_session_id.clone())
        };
        Some(CancelOutcome {
            forced,
            orchestrator_session_id,
        })
    }

    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        if !session.orchestrator_session_id.is_empty() {
            self.by_orchestrator.remove(&session.orchestrator_session_id);
        }
        Some(session)
    }

    /// Sessions idle for longer than `ttl` as of `now`.
    pub fn idle_since(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| now - session.last_activity > ttl)
            .map(|session| session.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub fn stats(&self, max_concurrent_sessions: usize) -> SessionStats {
        let mut stats = SessionStats {
            max_concurrent_sessions,
            ..SessionStats::default()
        };
        for session in self.sessions.values() {
            stats.total += 1;
            match session.status {
                SessionStatus::Initializing => stats.initializing += 1,
                SessionStatus::Processing => stats.processing += 1,
                SessionStatus::Completed => stats.completed += 1,
                SessionStatus::Failed => stats.failed += 1,
                SessionStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

fn ensure_unique_paths(files: &[FileBuffer]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for file in files {
        if !seen.insert(file.path.as_str()) {
            return Err(file.path.clone());
        }
    }
    Ok(())
}
