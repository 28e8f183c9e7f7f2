//! File-backed session store under `.auto/sessions/`.
//!
//! Each session lives in its own directory. Writes are atomic file
//! replacements, so status tooling can read while the loop runs.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::atomic::write_json_atomic;
use super::paths::{AutoPaths, SessionPaths};
use crate::core::session::{Checkpoint, SessionState};
use crate::core::types::LoopStatus;

/// Persisted state exists but cannot be parsed. Fatal for that session only.
#[derive(Debug)]
pub struct StateCorruptError {
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for StateCorruptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "corrupt session file {}: {} (left untouched for inspection)",
            self.path.display(),
            self.message
        )
    }
}

impl std::error::Error for StateCorruptError {}

/// No active (or archived) session with the requested id.
#[derive(Debug)]
pub struct SessionNotFoundError {
    pub session_id: String,
}

impl fmt::Display for SessionNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session not found: {}", self.session_id)
    }
}

impl std::error::Error for SessionNotFoundError {}

/// Generate `auto-YYYYMMDD-HHMMSS`, suffixed `-2`, `-3`, ... while `taken` says so.
pub fn new_session_id(now: DateTime<Utc>, taken: impl Fn(&str) -> bool) -> String {
    let base = format!("auto-{}", now.format("%Y%m%d-%H%M%S"));
    if !taken(&base) {
        return base;
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{base}-{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    paths: AutoPaths,
}

impl SessionStore {
    pub fn new(paths: AutoPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &AutoPaths {
        &self.paths
    }

    pub fn session_paths(&self, session_id: &str) -> SessionPaths {
        self.paths.session(session_id)
    }

    fn id_taken(&self, id: &str) -> bool {
        self.paths.session(id).dir.exists() || self.paths.archived_session(id).dir.exists()
    }

    /// Create and persist a fresh session with a generated id.
    pub fn create(&self, promise: Option<String>) -> Result<SessionState> {
        let now = Utc::now();
        let id = new_session_id(now, |candidate| self.id_taken(candidate));
        self.create_with_id(&id, promise, now)
    }

    pub fn create_with_id(
        &self,
        session_id: &str,
        promise: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<SessionState> {
        if self.id_taken(session_id) {
            return Err(anyhow!("session {session_id} already exists"));
        }
        let mut state = SessionState::new(session_id, promise, now);
        self.write_state(&mut state, now)?;
        info!(session_id, "session created");
        Ok(state)
    }

    /// Load an active session.
    pub fn load(&self, session_id: &str) -> Result<SessionState> {
        let paths = self.paths.session(session_id);
        if !paths.state_path.exists() {
            return Err(SessionNotFoundError {
                session_id: session_id.to_string(),
            }
            .into());
        }
        let state: SessionState = read_record(&paths.state_path)?;
        debug!(session_id, status = state.status.as_str(), "session loaded");
        Ok(state)
    }

    /// Load the session if it exists; otherwise initialize it under `session_id`.
    pub fn load_or_create(&self, session_id: &str, promise: Option<String>) -> Result<SessionState> {
        match self.load(session_id) {
            Ok(state) => Ok(state),
            Err(err) if err.downcast_ref::<SessionNotFoundError>().is_some() => {
                self.create_with_id(session_id, promise, Utc::now())
            }
            Err(err) => Err(err),
        }
    }

    /// Persist state atomically, stamping `last_activity`.
    pub fn save(&self, state: &mut SessionState) -> Result<()> {
        self.write_state(state, Utc::now())
    }

    fn write_state(&self, state: &mut SessionState, now: DateTime<Utc>) -> Result<()> {
        state.last_activity = now;
        let path = self.paths.session(&state.session_id).state_path;
        debug!(
            session_id = %state.session_id,
            status = state.status.as_str(),
            iteration = state.iteration,
            "writing session state"
        );
        write_json_atomic(&path, state)
    }

    /// Overwrite the session's checkpoint and mirror its resume point into state.
    pub fn write_checkpoint(&self, state: &mut SessionState, checkpoint: &Checkpoint) -> Result<()> {
        let paths = self.paths.session(&state.session_id);
        write_json_atomic(&paths.checkpoint_path, checkpoint)?;
        state.resume_point = Some(checkpoint.resume_point.clone());
        self.save(state)?;
        info!(
            session_id = %state.session_id,
            reason = checkpoint.reason.as_str(),
            task_id = checkpoint.resume_point.task_id,
            "checkpoint written"
        );
        Ok(())
    }

    pub fn load_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.paths.session(session_id).checkpoint_path;
        if !path.exists() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    /// Remove the checkpoint once it has been acted upon and persist the
    /// cleared resume point. A missing checkpoint is not an error.
    pub fn clear_checkpoint(&self, state: &mut SessionState) -> Result<()> {
        let path = self.paths.session(&state.session_id).checkpoint_path;
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            debug!(session_id = %state.session_id, "checkpoint consumed");
        }
        state.resume_point = None;
        self.save(state)
    }

    /// Move a session directory from active to archive.
    pub fn archive(&self, session_id: &str) -> Result<PathBuf> {
        let from = self.paths.session(session_id).dir;
        let to = self.paths.archived_session(session_id).dir;
        move_session_dir(&from, &to, session_id)?;
        info!(session_id, archive = %to.display(), "session archived");
        Ok(to)
    }

    /// Move an archived session back to active.
    pub fn restore(&self, session_id: &str) -> Result<SessionState> {
        let from = self.paths.archived_session(session_id).dir;
        let to = self.paths.session(session_id).dir;
        move_session_dir(&from, &to, session_id)?;
        info!(session_id, "session restored from archive");
        self.load(session_id)
    }

    pub fn is_archived(&self, session_id: &str) -> bool {
        self.paths.archived_session(session_id).state_path.exists()
    }

    /// Load an archived session without moving it.
    pub fn load_archived(&self, session_id: &str) -> Result<SessionState> {
        let path = self.paths.archived_session(session_id).state_path;
        if !path.exists() {
            return Err(SessionNotFoundError {
                session_id: session_id.to_string(),
            }
            .into());
        }
        read_record(&path)
    }

    pub fn list_active(&self) -> Result<Vec<String>> {
        list_session_ids(&self.paths.active_dir)
    }

    pub fn list_archived(&self) -> Result<Vec<String>> {
        list_session_ids(&self.paths.archive_dir)
    }

    /// The running or resumable session with the most recent activity.
    ///
    /// Corrupt sessions are skipped with a warning; load them by id to see the error.
    pub fn latest_resumable(&self) -> Result<Option<SessionState>> {
        let mut latest: Option<SessionState> = None;
        for id in self.list_active()? {
            let state = match self.load(&id) {
                Ok(state) => state,
                Err(err) => {
                    warn!(session_id = %id, err = %format!("{err:#}"), "skipping unreadable session");
                    continue;
                }
            };
            if !(state.status.is_resumable() || state.status == LoopStatus::Running) {
                continue;
            }
            if latest
                .as_ref()
                .is_none_or(|current| state.last_activity > current.last_activity)
            {
                latest = Some(state);
            }
        }
        Ok(latest)
    }
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).map_err(|err| {
        StateCorruptError {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
        .into()
    })
}

fn move_session_dir(from: &Path, to: &Path, session_id: &str) -> Result<()> {
    if !from.is_dir() {
        return Err(SessionNotFoundError {
            session_id: session_id.to_string(),
        }
        .into());
    }
    if to.exists() {
        return Err(anyhow!("cannot move session: {} already exists", to.display()));
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::rename(from, to)
        .with_context(|| format!("move {} to {}", from.display(), to.display()))
}

fn list_session_ids(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        if entry.path().is_dir()
            && let Some(name) = entry.file_name().to_str()
        {
            ids.push(name.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::CheckpointReason;

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn store(root: &Path) -> SessionStore {
        SessionStore::new(AutoPaths::new(root))
    }

    #[test]
    fn session_ids_get_suffix_on_collision() {
        let now = at("2026-03-01T10:20:30Z");
        assert_eq!(new_session_id(now, |_| false), "auto-20260301-102030");
        let taken = ["auto-20260301-102030", "auto-20260301-102030-2"];
        assert_eq!(
            new_session_id(now, |id| taken.contains(&id)),
            "auto-20260301-102030-3"
        );
    }

    #[test]
    fn create_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let mut state = store.create(Some("DONE".to_string())).expect("create");
        state.update_usage(42);
        state.add_decision("keep going");
        store.save(&mut state).expect("save");

        let loaded = store.load(&state.session_id).expect("load");
        assert_eq!(loaded, state);
        assert_eq!(store.list_active().expect("list"), vec![state.session_id.clone()]);
    }

    #[test]
    fn missing_session_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = store(temp.path()).load("auto-missing").unwrap_err();
        assert!(err.downcast_ref::<SessionNotFoundError>().is_some());
    }

    #[test]
    fn malformed_state_is_reported_as_corrupt_and_left_in_place() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let state = store.create(None).expect("create");
        let path = store.session_paths(&state.session_id).state_path;
        fs::write(&path, "{ not json").expect("corrupt");

        let err = store.load(&state.session_id).unwrap_err();
        let corrupt = err.downcast_ref::<StateCorruptError>().expect("corrupt error");
        assert_eq!(corrupt.path, path);
        assert_eq!(fs::read_to_string(&path).expect("read"), "{ not json");
        // load_or_create must not reset a corrupt session.
        assert!(store.load_or_create(&state.session_id, None).is_err());
    }

    #[test]
    fn checkpoint_is_overwritten_and_mirrored_into_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let mut state = store.create(None).expect("create");

        let first = state.checkpoint(CheckpointReason::Pause, None, "first", Utc::now());
        store.write_checkpoint(&mut state, &first).expect("write");
        let second = state.checkpoint(CheckpointReason::Interrupt, None, "second", Utc::now());
        store.write_checkpoint(&mut state, &second).expect("write");

        let loaded = store
            .load_checkpoint(&state.session_id)
            .expect("load")
            .expect("present");
        assert_eq!(loaded, second);
        let reloaded = store.load(&state.session_id).expect("load state");
        assert_eq!(reloaded.resume_point, Some(second.resume_point));
    }

    #[test]
    fn cleared_checkpoint_is_gone_from_disk_and_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let mut state = store.create(None).expect("create");
        let checkpoint = state.checkpoint(CheckpointReason::Pause, None, "hint", Utc::now());
        store.write_checkpoint(&mut state, &checkpoint).expect("write");

        store.clear_checkpoint(&mut state).expect("clear");
        assert!(store.load_checkpoint(&state.session_id).expect("load").is_none());
        assert_eq!(store.load(&state.session_id).expect("load").resume_point, None);
        store.clear_checkpoint(&mut state).expect("clearing twice is fine");
    }

    #[test]
    fn archive_and_restore_move_the_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let state = store.create(None).expect("create");
        let id = state.session_id.clone();

        store.archive(&id).expect("archive");
        assert!(store.list_active().expect("active").is_empty());
        assert_eq!(store.list_archived().expect("archived"), vec![id.clone()]);
        assert!(store.is_archived(&id));
        assert_eq!(store.load_archived(&id).expect("load archived").session_id, id);

        let restored = store.restore(&id).expect("restore");
        assert_eq!(restored.session_id, id);
        assert!(store.list_archived().expect("archived").is_empty());
    }

    #[test]
    fn latest_resumable_prefers_recent_activity_and_skips_finished() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());

        let mut older = store
            .create_with_id("auto-a", None, at("2026-03-01T10:00:00Z"))
            .expect("create");
        older.status = LoopStatus::Paused;
        store.write_state(&mut older, at("2026-03-01T10:00:00Z")).expect("save");

        let mut newer = store
            .create_with_id("auto-b", None, at("2026-03-01T11:00:00Z"))
            .expect("create");
        newer.status = LoopStatus::ContextCleanup;
        store.write_state(&mut newer, at("2026-03-01T11:00:00Z")).expect("save");

        let mut failed = store
            .create_with_id("auto-c", None, at("2026-03-01T12:00:00Z"))
            .expect("create");
        failed.status = LoopStatus::Failed;
        store.write_state(&mut failed, at("2026-03-01T12:00:00Z")).expect("save");

        let latest = store.latest_resumable().expect("latest").expect("some");
        assert_eq!(latest.session_id, "auto-b");
    }
}
