//! Durable pull sessions.
//!
//! All sessions live in one JSON document (`{"pull": {<key>: {...}}}`). Every
//! mutation rewrites the whole document through a temp file and an atomic
//! rename. The store's mutex serializes writers within one process; separate
//! processes writing the same document are not coordinated.
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::fetch::PageProgress;
use crate::model::{Metadata, SyncKind, SyncTarget};
use crate::resume::{PullOptions, ResumeState};

pub const SESSION_FILE_NAME: &str = "sessions.json";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error("session document I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("session document {path} is not valid JSON: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode session document: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("no per-user config directory is available")]
    NoConfigDir,
}

/// Persisted record of one pull invocation and its last-known progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullSession {
    pub key: String,
    pub target: SyncKind,
    pub endpoint: String,
    pub last_page: u32,
    pub fetched_count: u64,
    pub store: bool,
    pub stdout: bool,
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    pub table_cleared: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_login: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    pub updated_at: DateTime<Utc>,
}

impl PullSession {
    pub fn new(key: impl Into<String>, target: &SyncTarget, options: &PullOptions) -> Self {
        Self {
            key: key.into(),
            target: target.kind,
            endpoint: target.kind.endpoint().to_string(),
            last_page: 0,
            fetched_count: 0,
            store: options.store,
            stdout: options.stdout,
            interval: options.interval,
            table_cleared: false,
            team_slug: target.team_slug.clone(),
            repo_name: target.repo_name.clone(),
            user_login: target.user_login.clone(),
            metadata: Metadata::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn sync_target(&self) -> SyncTarget {
        SyncTarget {
            kind: self.target,
            team_slug: self.team_slug.clone(),
            repo_name: self.repo_name.clone(),
            user_login: self.user_login.clone(),
        }
    }

    /// Options the session was started with, resuming from its last page.
    pub fn pull_options(&self) -> PullOptions {
        PullOptions {
            store: self.store,
            stdout: self.stdout,
            interval: self.interval,
            resume: self.resume_state(),
        }
    }

    /// Resume point recorded by the last page advance. Empty until the
    /// first page has been fetched.
    pub fn resume_state(&self) -> ResumeState {
        if self.last_page == 0 {
            return ResumeState::default();
        }
        ResumeState {
            endpoint: self.endpoint.clone(),
            metadata: self.metadata.clone(),
            last_page: self.last_page,
            count: self.fetched_count,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionDocument {
    #[serde(default)]
    pull: BTreeMap<String, PullSession>,
}

#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store at the per-user default location.
    pub fn open_default() -> Result<Self, SessionError> {
        Ok(Self::new(Self::default_path()?))
    }

    pub fn default_path() -> Result<PathBuf, SessionError> {
        ProjectDirs::from("", "", "orgsync")
            .map(|dirs| dirs.config_dir().join(SESSION_FILE_NAME))
            .ok_or(SessionError::NoConfigDir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self) -> impl FnOnce(std::io::Error) -> SessionError + '_ {
        move |source| SessionError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn read_document(&self) -> Result<SessionDocument, SessionError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SessionDocument::default())
            }
            Err(err) => return Err(self.io_err()(err)),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(SessionDocument::default());
        }
        serde_json::from_slice(&raw).map_err(|source| SessionError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    async fn write_document(&self, doc: &SessionDocument) -> Result<(), SessionError> {
        let encoded = serde_json::to_vec_pretty(doc).map_err(SessionError::Encode)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(self.io_err())?;
        }
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| SESSION_FILE_NAME.to_string());
        let temp_path = self.path.with_file_name(format!("{}.tmp", file_name));

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(self.io_err())?;
        file.write_all(&encoded).await.map_err(self.io_err())?;
        file.sync_all().await.map_err(self.io_err())?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(self.io_err())?;
        Ok(())
    }

    /// Load, apply one change, write back; all under the store lock.
    async fn update<R>(
        &self,
        apply: impl FnOnce(&mut SessionDocument) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_document().await?;
        let out = apply(&mut doc)?;
        self.write_document(&doc).await?;
        Ok(out)
    }

    #[instrument(skip_all, fields(key = %session.key))]
    pub async fn save(&self, session: &PullSession) -> Result<(), SessionError> {
        let mut session = session.clone();
        session.updated_at = Utc::now();
        self.update(move |doc| {
            doc.pull.insert(session.key.clone(), session);
            Ok(())
        })
        .await
    }

    pub async fn load(&self, key: &str) -> Result<PullSession, SessionError> {
        let _guard = self.lock.lock().await;
        let doc = self.read_document().await?;
        doc.pull
            .get(key)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(key.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<PullSession>, SessionError> {
        let _guard = self.lock.lock().await;
        let doc = self.read_document().await?;
        Ok(doc.pull.into_values().collect())
    }

    /// Removes `key`; returns whether it existed.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn remove(&self, key: &str) -> Result<bool, SessionError> {
        self.update(|doc| Ok(doc.pull.remove(key).is_some())).await
    }

    /// Records a page advance for an existing session.
    #[instrument(skip_all, fields(key = %key, page = progress.page))]
    pub async fn record_progress(
        &self,
        key: &str,
        progress: &PageProgress,
        table_cleared: bool,
    ) -> Result<(), SessionError> {
        self.update(|doc| {
            let session = doc
                .pull
                .get_mut(key)
                .ok_or_else(|| SessionError::NotFound(key.to_string()))?;
            session.endpoint = progress.endpoint.clone();
            session.metadata = progress.metadata.clone();
            session.last_page = progress.page;
            session.fetched_count = progress.count;
            session.table_cleared = table_cleared;
            session.updated_at = Utc::now();
            Ok(())
        })
        .await?;
        debug!(count = progress.count, "session progress recorded");
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
