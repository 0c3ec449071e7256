use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::future::join_all;
use notesync_core::{ObjectRef, ObjectStat, StoreClient, TransferError, now_millis};
use thiserror::Error;

use super::reconcile::{self, Decision};
use super::registry::{Note, NoteId, Registry, RegistryError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("a sync is already running for note {0}")]
    Busy(NoteId),
    /// The note is not registered, or was removed while its sync was in flight.
    #[error("note {0} is not in the registry")]
    MissingNote(NoteId),
}

/// The slice of the object store the engine needs.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upload(&self, key: &str, local_path: &Path) -> Result<ObjectRef, TransferError>;
    async fn download(&self, key: &str, dest_path: &Path) -> Result<(), TransferError>;
    async fn stat(&self, key: &str) -> Result<ObjectStat, TransferError>;
}

#[async_trait]
impl RemoteStore for StoreClient {
    async fn upload(&self, key: &str, local_path: &Path) -> Result<ObjectRef, TransferError> {
        StoreClient::upload(self, key, local_path).await
    }

    async fn download(&self, key: &str, dest_path: &Path) -> Result<(), TransferError> {
        StoreClient::download(self, key, dest_path).await
    }

    async fn stat(&self, key: &str) -> Result<ObjectStat, TransferError> {
        StoreClient::stat(self, key).await
    }
}

/// What a sync request is about, captured when the request is issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub id: NoteId,
    pub key: String,
    pub path: PathBuf,
}

impl SyncTarget {
    /// `None` for drafts, which have no file yet.
    pub fn for_note(note: &Note) -> Option<Self> {
        if note.is_new {
            return None;
        }
        Some(Self {
            id: note.id.clone(),
            key: note.remote_key(),
            path: note.path.clone()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Comparing,
    Downloading,
    Uploading,
    Skipped,
    Prompting,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    DownloadSuccess,
    LocalIsNewest,
    NoRemoteFile,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::DownloadSuccess => "download-success",
            DownloadStatus::LocalIsNewest => "local-is-newest",
            DownloadStatus::NoRemoteFile => "no-remote-file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub id: NoteId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: Vec<NoteId>,
    pub failed: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn succeeded_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failed_ids(&self) -> Vec<NoteId> {
        self.failed.iter().map(|f| f.id.clone()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    registry: Arc<Registry>,
    phases: Mutex<HashMap<NoteId, SyncPhase>>,
    clock: fn() -> i64,
}

impl SyncEngine {
    pub fn new(remote: Arc<dyn RemoteStore>, registry: Arc<Registry>) -> Self {
        Self {
            remote,
            registry,
            phases: Mutex::new(HashMap::new()),
            clock: now_millis,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn phase(&self, id: &NoteId) -> SyncPhase {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
            .unwrap_or(SyncPhase::Idle)
    }

    /// Stat, reconcile, and download only when the remote copy is newer.
    ///
    /// A failed stat is reported as [`DownloadStatus::NoRemoteFile`], the same as a
    /// missing object.
    pub async fn sync_single_download(
        &self,
        target: &SyncTarget,
    ) -> Result<DownloadStatus, EngineError> {
        let guard = self.claim(&target.id, SyncPhase::Comparing)?;
        let note = self
            .registry
            .get(&target.id)
            .await
            .ok_or_else(|| EngineError::MissingNote(target.id.clone()))?;

        let stat = match self.remote.stat(&target.key).await {
            Ok(stat) => stat,
            Err(err) => {
                tracing::warn!(
                    id = %target.id,
                    key = %target.key,
                    class = ?err.classification(),
                    "stat failed, reporting no remote file: {err}"
                );
                guard.set(SyncPhase::Prompting);
                return Ok(DownloadStatus::NoRemoteFile);
            }
        };

        match reconcile::decide(&note, &stat) {
            Decision::RemoteMissing => {
                guard.set(SyncPhase::Prompting);
                Ok(DownloadStatus::NoRemoteFile)
            }
            Decision::LocalIsCurrent => {
                guard.set(SyncPhase::Skipped);
                Ok(DownloadStatus::LocalIsNewest)
            }
            Decision::Download => {
                guard.set(SyncPhase::Downloading);
                let staged = staging_path(&target.path);
                if let Err(err) = self.remote.download(&target.key, &staged).await {
                    discard(&staged).await;
                    return Err(err.into());
                }
                let now = (self.clock)();
                let committed = self
                    .registry
                    .commit_file(&target.id, &staged, &target.path, |note| {
                        note.is_synced = true;
                        note.updated_at = Some(now);
                    })
                    .await;
                match committed {
                    Ok(Some(_)) => {
                        guard.set(SyncPhase::Done);
                        Ok(DownloadStatus::DownloadSuccess)
                    }
                    Ok(None) => {
                        discard(&staged).await;
                        tracing::debug!(
                            id = %target.id,
                            "note removed during download, result dropped"
                        );
                        Err(EngineError::MissingNote(target.id.clone()))
                    }
                    Err(err) => {
                        discard(&staged).await;
                        Err(err.into())
                    }
                }
            }
        }
    }

    /// Uploads unconditionally. The note is marked synced only after the store accepts it.
    pub async fn sync_single_upload(&self, target: &SyncTarget) -> Result<(), EngineError> {
        let guard = self.claim(&target.id, SyncPhase::Uploading)?;
        self.remote.upload(&target.key, &target.path).await?;
        let now = (self.clock)();
        let updated = self
            .registry
            .update(&target.id, |note| {
                note.is_synced = true;
                note.updated_at = Some(now);
            })
            .await?;
        if updated.is_none() {
            tracing::debug!(id = %target.id, "note removed during upload, result dropped");
            return Err(EngineError::MissingNote(target.id.clone()));
        }
        guard.set(SyncPhase::Done);
        Ok(())
    }

    /// Uploads every target concurrently and waits for all of them to settle.
    ///
    /// Notes are marked synced only when the whole batch succeeded; a partial batch
    /// leaves every sync flag untouched and lists the failures instead.
    pub async fn sync_all(&self, targets: &[SyncTarget]) -> Result<BatchOutcome, EngineError> {
        let uploads = targets.iter().map(|target| async move {
            let result = match self.claim(&target.id, SyncPhase::Uploading) {
                Ok(guard) => self
                    .remote
                    .upload(&target.key, &target.path)
                    .await
                    .map(|_| guard)
                    .map_err(EngineError::from),
                Err(err) => Err(err),
            };
            (target.id.clone(), result)
        });
        let settled = join_all(uploads).await;

        let mut outcome = BatchOutcome::default();
        let mut guards = Vec::new();
        for (id, result) in settled {
            match result {
                Ok(guard) => {
                    outcome.succeeded.push(id);
                    guards.push(guard);
                }
                Err(err) => {
                    tracing::warn!(%id, "batch upload failed: {err}");
                    outcome.failed.push(BatchFailure {
                        id,
                        reason: err.to_string(),
                    });
                }
            }
        }

        if outcome.is_complete() && !outcome.succeeded.is_empty() {
            let now = (self.clock)();
            let marked = self.registry.mark_synced(&outcome.succeeded, now).await?;
            tracing::info!(uploaded = outcome.succeeded_count(), marked, "batch upload complete");
        } else if !outcome.is_complete() {
            tracing::warn!(
                uploaded = outcome.succeeded_count(),
                failed = outcome.failed.len(),
                "batch upload partially failed, sync flags left unchanged"
            );
        }
        for guard in &guards {
            guard.set(SyncPhase::Done);
        }
        Ok(outcome)
    }

    fn claim(&self, id: &NoteId, phase: SyncPhase) -> Result<PhaseGuard<'_>, EngineError> {
        let mut phases = self.phases.lock().unwrap_or_else(PoisonError::into_inner);
        if phases.contains_key(id) {
            return Err(EngineError::Busy(id.clone()));
        }
        phases.insert(id.clone(), phase);
        tracing::trace!(%id, ?phase, "sync claimed");
        Ok(PhaseGuard {
            phases: &self.phases,
            id: id.clone(),
        })
    }
}

/// Sibling file a download is written to before it replaces the note's file.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn discard(staged: &Path) {
    match tokio::fs::remove_file(staged).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %staged.display(), "could not remove staged download: {err}");
        }
    }
}

/// Holds a note's in-flight claim; dropping it returns the note to `Idle`.
struct PhaseGuard<'a> {
    phases: &'a Mutex<HashMap<NoteId, SyncPhase>>,
    id: NoteId,
}

impl PhaseGuard<'_> {
    fn set(&self, phase: SyncPhase) {
        tracing::trace!(id = %self.id, ?phase, "sync phase");
        if let Some(slot) = self
            .phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&self.id)
        {
            *slot = phase;
        }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
