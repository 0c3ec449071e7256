use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::sync::engine::{BatchFailure, DownloadStatus, EngineError, SyncEngine, SyncTarget};
use crate::sync::registry::NoteId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    Upload { target: SyncTarget },
    Download { target: SyncTarget },
    UploadAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    UploadComplete {
        id: NoteId,
    },
    UploadFailed {
        id: NoteId,
        reason: String,
    },
    DownloadComplete {
        id: NoteId,
        status: DownloadStatus,
    },
    DownloadFailed {
        id: NoteId,
        reason: String,
    },
    BatchUploadComplete {
        succeeded: Vec<NoteId>,
        failed: Vec<BatchFailure>,
    },
    Loading {
        active: bool,
    },
}

impl SyncEvent {
    /// Whether this event ends the work started by a request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncEvent::Loading { active: true })
    }
}

enum LaneJob {
    Upload(SyncTarget),
    Download(SyncTarget),
}

type Lanes = Arc<Mutex<HashMap<NoteId, UnboundedSender<LaneJob>>>>;

/// Routes sync requests to the engine and reports outcomes as events.
///
/// Requests for one note run one at a time in submission order. Different notes and
/// batch uploads run concurrently. A note's lane task exits once its queue drains.
/// Without an engine every request is dropped, as is any result for a note that left
/// the registry.
pub struct Coordinator {
    engine: Option<Arc<SyncEngine>>,
    events: UnboundedSender<SyncEvent>,
    lanes: Lanes,
}

impl Coordinator {
    pub fn new(engine: Option<Arc<SyncEngine>>) -> (Self, UnboundedReceiver<SyncEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let coordinator = Self {
            engine,
            events,
            lanes: Arc::new(Mutex::new(HashMap::new())),
        };
        (coordinator, receiver)
    }

    pub fn is_enabled(&self) -> bool {
        self.engine.is_some()
    }

    /// Must be called from within a tokio runtime.
    pub fn submit(&self, request: SyncRequest) {
        let Some(engine) = &self.engine else {
            tracing::debug!(?request, "sync disabled, request dropped");
            return;
        };
        match request {
            SyncRequest::Upload { target } => self.enqueue(engine, LaneJob::Upload(target)),
            SyncRequest::Download { target } => self.enqueue(engine, LaneJob::Download(target)),
            SyncRequest::UploadAll => {
                tokio::spawn(run_batch(engine.clone(), self.events.clone()));
            }
        }
    }

    #[cfg(test)]
    fn active_lanes(&self) -> usize {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn enqueue(&self, engine: &Arc<SyncEngine>, job: LaneJob) {
        let id = match &job {
            LaneJob::Upload(target) | LaneJob::Download(target) => target.id.clone(),
        };
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let job = match lanes.get(&id) {
            Some(lane) => match lane.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => {
                    tracing::warn!(%id, "sync lane closed, starting a new one");
                    job
                }
            },
            None => job,
        };
        let lane = spawn_lane(id.clone(), engine.clone(), self.events.clone(), self.lanes.clone());
        // A fresh receiver is open until the lane task drains it, which needs this lock.
        let _ = lane.send(job);
        lanes.insert(id, lane);
    }
}

fn spawn_lane(
    id: NoteId,
    engine: Arc<SyncEngine>,
    events: UnboundedSender<SyncEvent>,
    lanes: Lanes,
) -> UnboundedSender<LaneJob> {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let next = match receiver.try_recv() {
                Ok(job) => Some(job),
                Err(_) => {
                    let mut open = lanes.lock().unwrap_or_else(PoisonError::into_inner);
                    let job = receiver.try_recv().ok();
                    if job.is_none() {
                        open.remove(&id);
                    }
                    job
                }
            };
            let Some(job) = next else {
                tracing::trace!(%id, "sync lane drained");
                return;
            };
            if let Some(event) = run_job(&engine, job).await {
                let _ = events.send(event);
            }
        }
    });
    sender
}

async fn run_job(engine: &SyncEngine, job: LaneJob) -> Option<SyncEvent> {
    let event = match job {
        LaneJob::Upload(target) => match engine.sync_single_upload(&target).await {
            Ok(()) => {
                tracing::info!(id = %target.id, key = %target.key, "upload complete");
                SyncEvent::UploadComplete { id: target.id }
            }
            Err(EngineError::MissingNote(id)) => {
                tracing::debug!(%id, "upload result dropped for removed note");
                return None;
            }
            Err(err) => {
                tracing::warn!(id = %target.id, key = %target.key, "upload failed: {err}");
                SyncEvent::UploadFailed {
                    id: target.id,
                    reason: err.to_string(),
                }
            }
        },
        LaneJob::Download(target) => match engine.sync_single_download(&target).await {
            Ok(status) => {
                tracing::info!(id = %target.id, status = status.as_str(), "download finished");
                SyncEvent::DownloadComplete {
                    id: target.id,
                    status,
                }
            }
            Err(EngineError::MissingNote(id)) => {
                tracing::debug!(%id, "download result dropped for removed note");
                return None;
            }
            Err(err) => {
                tracing::warn!(id = %target.id, key = %target.key, "download failed: {err}");
                SyncEvent::DownloadFailed {
                    id: target.id,
                    reason: err.to_string(),
                }
            }
        },
    };
    Some(event)
}

/// Sends `Loading { active: false }` when dropped.
struct LoadingGuard<'a> {
    events: &'a UnboundedSender<SyncEvent>,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.events.send(SyncEvent::Loading { active: false });
    }
}

async fn run_batch(engine: Arc<SyncEngine>, events: UnboundedSender<SyncEvent>) {
    let _ = events.send(SyncEvent::Loading { active: true });
    let _loading = LoadingGuard { events: &events };

    let targets: Vec<SyncTarget> = engine
        .registry()
        .list()
        .await
        .iter()
        .filter_map(SyncTarget::for_note)
        .collect();
    let event = match engine.sync_all(&targets).await {
        Ok(outcome) => SyncEvent::BatchUploadComplete {
            succeeded: outcome.succeeded,
            failed: outcome.failed,
        },
        Err(err) => {
            tracing::error!(notes = targets.len(), "batch upload aborted: {err}");
            let reason = err.to_string();
            SyncEvent::BatchUploadComplete {
                succeeded: Vec::new(),
                failed: targets
                    .into_iter()
                    .map(|target| BatchFailure {
                        id: target.id,
                        reason: reason.clone(),
                    })
                    .collect(),
            }
        }
    };
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::engine::RemoteStore;
    use crate::sync::registry::{Note, Registry};
    use async_trait::async_trait;
    use notesync_core::{ObjectRef, ObjectStat, TransferError};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct ScriptedRemote {
        calls: Mutex<Vec<String>>,
        upload_delay: Duration,
        reject_uploads: bool,
        remote_modified_at: Option<i64>,
        reject_downloads: bool,
    }

    impl ScriptedRemote {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteStore for ScriptedRemote {
        async fn upload(&self, key: &str, _local_path: &Path) -> Result<ObjectRef, TransferError> {
            tokio::time::sleep(self.upload_delay).await;
            self.calls.lock().unwrap().push(format!("upload {key}"));
            if self.reject_uploads {
                return Err(TransferError::Unauthorized {
                    body: "bad token".into(),
                });
            }
            Ok(ObjectRef {
                key: key.to_string(),
                hash: String::new(),
            })
        }

        async fn download(&self, key: &str, dest_path: &Path) -> Result<(), TransferError> {
            self.calls.lock().unwrap().push(format!("download {key}"));
            if self.reject_downloads {
                return Err(TransferError::Io(std::io::Error::other("store unavailable")));
            }
            tokio::fs::write(dest_path, "remote").await?;
            Ok(())
        }

        async fn stat(&self, key: &str) -> Result<ObjectStat, TransferError> {
            self.calls.lock().unwrap().push(format!("stat {key}"));
            Ok(match self.remote_modified_at {
                Some(at) => ObjectStat::present(key, at),
                None => ObjectStat::missing(key),
            })
        }
    }

    async fn engine_with(
        dir: &TempDir,
        remote: Arc<ScriptedRemote>,
        titles: &[&str],
    ) -> (Arc<SyncEngine>, Vec<Note>) {
        let registry = Arc::new(Registry::open(dir.path().join("files.json")).await.unwrap());
        let mut notes = Vec::new();
        for title in titles {
            let note = Note::saved(*title, dir.path().join(format!("{title}.md")), 1);
            registry.insert(note.clone()).await.unwrap();
            notes.push(note);
        }
        (Arc::new(SyncEngine::new(remote, registry)), notes)
    }

    async fn next_event(events: &mut UnboundedReceiver<SyncEvent>) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event within timeout")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn disabled_coordinator_drops_requests_silently() {
        let (coordinator, mut events) = Coordinator::new(None);
        let note = Note::saved("Todo", "/notes/Todo.md", 1);
        let target = SyncTarget::for_note(&note).unwrap();

        coordinator.submit(SyncRequest::Upload {
            target: target.clone(),
        });
        coordinator.submit(SyncRequest::Download { target });
        coordinator.submit(SyncRequest::UploadAll);

        assert!(!coordinator.is_enabled());
        let waited = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn requests_for_one_note_run_in_submission_order() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(ScriptedRemote {
            upload_delay: Duration::from_millis(50),
            ..ScriptedRemote::default()
        });
        let (engine, notes) = engine_with(&dir, remote.clone(), &["Todo"]).await;
        let (coordinator, mut events) = Coordinator::new(Some(engine));
        let target = SyncTarget::for_note(&notes[0]).unwrap();

        coordinator.submit(SyncRequest::Upload {
            target: target.clone(),
        });
        coordinator.submit(SyncRequest::Download {
            target: target.clone(),
        });

        assert_eq!(
            next_event(&mut events).await,
            SyncEvent::UploadComplete {
                id: target.id.clone()
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            SyncEvent::DownloadComplete {
                id: target.id.clone(),
                status: DownloadStatus::NoRemoteFile,
            }
        );
        assert_eq!(remote.calls(), vec!["upload Todo.md", "stat Todo.md"]);
    }

    #[tokio::test]
    async fn upload_failure_is_reported_with_reason() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(ScriptedRemote {
            reject_uploads: true,
            ..ScriptedRemote::default()
        });
        let (engine, notes) = engine_with(&dir, remote, &["Todo"]).await;
        let registry = engine.registry().clone();
        let (coordinator, mut events) = Coordinator::new(Some(engine));

        coordinator.submit(SyncRequest::Upload {
            target: SyncTarget::for_note(&notes[0]).unwrap(),
        });

        match next_event(&mut events).await {
            SyncEvent::UploadFailed { id, reason } => {
                assert_eq!(id, notes[0].id);
                assert!(reason.contains("bad token"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!registry.get(&notes[0].id).await.unwrap().is_synced);
    }

    #[tokio::test]
    async fn download_failure_is_reported_and_note_stays_unsynced() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(ScriptedRemote {
            remote_modified_at: Some(9_000),
            reject_downloads: true,
            ..ScriptedRemote::default()
        });
        let (engine, notes) = engine_with(&dir, remote.clone(), &["Todo"]).await;
        let registry = engine.registry().clone();
        let (coordinator, mut events) = Coordinator::new(Some(engine));

        coordinator.submit(SyncRequest::Download {
            target: SyncTarget::for_note(&notes[0]).unwrap(),
        });

        match next_event(&mut events).await {
            SyncEvent::DownloadFailed { id, reason } => {
                assert_eq!(id, notes[0].id);
                assert!(reason.contains("store unavailable"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(remote.calls(), vec!["stat Todo.md", "download Todo.md"]);
        assert_eq!(registry.get(&notes[0].id).await.unwrap(), notes[0]);
    }

    #[tokio::test]
    async fn results_for_unregistered_notes_are_dropped() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(ScriptedRemote::default());
        let (engine, _) = engine_with(&dir, remote.clone(), &[]).await;
        let (coordinator, mut events) = Coordinator::new(Some(engine));
        let ghost = Note::saved("Ghost", dir.path().join("Ghost.md"), 1);
        let target = SyncTarget::for_note(&ghost).unwrap();

        coordinator.submit(SyncRequest::Download {
            target: target.clone(),
        });
        coordinator.submit(SyncRequest::Upload { target });

        let waited = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
        assert!(waited.is_err());
        assert_eq!(remote.calls(), vec!["upload Ghost.md"]);
    }

    #[tokio::test]
    async fn lane_is_released_after_its_queue_drains() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(ScriptedRemote::default());
        let (engine, notes) = engine_with(&dir, remote.clone(), &["Todo"]).await;
        let (coordinator, mut events) = Coordinator::new(Some(engine));
        let target = SyncTarget::for_note(&notes[0]).unwrap();

        for _ in 0..2 {
            coordinator.submit(SyncRequest::Upload {
                target: target.clone(),
            });
            assert_eq!(
                next_event(&mut events).await,
                SyncEvent::UploadComplete {
                    id: target.id.clone()
                }
            );
            tokio::time::timeout(Duration::from_secs(5), async {
                while coordinator.active_lanes() > 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("lane released");
        }
        assert_eq!(remote.calls().len(), 2);
    }

    #[tokio::test]
    async fn batch_clears_loading_even_when_every_upload_fails() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(ScriptedRemote {
            reject_uploads: true,
            ..ScriptedRemote::default()
        });
        let (engine, _) = engine_with(&dir, remote, &["A", "B"]).await;
        let (coordinator, mut events) = Coordinator::new(Some(engine));

        coordinator.submit(SyncRequest::UploadAll);

        assert_eq!(
            next_event(&mut events).await,
            SyncEvent::Loading { active: true }
        );
        match next_event(&mut events).await {
            SyncEvent::BatchUploadComplete { succeeded, failed } => {
                assert!(succeeded.is_empty());
                assert_eq!(failed.len(), 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            next_event(&mut events).await,
            SyncEvent::Loading { active: false }
        );
    }

    #[tokio::test]
    async fn batch_over_whole_registry_reports_every_note() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(ScriptedRemote::default());
        let (engine, notes) = engine_with(&dir, remote.clone(), &["A", "B", "C"]).await;
        let registry = engine.registry().clone();
        let (coordinator, mut events) = Coordinator::new(Some(engine));

        coordinator.submit(SyncRequest::UploadAll);

        assert_eq!(
            next_event(&mut events).await,
            SyncEvent::Loading { active: true }
        );
        match next_event(&mut events).await {
            SyncEvent::BatchUploadComplete { succeeded, failed } => {
                assert_eq!(succeeded.len(), notes.len());
                assert!(failed.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            next_event(&mut events).await,
            SyncEvent::Loading { active: false }
        );
        assert_eq!(remote.calls().len(), 3);
        for note in registry.list().await {
            assert!(note.is_synced);
        }
    }

    #[test]
    fn only_loading_start_is_non_terminal() {
        assert!(!SyncEvent::Loading { active: true }.is_terminal());
        assert!(SyncEvent::Loading { active: false }.is_terminal());
        assert!(
            SyncEvent::UploadComplete {
                id: NoteId::from("a")
            }
            .is_terminal()
        );
    }
}
