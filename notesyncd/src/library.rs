use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notesync_core::now_millis;
use thiserror::Error;

use crate::coordinator::{Coordinator, SyncEvent, SyncRequest};
use crate::local_fs::{LocalFiles, LocalIoError};
use crate::settings::SyncSettings;
use crate::sync::engine::{DownloadStatus, SyncTarget};
use crate::sync::registry::{Note, NoteId, Registry, RegistryError};

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Local(#[from] LocalIoError),
    #[error("unknown note {0}")]
    UnknownNote(NoteId),
    #[error("note {0} is not open")]
    NotOpen(NoteId),
    #[error("note {0} must be saved under a title first")]
    Unsaved(NoteId),
    #[error("invalid title {0:?}")]
    InvalidTitle(String),
}

/// Body of a note held in memory while it is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenNote {
    pub body: String,
    pub is_loaded: bool,
    pub dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Ready(String),
    /// A download was requested; the body arrives with the matching event.
    Pending,
    /// The file is gone from disk. Call [`NoteLibrary::forget`] once the user agrees.
    Missing,
}

/// Foreground note operations on top of the registry, local files and the coordinator.
pub struct NoteLibrary {
    registry: Arc<Registry>,
    files: Arc<dyn LocalFiles>,
    coordinator: Arc<Coordinator>,
    settings: SyncSettings,
    drafts: HashMap<NoteId, Note>,
    open: HashMap<NoteId, OpenNote>,
    clock: fn() -> i64,
}

impl NoteLibrary {
    pub fn new(
        registry: Arc<Registry>,
        files: Arc<dyn LocalFiles>,
        coordinator: Arc<Coordinator>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            registry,
            files,
            coordinator,
            settings,
            drafts: HashMap::new(),
            open: HashMap::new(),
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

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Registered notes followed by unsaved drafts.
    pub async fn list(&self) -> Vec<Note> {
        let mut notes = self.registry.list().await;
        let mut drafts: Vec<Note> = self.drafts.values().cloned().collect();
        drafts.sort_by_key(|note| note.created_at);
        notes.extend(drafts);
        notes
    }

    pub fn body(&self, id: &NoteId) -> Option<&str> {
        self.open
            .get(id)
            .filter(|open| open.is_loaded)
            .map(|open| open.body.as_str())
    }

    pub fn open_note(&self, id: &NoteId) -> Option<&OpenNote> {
        self.open.get(id)
    }

    pub fn create(&mut self, title: &str, body: &str) -> Note {
        let note = Note::draft(title, (self.clock)());
        self.drafts.insert(note.id.clone(), note.clone());
        self.open.insert(
            note.id.clone(),
            OpenNote {
                body: body.to_string(),
                is_loaded: true,
                dirty: true,
            },
        );
        note
    }

    /// First save of a draft: writes `<save location>/<title>.md` and registers it.
    pub async fn commit_new(&mut self, id: &NoteId, title: &str) -> Result<Note, LibraryError> {
        let title = validate_title(title)?;
        let draft = self
            .drafts
            .get(id)
            .ok_or_else(|| LibraryError::UnknownNote(id.clone()))?;
        let path = self.settings.save_location.join(format!("{title}.md"));
        if self.registry.find_by_path(&path).await.is_some() {
            return Err(RegistryError::DuplicatePath(path).into());
        }

        let body = self
            .open
            .get(id)
            .map(|open| open.body.clone())
            .unwrap_or_default();
        let note = Note {
            title: title.to_string(),
            path: Some(path.clone()),
            is_new: false,
            ..draft.clone()
        };
        self.files.write(&path, &body).await?;
        self.registry.insert(note.clone()).await?;
        self.drafts.remove(id);
        if let Some(open) = self.open.get_mut(id) {
            open.dirty = false;
        }
        tracing::info!(id = %note.id, path = %path.display(), "note created");
        Ok(note)
    }

    pub fn edit(&mut self, id: &NoteId, body: &str) -> Result<(), LibraryError> {
        let open = self
            .open
            .get_mut(id)
            .ok_or_else(|| LibraryError::NotOpen(id.clone()))?;
        if open.body != body {
            open.body = body.to_string();
            open.dirty = true;
        }
        Ok(())
    }

    /// Writes the open body to disk and, with auto-sync on, queues an upload.
    pub async fn save(&mut self, id: &NoteId) -> Result<(), LibraryError> {
        if self.drafts.contains_key(id) {
            return Err(LibraryError::Unsaved(id.clone()));
        }
        let note = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| LibraryError::UnknownNote(id.clone()))?;
        let open = self
            .open
            .get_mut(id)
            .filter(|open| open.is_loaded)
            .ok_or_else(|| LibraryError::NotOpen(id.clone()))?;
        let path = note.path.as_deref().ok_or_else(|| LibraryError::Unsaved(id.clone()))?;
        self.files.write(path, &open.body).await?;
        open.dirty = false;

        if self.settings.auto_sync {
            if let Some(target) = SyncTarget::for_note(&note) {
                self.coordinator.submit(SyncRequest::Upload { target });
            }
        }
        Ok(())
    }

    /// Renames a note and its file to `<dir>/<title>.md`. Drafts only change title.
    pub async fn rename(&mut self, id: &NoteId, title: &str) -> Result<Note, LibraryError> {
        let title = validate_title(title)?;
        if let Some(draft) = self.drafts.get_mut(id) {
            draft.title = title.to_string();
            return Ok(draft.clone());
        }
        let note = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| LibraryError::UnknownNote(id.clone()))?;
        let from = note.path.clone().ok_or_else(|| LibraryError::Unsaved(id.clone()))?;
        let to = sibling_path(&from, title);
        if to == from {
            return Ok(note);
        }
        if self.registry.find_by_path(&to).await.is_some() {
            return Err(RegistryError::DuplicatePath(to).into());
        }

        self.files.rename(&from, &to).await?;
        let updated = self
            .registry
            .update(id, |note| {
                note.title = title.to_string();
                note.path = Some(to.clone());
            })
            .await?
            .ok_or_else(|| LibraryError::UnknownNote(id.clone()))?;
        tracing::info!(%id, from = %from.display(), to = %to.display(), "note renamed");
        Ok(updated)
    }

    /// Removes the note and its local file. The remote copy is left alone.
    pub async fn delete(&mut self, id: &NoteId) -> Result<(), LibraryError> {
        if self.drafts.remove(id).is_some() {
            self.open.remove(id);
            return Ok(());
        }
        let note = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| LibraryError::UnknownNote(id.clone()))?;
        if let Some(path) = note.path.as_deref() {
            match self.files.delete(path).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    tracing::debug!(%id, "note file already gone");
                }
                Err(err) => return Err(err.into()),
            }
        }
        self.registry.remove(id).await?;
        self.open.remove(id);
        tracing::info!(%id, "note deleted");
        Ok(())
    }

    /// Registers existing markdown files, skipping paths that are already known.
    pub async fn import(&mut self, paths: &[PathBuf]) -> Result<Vec<Note>, LibraryError> {
        let mut imported = Vec::new();
        for path in paths {
            if self.registry.find_by_path(path).await.is_some() {
                tracing::debug!(path = %path.display(), "already imported");
                continue;
            }
            let Some(title) = path.file_stem().and_then(|stem| stem.to_str()) else {
                tracing::warn!(path = %path.display(), "skipping path without a file name");
                continue;
            };
            let note = Note::saved(title, path.clone(), (self.clock)());
            self.registry.insert(note.clone()).await?;
            imported.push(note);
        }
        if !imported.is_empty() {
            tracing::info!(count = imported.len(), "notes imported");
        }
        Ok(imported)
    }

    /// Loads the body of a note.
    ///
    /// Synced notes with auto-sync on are refreshed from the store first and return
    /// [`OpenOutcome::Pending`]; pass the resulting event to [`NoteLibrary::apply_event`].
    pub async fn open(&mut self, id: &NoteId) -> Result<OpenOutcome, LibraryError> {
        if let Some(body) = self.body(id) {
            return Ok(OpenOutcome::Ready(body.to_string()));
        }
        let note = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| LibraryError::UnknownNote(id.clone()))?;

        if self.settings.auto_sync && note.is_synced {
            if let Some(target) = SyncTarget::for_note(&note) {
                self.open.insert(
                    id.clone(),
                    OpenNote {
                        body: String::new(),
                        is_loaded: false,
                        dirty: false,
                    },
                );
                self.coordinator.submit(SyncRequest::Download { target });
                return Ok(OpenOutcome::Pending);
            }
        }
        self.load(&note).await
    }

    /// Refreshes open bodies after a download finished or failed.
    ///
    /// A pending note is always loaded. A note that is already loaded is only reloaded
    /// after a successful download, and never while it has unsaved edits. Returns `None`
    /// when the open body is left as it is.
    pub async fn apply_event(
        &mut self,
        event: &SyncEvent,
    ) -> Result<Option<OpenOutcome>, LibraryError> {
        let (id, replaced) = match event {
            SyncEvent::DownloadComplete { id, status } => {
                (id, *status == DownloadStatus::DownloadSuccess)
            }
            SyncEvent::DownloadFailed { id, reason } => {
                tracing::warn!(%id, "download failed, using local copy: {reason}");
                (id, false)
            }
            _ => return Ok(None),
        };
        let Some(open) = self.open.get(id) else {
            return Ok(None);
        };
        let reload = !open.is_loaded || (replaced && !open.dirty);
        if !reload {
            if replaced {
                tracing::info!(%id, "remote copy downloaded, keeping unsaved edits");
            }
            return Ok(None);
        }
        let Some(note) = self.registry.get(id).await else {
            self.open.remove(id);
            return Ok(None);
        };
        self.load(&note).await.map(Some)
    }

    /// Drops a note whose file disappeared.
    pub async fn forget(&mut self, id: &NoteId) -> Result<(), LibraryError> {
        self.open.remove(id);
        self.registry.remove(id).await?;
        Ok(())
    }

    /// Case-sensitive title match over registered notes and drafts.
    pub async fn search(&self, keyword: &str) -> Vec<Note> {
        self.list()
            .await
            .into_iter()
            .filter(|note| note.title.contains(keyword))
            .collect()
    }

    /// Evicts the body of a registered note. Draft bodies stay until commit or delete.
    pub fn close(&mut self, id: &NoteId) {
        if !self.drafts.contains_key(id) {
            self.open.remove(id);
        }
    }

    async fn load(&mut self, note: &Note) -> Result<OpenOutcome, LibraryError> {
        let path = note
            .path
            .as_deref()
            .ok_or_else(|| LibraryError::Unsaved(note.id.clone()))?;
        match self.files.read(path).await {
            Ok(body) => {
                self.open.insert(
                    note.id.clone(),
                    OpenNote {
                        body: body.clone(),
                        is_loaded: true,
                        dirty: false,
                    },
                );
                Ok(OpenOutcome::Ready(body))
            }
            Err(err) if err.is_not_found() => {
                self.open.remove(&note.id);
                tracing::warn!(id = %note.id, path = %path.display(), "note file is missing");
                Ok(OpenOutcome::Missing)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn validate_title(title: &str) -> Result<&str, LibraryError> {
    let trimmed = title.trim();
    if trimmed.is_empty() || trimmed.contains(['/', '\\']) {
        return Err(LibraryError::InvalidTitle(title.to_string()));
    }
    Ok(trimmed)
}

fn sibling_path(path: &Path, title: &str) -> PathBuf {
    let file_name = format!("{title}.md");
    match path.parent() {
        Some(parent) => parent.join(file_name),
        None => PathBuf::from(file_name),
    }
}

#[cfg(test)]
#[path = "library_tests.rs"]
mod tests;
