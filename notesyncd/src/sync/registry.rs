use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("a note with id {0} already exists")]
    DuplicateId(NoteId),
    #[error("another note already uses path {}", .0.display())]
    DuplicatePath(PathBuf),
    #[error("note {0} has not been saved yet")]
    Unsaved(NoteId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NoteId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NoteId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry entry. The body is never stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: NoteId,
    pub title: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub created_at: i64,
    /// Epoch millis of the last successful sync; `None` until the first one.
    #[serde(default)]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub is_synced: bool,
    #[serde(default)]
    pub is_new: bool,
}

impl Note {
    /// A note that exists only in memory until its first save.
    pub fn draft(title: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: NoteId::generate(),
            title: title.into(),
            path: None,
            created_at,
            updated_at: None,
            is_synced: false,
            is_new: true,
        }
    }

    pub fn saved(title: impl Into<String>, path: impl Into<PathBuf>, created_at: i64) -> Self {
        Self {
            id: NoteId::generate(),
            title: title.into(),
            path: Some(path.into()),
            created_at,
            updated_at: None,
            is_synced: false,
            is_new: false,
        }
    }

    /// Object key used for this note in the remote store.
    pub fn remote_key(&self) -> String {
        format!("{}.md", self.title)
    }
}

/// Persisted map of note id to metadata.
///
/// Every mutation clones the map, applies the change, writes the whole map to disk and
/// only then swaps it in, all while holding the lock. A failed write leaves memory and
/// disk unchanged.
pub struct Registry {
    file: PathBuf,
    notes: Mutex<BTreeMap<NoteId, Note>>,
}

impl Registry {
    pub async fn open(file: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let file = file.into();
        let notes = match tokio::fs::read(&file).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        tracing::debug!(file = %file.display(), notes = notes.len(), "registry loaded");
        Ok(Self {
            file,
            notes: Mutex::new(notes),
        })
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub async fn get(&self, id: &NoteId) -> Option<Note> {
        self.notes.lock().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &NoteId) -> bool {
        self.notes.lock().await.contains_key(id)
    }

    pub async fn list(&self) -> Vec<Note> {
        self.notes.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.notes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.notes.lock().await.is_empty()
    }

    pub async fn find_by_path(&self, path: &Path) -> Option<Note> {
        self.notes
            .lock()
            .await
            .values()
            .find(|note| note.path.as_deref() == Some(path))
            .cloned()
    }

    pub async fn insert(&self, note: Note) -> Result<(), RegistryError> {
        if note.is_new || note.path.is_none() {
            return Err(RegistryError::Unsaved(note.id));
        }
        let mut guard = self.notes.lock().await;
        if guard.contains_key(&note.id) {
            return Err(RegistryError::DuplicateId(note.id));
        }
        ensure_unique_path(&guard, &note)?;
        let mut next = guard.clone();
        next.insert(note.id.clone(), note);
        self.persist(&next).await?;
        *guard = next;
        Ok(())
    }

    /// Applies `apply` to the note with `id`.
    ///
    /// Returns `Ok(None)` without touching anything when the note is gone, so late
    /// results for deleted notes are dropped instead of resurrecting them.
    pub async fn update<F>(&self, id: &NoteId, apply: F) -> Result<Option<Note>, RegistryError>
    where
        F: FnOnce(&mut Note),
    {
        let mut guard = self.notes.lock().await;
        let Some(current) = guard.get(id) else {
            return Ok(None);
        };
        let mut note = current.clone();
        apply(&mut note);
        note.id = id.clone();
        ensure_unique_path(&guard, &note)?;
        let mut next = guard.clone();
        next.insert(id.clone(), note.clone());
        self.persist(&next).await?;
        *guard = next;
        Ok(Some(note))
    }

    /// Renames `staged` onto `dest` and applies `apply`, both under the registry lock.
    ///
    /// Returns `Ok(None)` and leaves `staged` alone when the note is gone, so a deleted
    /// note never gets its file back.
    pub async fn commit_file<F>(
        &self,
        id: &NoteId,
        staged: &Path,
        dest: &Path,
        apply: F,
    ) -> Result<Option<Note>, RegistryError>
    where
        F: FnOnce(&mut Note),
    {
        let mut guard = self.notes.lock().await;
        let Some(current) = guard.get(id) else {
            return Ok(None);
        };
        let mut note = current.clone();
        apply(&mut note);
        note.id = id.clone();
        ensure_unique_path(&guard, &note)?;
        tokio::fs::rename(staged, dest).await?;
        let mut next = guard.clone();
        next.insert(id.clone(), note.clone());
        self.persist(&next).await?;
        *guard = next;
        Ok(Some(note))
    }

    /// Marks every still-registered note in `ids` as synced at `at` with a single write.
    pub async fn mark_synced(&self, ids: &[NoteId], at: i64) -> Result<usize, RegistryError> {
        let mut guard = self.notes.lock().await;
        let mut next = guard.clone();
        let mut marked = 0;
        for id in ids {
            if let Some(note) = next.get_mut(id) {
                note.is_synced = true;
                note.updated_at = Some(at);
                marked += 1;
            }
        }
        if marked == 0 {
            return Ok(0);
        }
        self.persist(&next).await?;
        *guard = next;
        Ok(marked)
    }

    pub async fn remove(&self, id: &NoteId) -> Result<Option<Note>, RegistryError> {
        let mut guard = self.notes.lock().await;
        if !guard.contains_key(id) {
            return Ok(None);
        }
        let mut next = guard.clone();
        let removed = next.remove(id);
        self.persist(&next).await?;
        *guard = next;
        Ok(removed)
    }

    async fn persist(&self, notes: &BTreeMap<NoteId, Note>) -> Result<(), RegistryError> {
        if let Some(parent) = self.file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(notes)?;
        let tmp = self.file.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.file).await?;
        Ok(())
    }
}

fn ensure_unique_path(notes: &BTreeMap<NoteId, Note>, note: &Note) -> Result<(), RegistryError> {
    let Some(path) = note.path.as_deref() else {
        return Ok(());
    };
    let taken = notes
        .values()
        .any(|other| other.id != note.id && other.path.as_deref() == Some(path));
    if taken {
        return Err(RegistryError::DuplicatePath(path.to_path_buf()));
    }
    Ok(())
}
