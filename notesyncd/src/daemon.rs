use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use notesync_core::{Endpoints, StoreClient, TransferConfig};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::coordinator::{Coordinator, SyncEvent, SyncRequest};
use crate::library::{NoteLibrary, OpenOutcome};
use crate::local_fs::FsLocalFiles;
use crate::settings::{self, SettingsStore, SyncSettings};
use crate::sync::engine::{SyncEngine, SyncTarget};
use crate::sync::registry::{Note, Registry};

const APP_DIR_NAME: &str = "notesync";
const REGISTRY_FILE_NAME: &str = "files.json";
const SETTINGS_FILE_NAME: &str = "settings.json";
const DEFAULT_EVENT_TIMEOUT_SECS: u64 = 300;
const NOT_CONFIGURED: &str = "sync is not configured";

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub registry_file: PathBuf,
    pub settings_file: PathBuf,
    pub default_save_location: PathBuf,
    /// Single host for upload, management and API calls instead of the public store.
    pub endpoint: Option<String>,
    pub event_timeout: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let data_dir = std::env::var("NOTESYNC_DATA_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| default_data_dir(&home));
        let default_save_location = std::env::var("NOTESYNC_DEFAULT_LOCATION")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .or_else(dirs::document_dir)
            .unwrap_or(home);
        let endpoint = std::env::var("NOTESYNC_ENDPOINT")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let event_timeout = Duration::from_secs(read_u64_env(
            "NOTESYNC_EVENT_TIMEOUT_SECS",
            DEFAULT_EVENT_TIMEOUT_SECS,
        ));

        Ok(Self::in_dir(data_dir, default_save_location)
            .with_endpoint(endpoint)
            .with_event_timeout(event_timeout))
    }

    pub fn in_dir(data_dir: PathBuf, default_save_location: PathBuf) -> Self {
        Self {
            registry_file: data_dir.join(REGISTRY_FILE_NAME),
            settings_file: data_dir.join(SETTINGS_FILE_NAME),
            data_dir,
            default_save_location,
            endpoint: None,
            event_timeout: Duration::from_secs(DEFAULT_EVENT_TIMEOUT_SECS),
        }
    }

    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    settings: SettingsStore,
    coordinator: Arc<Coordinator>,
    library: NoteLibrary,
    events: UnboundedReceiver<SyncEvent>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("failed to create data dir at {:?}", config.data_dir))?;

        let store = SettingsStore::open(&config.settings_file)
            .await
            .with_context(|| format!("failed to read settings from {:?}", config.settings_file))?;
        let sync_settings = SyncSettings::from_store(&store, &config.default_save_location);
        let registry = Arc::new(
            Registry::open(&config.registry_file)
                .await
                .with_context(|| format!("failed to load registry {:?}", config.registry_file))?,
        );
        let engine = build_engine(&config, &sync_settings, registry.clone())?;
        let (coordinator, events) = Coordinator::new(engine);
        let coordinator = Arc::new(coordinator);
        let library = NoteLibrary::new(
            registry,
            Arc::new(FsLocalFiles),
            coordinator.clone(),
            sync_settings,
        );

        tracing::info!(
            data_dir = %config.data_dir.display(),
            sync = coordinator.is_enabled(),
            auto_sync = library.settings().auto_sync,
            "notesync started"
        );
        Ok(Self {
            config,
            settings: store,
            coordinator,
            library,
            events,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn library(&mut self) -> &mut NoteLibrary {
        &mut self.library
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.coordinator.is_enabled()
    }

    pub async fn list(&self) -> String {
        let mut out = String::new();
        for note in self.library.list().await {
            let state = match (note.is_new, note.is_synced) {
                (true, _) => "draft",
                (false, true) => "synced",
                (false, false) => "local",
            };
            let path = note
                .path
                .as_deref()
                .map(|path| path.display().to_string())
                .unwrap_or_default();
            let _ = writeln!(out, "{}\t{}\t{}\t{}", note.id, note.title, state, path);
        }
        out
    }

    pub async fn status(&self) -> String {
        let notes = self.library.list().await;
        let synced = notes.iter().filter(|note| note.is_synced).count();
        let settings = self.library.settings();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "sync: {}",
            if settings.is_configured() {
                "configured"
            } else {
                "not configured"
            }
        );
        let _ = writeln!(out, "auto-sync: {}", settings.auto_sync);
        let _ = writeln!(out, "save location: {}", settings.save_location.display());
        let _ = writeln!(out, "notes: {} ({} synced)", notes.len(), synced);
        let _ = writeln!(out, "registry: {}", self.config.registry_file.display());
        out
    }

    pub async fn import(&mut self, paths: &[PathBuf]) -> anyhow::Result<String> {
        let imported = self.library.import(paths).await?;
        Ok(format!("imported {} of {} files", imported.len(), paths.len()))
    }

    pub async fn create(&mut self, title: &str, body: &str) -> anyhow::Result<String> {
        let draft = self.library.create(title, body);
        let note = self.library.commit_new(&draft.id, title).await?;
        self.library.save(&note.id).await?;
        if self.library.settings().auto_sync {
            let event = self.next_terminal_event().await?;
            return Ok(format!("created {}\n{}", note.id, describe_event(&event)));
        }
        Ok(format!("created {}", note.id))
    }

    pub async fn push(&mut self, selector: &str) -> anyhow::Result<String> {
        if !self.is_sync_enabled() {
            return Ok(NOT_CONFIGURED.to_string());
        }
        let target = self.target_for(selector).await?;
        self.coordinator.submit(SyncRequest::Upload { target });
        Ok(describe_event(&self.next_terminal_event().await?))
    }

    pub async fn pull(&mut self, selector: &str) -> anyhow::Result<String> {
        if !self.is_sync_enabled() {
            return Ok(NOT_CONFIGURED.to_string());
        }
        let target = self.target_for(selector).await?;
        self.coordinator.submit(SyncRequest::Download { target });
        Ok(describe_event(&self.next_terminal_event().await?))
    }

    pub async fn push_all(&mut self) -> anyhow::Result<String> {
        if !self.is_sync_enabled() {
            return Ok(NOT_CONFIGURED.to_string());
        }
        self.coordinator.submit(SyncRequest::UploadAll);
        Ok(describe_event(&self.next_terminal_event().await?))
    }

    /// Prints the body of a note, refreshing it from the store first when auto-sync is on.
    pub async fn show(&mut self, selector: &str) -> anyhow::Result<String> {
        let note = self.find_note(selector).await?;
        let mut outcome = self.library.open(&note.id).await?;
        while outcome == OpenOutcome::Pending {
            let event = self.next_terminal_event().await?;
            if let Some(applied) = self.library.apply_event(&event).await? {
                outcome = applied;
            }
        }
        match outcome {
            OpenOutcome::Ready(body) => Ok(body),
            OpenOutcome::Missing => Ok(format!(
                "file for {} is missing; run `notesyncd forget {}` to drop it",
                note.title, note.id
            )),
            OpenOutcome::Pending => Ok(String::new()),
        }
    }

    pub async fn forget(&mut self, selector: &str) -> anyhow::Result<String> {
        let note = self.find_note(selector).await?;
        self.library.forget(&note.id).await?;
        Ok(format!("forgot {}", note.title))
    }

    pub async fn set(&mut self, key: &str, raw: &str) -> anyhow::Result<String> {
        let value = settings::parse_value(key, raw)?;
        self.settings
            .set(key, value)
            .await
            .with_context(|| format!("failed to save setting {key}"))?;
        Ok(format!("saved {key}"))
    }

    async fn find_note(&self, selector: &str) -> anyhow::Result<Note> {
        let notes = self.library.list().await;
        notes
            .iter()
            .find(|note| note.id.as_str() == selector)
            .or_else(|| notes.iter().find(|note| note.title == selector))
            .cloned()
            .with_context(|| format!("no note matches {selector:?}"))
    }

    async fn target_for(&self, selector: &str) -> anyhow::Result<SyncTarget> {
        let note = self.find_note(selector).await?;
        SyncTarget::for_note(&note)
            .with_context(|| format!("{} has not been saved yet", note.title))
    }

    async fn next_terminal_event(&mut self) -> anyhow::Result<SyncEvent> {
        let timeout = self.config.event_timeout;
        loop {
            let event = tokio::time::timeout(timeout, self.events.recv())
                .await
                .context("timed out waiting for sync to finish")?
                .context("sync coordinator stopped")?;
            tracing::debug!(?event, "sync event");
            if event.is_terminal() {
                return Ok(event);
            }
        }
    }
}

/// Returns `None` when credentials are incomplete; requests are then dropped.
fn build_engine(
    config: &DaemonConfig,
    settings: &SyncSettings,
    registry: Arc<Registry>,
) -> anyhow::Result<Option<Arc<SyncEngine>>> {
    let Some(credentials) = settings.credentials.clone() else {
        tracing::info!("{NOT_CONFIGURED}, remote requests will be ignored");
        return Ok(None);
    };
    let endpoints = match config.endpoint.as_deref() {
        Some(endpoint) => Endpoints::single(endpoint)
            .with_context(|| format!("invalid NOTESYNC_ENDPOINT {endpoint:?}"))?,
        None => Endpoints::qiniu()?,
    };
    let client = StoreClient::with_config(credentials, endpoints, TransferConfig::default())
        .context("failed to build store client")?;
    Ok(Some(Arc::new(SyncEngine::new(Arc::new(client), registry))))
}

fn describe_event(event: &SyncEvent) -> String {
    match event {
        SyncEvent::UploadComplete { id } => format!("uploaded {id}"),
        SyncEvent::UploadFailed { id, reason } => format!("upload of {id} failed: {reason}"),
        SyncEvent::DownloadComplete { id, status } => format!("{id}: {}", status.as_str()),
        SyncEvent::DownloadFailed { id, reason } => format!("download of {id} failed: {reason}"),
        SyncEvent::BatchUploadComplete { succeeded, failed } => {
            let mut out = format!("uploaded {} notes, {} failed", succeeded.len(), failed.len());
            for failure in failed {
                let _ = write!(out, "\n  {}: {}", failure.id, failure.reason);
            }
            out
        }
        SyncEvent::Loading { active } => {
            if *active {
                "syncing".to_string()
            } else {
                "idle".to_string()
            }
        }
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_data_dir(home: &Path) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| home.join(".local/share"))
        .join(APP_DIR_NAME)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
