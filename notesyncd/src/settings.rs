use std::path::{Path, PathBuf};

use notesync_core::Credentials;
use serde_json::{Map, Value};
use thiserror::Error;

pub const ACCESS_KEY: &str = "accessKey";
pub const SECRET_KEY: &str = "secretKey";
pub const BUCKET_NAME: &str = "bucketName";
pub const ENABLE_AUTO_SYNC: &str = "enableAutoSync";
pub const SAVED_LOCATION: &str = "savedLocation";

pub const KNOWN_KEYS: [&str; 5] = [
    ACCESS_KEY,
    SECRET_KEY,
    BUCKET_NAME,
    ENABLE_AUTO_SYNC,
    SAVED_LOCATION,
];

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("settings file must hold a JSON object")]
    NotAnObject,
    #[error("unknown setting: {0}")]
    UnknownKey(String),
    #[error("{key} expects true or false, got {value:?}")]
    InvalidBool { key: String, value: String },
}

/// Flat JSON key-value file holding user settings.
#[derive(Debug)]
pub struct SettingsStore {
    file: PathBuf,
    values: Map<String, Value>,
}

impl SettingsStore {
    pub async fn open(file: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let file = file.into();
        let values = match tokio::fs::read(&file).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Map::new(),
            Ok(bytes) => match serde_json::from_slice(&bytes)? {
                Value::Object(values) => values,
                _ => return Err(SettingsError::NotAnObject),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { file, values })
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|value| !value.is_null())
    }

    /// String value of `key`. Blank strings count as unset.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(text)) => text == "true",
            _ => false,
        }
    }

    pub async fn set(&mut self, key: &str, value: Value) -> Result<(), SettingsError> {
        let mut next = self.values.clone();
        next.insert(key.to_string(), value);
        if let Some(parent) = self.file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.file.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&next)?).await?;
        tokio::fs::rename(&tmp, &self.file).await?;
        self.values = next;
        tracing::debug!(key, "setting saved");
        Ok(())
    }
}

/// Turns command-line text into the stored JSON value for a known key.
///
/// An empty string clears the setting.
pub fn parse_value(key: &str, raw: &str) -> Result<Value, SettingsError> {
    if !KNOWN_KEYS.contains(&key) {
        return Err(SettingsError::UnknownKey(key.to_string()));
    }
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    if key == ENABLE_AUTO_SYNC {
        return match raw {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(SettingsError::InvalidBool {
                key: key.to_string(),
                value: raw.to_string(),
            }),
        };
    }
    Ok(Value::String(raw.to_string()))
}

/// Snapshot of the settings the sync core reads.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// `None` unless access key, secret key and bucket are all present.
    pub credentials: Option<Credentials>,
    pub auto_sync: bool,
    pub save_location: PathBuf,
}

impl SyncSettings {
    pub fn from_store(store: &SettingsStore, default_location: &Path) -> Self {
        let credentials = match (
            store.get_str(ACCESS_KEY),
            store.get_str(SECRET_KEY),
            store.get_str(BUCKET_NAME),
        ) {
            (Some(access), Some(secret), Some(bucket)) => {
                Some(Credentials::new(access, secret, bucket))
            }
            _ => None,
        };
        let auto_sync = credentials.is_some() && store.get_bool(ENABLE_AUTO_SYNC);
        let save_location = store
            .get_str(SAVED_LOCATION)
            .map(PathBuf::from)
            .unwrap_or_else(|| default_location.to_path_buf());
        Self {
            credentials,
            auto_sync,
            save_location,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn store_with(dir: &Path, pairs: &[(&str, Value)]) -> SettingsStore {
        let mut store = SettingsStore::open(dir.join("settings.json")).await.unwrap();
        for (key, value) in pairs {
            store.set(key, value.clone()).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempdir().unwrap();
        store_with(dir.path(), &[(ACCESS_KEY, json!("ak"))]).await;

        let reopened = SettingsStore::open(dir.path().join("settings.json"))
            .await
            .unwrap();
        assert_eq!(reopened.get_str(ACCESS_KEY), Some("ak"));
    }

    #[tokio::test]
    async fn rejects_non_object_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("settings.json");
        std::fs::write(&file, "[1, 2]").unwrap();

        let err = SettingsStore::open(file).await.unwrap_err();
        assert!(matches!(err, SettingsError::NotAnObject));
    }

    #[tokio::test]
    async fn credentials_require_all_three_keys() {
        let dir = tempdir().unwrap();
        let store = store_with(
            dir.path(),
            &[
                (ACCESS_KEY, json!("ak")),
                (SECRET_KEY, json!("  ")),
                (BUCKET_NAME, json!("notes")),
                (ENABLE_AUTO_SYNC, json!(true)),
            ],
        )
        .await;

        let settings = SyncSettings::from_store(&store, Path::new("/docs"));
        assert!(settings.credentials.is_none());
        assert!(!settings.auto_sync);
        assert!(!settings.is_configured());
    }

    #[tokio::test]
    async fn complete_settings_enable_auto_sync() {
        let dir = tempdir().unwrap();
        let store = store_with(
            dir.path(),
            &[
                (ACCESS_KEY, json!("ak")),
                (SECRET_KEY, json!("sk")),
                (BUCKET_NAME, json!("notes")),
                (ENABLE_AUTO_SYNC, json!("true")),
                (SAVED_LOCATION, json!("/srv/notes")),
            ],
        )
        .await;

        let settings = SyncSettings::from_store(&store, Path::new("/docs"));
        let credentials = settings.credentials.unwrap();
        assert_eq!(credentials.bucket, "notes");
        assert!(settings.auto_sync);
        assert_eq!(settings.save_location, PathBuf::from("/srv/notes"));
    }

    #[tokio::test]
    async fn save_location_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[(SAVED_LOCATION, Value::Null)]).await;

        let settings = SyncSettings::from_store(&store, Path::new("/docs"));
        assert_eq!(settings.save_location, PathBuf::from("/docs"));
    }

    #[test]
    fn parse_value_checks_keys_and_flags() {
        assert_eq!(parse_value(BUCKET_NAME, "notes").unwrap(), json!("notes"));
        assert_eq!(parse_value(ENABLE_AUTO_SYNC, "true").unwrap(), json!(true));
        assert_eq!(parse_value(SECRET_KEY, "").unwrap(), Value::Null);
        assert!(matches!(
            parse_value("theme", "dark"),
            Err(SettingsError::UnknownKey(_))
        ));
        assert!(matches!(
            parse_value(ENABLE_AUTO_SYNC, "yes"),
            Err(SettingsError::InvalidBool { .. })
        ));
    }
}
