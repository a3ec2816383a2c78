//! Persistent user settings addressed by dotted keys (`workshop.projectsDir`).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use tokio::sync::Mutex;
use workshop_shared::errors::{WorkshopError, WorkshopResult};

/// Key/value settings storage.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> WorkshopResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> WorkshopResult<()>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> WorkshopResult<()>;
}

/// Settings persisted as a YAML document, created on first use.
pub struct FileSettings {
    path: PathBuf,
    document: Mutex<Option<Mapping>>,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            document: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> WorkshopResult<Mapping> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => match serde_yaml::from_str::<Option<Mapping>>(&text) {
                Ok(mapping) => {
                    tracing::debug!(file = %self.path.display(), "Loaded settings");
                    Ok(mapping.unwrap_or_default())
                }
                Err(e) => {
                    tracing::warn!(file = %self.path.display(), "Settings unreadable, starting fresh: {}", e);
                    let empty = Mapping::new();
                    self.write(&empty).await?;
                    Ok(empty)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let empty = Mapping::new();
                self.write(&empty).await?;
                Ok(empty)
            }
            Err(e) => Err(WorkshopError::Storage(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn write(&self, document: &Mapping) -> WorkshopResult<()> {
        let yaml = serde_yaml::to_string(document)
            .map_err(|e| WorkshopError::Storage(format!("failed to encode settings: {}", e)))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Replace atomically so a crash never leaves half a file.
        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, yaml).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(file = %self.path.display(), "Settings written");
        Ok(())
    }

    /// Run `f` against the loaded document, persisting it when `f` returns true.
    async fn with_document<T>(
        &self,
        f: impl FnOnce(&mut Mapping) -> (T, bool) + Send,
    ) -> WorkshopResult<T> {
        let mut guard = self.document.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        let Some(document) = guard.as_mut() else {
            return Err(WorkshopError::Internal("settings not loaded".into()));
        };
        let (value, changed) = f(document);
        if changed {
            self.write(document).await?;
        }
        Ok(value)
    }
}

#[async_trait]
impl SettingsStore for FileSettings {
    async fn get(&self, key: &str) -> WorkshopResult<Option<String>> {
        self.with_document(|document| (lookup(document, key).and_then(scalar_string), false))
            .await
    }

    async fn set(&self, key: &str, value: &str) -> WorkshopResult<()> {
        tracing::info!(key, value, "Setting changed");
        self.with_document(|document| {
            insert(document, key, Value::String(value.to_string()));
            ((), true)
        })
        .await
    }

    async fn delete(&self, key: &str) -> WorkshopResult<()> {
        tracing::info!(key, "Setting deleted");
        self.with_document(|document| {
            let removed = remove(document, key);
            ((), removed)
        })
        .await
    }
}

fn lookup<'a>(document: &'a Mapping, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut current = document.get(parts.next()?)?;
    for part in parts {
        current = current.as_mapping()?.get(part)?;
    }
    Some(current)
}

fn insert(document: &mut Mapping, key: &str, value: Value) {
    let parts: Vec<&str> = key.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };

    let mut current = document;
    for part in parents {
        let entry = current
            .entry(Value::String((*part).to_string()))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if !entry.is_mapping() {
            *entry = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(Value::String((*last).to_string()), value);
}

fn remove(document: &mut Mapping, key: &str) -> bool {
    let parts: Vec<&str> = key.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        return false;
    };

    let mut current = document;
    for part in parents {
        match current.get_mut(*part) {
            Some(Value::Mapping(next)) => current = next,
            _ => return false,
        }
    }
    current.remove(*last).is_some()
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
