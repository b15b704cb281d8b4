//! Worker configuration registry.
//!
//! Configurations live on disk as `<folder>/<id>.yaml` or
//! `<folder>/<id>.json`. Lookups are cached together with the file's
//! modification time; a maintenance task re-stats every cached file and
//! evicts entries whose file changed or disappeared, pushing the worker
//! ID onto the reconfigure queue. That queue is the single signal
//! upstream that a worker must be reconfigured.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, LocalWorkerConfig};

/// Interval between maintenance scans of the cached files.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Capacity of the reconfigure queue.
pub const RECONFIGURE_QUEUE_CAPACITY: usize = 64;

/// Abstracts a local worker configuration registry.
pub trait ConfigRegistry: Send + Sync {
    /// Returns the configuration for the worker with the given ID.
    fn get(&self, id: &str) -> Result<LocalWorkerConfig, ApiError>;
}

struct RegistryEntry {
    config: LocalWorkerConfig,
    mod_time: SystemTime,
}

/// Registry implementation backed by a folder of yaml/json files.
pub struct FileRegistry {
    folder: PathBuf,
    configs: Mutex<HashMap<String, RegistryEntry>>,
    reconfigure_tx: mpsc::Sender<String>,
}

impl FileRegistry {
    /// Creates a registry over `folder`. Changed-config IDs are pushed
    /// onto `reconfigure_tx`; create it with
    /// [`RECONFIGURE_QUEUE_CAPACITY`].
    pub fn new(folder: impl Into<PathBuf>, reconfigure_tx: mpsc::Sender<String>) -> Self {
        Self {
            folder: folder.into(),
            configs: Mutex::new(HashMap::new()),
            reconfigure_tx,
        }
    }

    /// Keeps maintaining the registry until the token is cancelled.
    pub async fn run_maintenance(&self, token: CancellationToken) {
        loop {
            let changed = self.remove_changed_configs();
            for id in changed {
                tracing::info!(id = %id, "worker configuration changed on disk");
                if let Err(err) = self.reconfigure_tx.send(id).await {
                    tracing::debug!(error = %err, "reconfigure queue closed");
                    return;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(SCAN_INTERVAL) => {}
                _ = token.cancelled() => return,
            }
        }
    }

    /// Re-stats every cached config and evicts those whose file has a
    /// different modification time or is gone. Returns the evicted IDs.
    fn remove_changed_configs(&self) -> Vec<String> {
        let mut configs = self.configs.lock().expect("registry poisoned");
        let mut evicted = Vec::new();
        configs.retain(|id, entry| {
            match read_worker_configuration(&self.folder, id) {
                Ok((_, mod_time)) if mod_time == entry.mod_time => true,
                _ => {
                    evicted.push(id.clone());
                    false
                }
            }
        });
        evicted
    }
}

impl ConfigRegistry for FileRegistry {
    fn get(&self, id: &str) -> Result<LocalWorkerConfig, ApiError> {
        let mut configs = self.configs.lock().expect("registry poisoned");

        if let Some(entry) = configs.get(id) {
            return Ok(entry.config.clone());
        }

        let (config, mod_time) = read_worker_configuration(&self.folder, id)?;
        tracing::debug!(id, "worker configuration read from disk");
        configs.insert(
            id.to_string(),
            RegistryEntry {
                config: config.clone(),
                mod_time,
            },
        );
        Ok(config)
    }
}

/// Reads `<folder>/<id>.yaml`, falling back to `<folder>/<id>.json`.
fn read_worker_configuration(
    folder: &Path,
    id: &str,
) -> Result<(LocalWorkerConfig, SystemTime), ApiError> {
    let yaml_path = folder.join(format!("{}.yaml", id));
    if let Ok(meta) = std::fs::metadata(&yaml_path) {
        let content = std::fs::read(&yaml_path)?;
        let config: LocalWorkerConfig = serde_yaml::from_slice(&content)
            .map_err(|e| ApiError::Decode(format!("{}: {}", yaml_path.display(), e)))?;
        return Ok((config, meta.modified()?));
    }

    let json_path = folder.join(format!("{}.json", id));
    if let Ok(meta) = std::fs::metadata(&json_path) {
        let content = std::fs::read(&json_path)?;
        let config: LocalWorkerConfig = serde_json::from_slice(&content)
            .map_err(|e| ApiError::Decode(format!("{}: {}", json_path.display(), e)))?;
        return Ok((config, meta.modified()?));
    }

    Err(ApiError::NotFound(format!(
        "no configuration file for worker [{}] in {}",
        id,
        folder.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> (FileRegistry, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(RECONFIGURE_QUEUE_CAPACITY);
        (FileRegistry::new(dir.path(), tx), rx)
    }

    #[test]
    fn test_get_yaml_config() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("w1.yaml"), "alias: east\n").unwrap();
        let (registry, _rx) = registry(&dir);

        let config = registry.get("w1").unwrap();
        assert_eq!(config.alias, "east");
    }

    #[test]
    fn test_json_fallback() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("w1.json"), r#"{"alias":"west"}"#).unwrap();
        let (registry, _rx) = registry(&dir);

        let config = registry.get("w1").unwrap();
        assert_eq!(config.alias, "west");
    }

    #[test]
    fn test_yaml_wins_over_json() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("w1.yaml"), "alias: yaml\n").unwrap();
        fs::write(dir.path().join("w1.json"), r#"{"alias":"json"}"#).unwrap();
        let (registry, _rx) = registry(&dir);

        assert_eq!(registry.get("w1").unwrap().alias, "yaml");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (registry, _rx) = registry(&dir);

        assert!(matches!(
            registry.get("ghost").unwrap_err(),
            ApiError::NotFound(_)
        ));
    }

    #[test]
    fn test_parse_error_is_surfaced() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("w1.json"), "{not json").unwrap();
        let (registry, _rx) = registry(&dir);

        assert!(matches!(
            registry.get("w1").unwrap_err(),
            ApiError::Decode(_)
        ));
    }

    #[test]
    fn test_lookup_is_cached() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("w1.yaml"), "alias: one\n").unwrap();
        let (registry, _rx) = registry(&dir);

        assert_eq!(registry.get("w1").unwrap().alias, "one");

        // Without a maintenance pass, the cache keeps serving the old
        // content even after the file changed.
        fs::write(dir.path().join("w1.yaml"), "alias: two\n").unwrap();
        assert_eq!(registry.get("w1").unwrap().alias, "one");
    }

    #[test]
    fn test_changed_mtime_evicts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w1.yaml");
        fs::write(&path, "alias: one\n").unwrap();
        let (registry, _rx) = registry(&dir);
        registry.get("w1").unwrap();

        // Push the mtime forward explicitly; writes within the same
        // clock tick would be invisible otherwise.
        let new_time = SystemTime::now() + Duration::from_secs(10);
        fs::write(&path, "alias: two\n").unwrap();
        let file = fs::File::open(&path).unwrap();
        file.set_modified(new_time).unwrap();

        let evicted = registry.remove_changed_configs();
        assert_eq!(evicted, vec!["w1".to_string()]);

        // The next lookup re-reads from disk.
        assert_eq!(registry.get("w1").unwrap().alias, "two");
    }

    #[test]
    fn test_deleted_file_evicts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w1.yaml");
        fs::write(&path, "alias: one\n").unwrap();
        let (registry, _rx) = registry(&dir);
        registry.get("w1").unwrap();

        fs::remove_file(&path).unwrap();
        let evicted = registry.remove_changed_configs();
        assert_eq!(evicted, vec!["w1".to_string()]);
    }

    #[test]
    fn test_unchanged_file_stays_cached() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("w1.yaml"), "alias: one\n").unwrap();
        let (registry, _rx) = registry(&dir);
        registry.get("w1").unwrap();

        assert!(registry.remove_changed_configs().is_empty());
    }
}
