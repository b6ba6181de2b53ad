// SPDX-License-Identifier: GPL-3.0-only

//! Durable per-device records
//!
//! Layout under the state directory:
//!
//! ```text
//! devices/video<N>/boot.json      PersistedBootConfig
//! devices/video<N>/pipeline.json  PipelineConfig
//! devices/video<N>/lock           per-device command lock
//! devices/video<N>/attach.lock    held while a pipeline is attached
//! devices/video<N>/daemon.lock    held by the supervising daemon
//! devices/video<N>/control.sock   daemon control socket
//! ```

use crate::config::{PersistedBootConfig, PipelineConfig};
use crate::errors::ConfigError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read a JSON record, `Ok(None)` when the file does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                message: e.to_string(),
            });
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Write a JSON record via a temporary file and rename
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let io_err = |e: std::io::Error| ConfigError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut json = serde_json::to_vec_pretty(value).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    json.push(b'\n');

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    std::fs::rename(&tmp, path).map_err(io_err)?;

    debug!(path = %path.display(), "Wrote record");
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), ConfigError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        }),
    }
}

/// Persisted records for one device index
#[derive(Debug, Clone)]
pub struct DeviceStore {
    state_dir: PathBuf,
    index: u32,
}

impl DeviceStore {
    pub fn new(state_dir: impl Into<PathBuf>, index: u32) -> Self {
        Self {
            state_dir: state_dir.into(),
            index,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Directory holding this device's records
    pub fn dir(&self) -> PathBuf {
        self.state_dir
            .join("devices")
            .join(format!("video{}", self.index))
    }

    pub fn boot_path(&self) -> PathBuf {
        self.dir().join("boot.json")
    }

    pub fn pipeline_path(&self) -> PathBuf {
        self.dir().join("pipeline.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir().join("lock")
    }

    pub fn attach_lock_path(&self) -> PathBuf {
        self.dir().join("attach.lock")
    }

    pub fn daemon_lock_path(&self) -> PathBuf {
        self.dir().join("daemon.lock")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir().join("control.sock")
    }

    pub fn ensure_dir(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(self.dir()).map_err(|e| ConfigError::Io {
            path: self.dir(),
            message: e.to_string(),
        })
    }

    pub fn load_boot(&self) -> Result<Option<PersistedBootConfig>, ConfigError> {
        read_json(&self.boot_path())
    }

    pub fn save_boot(&self, boot: &PersistedBootConfig) -> Result<(), ConfigError> {
        write_json_atomic(&self.boot_path(), boot)
    }

    pub fn remove_boot(&self) -> Result<(), ConfigError> {
        remove_if_exists(&self.boot_path())
    }

    /// Persisted pipeline config, or the default when none was saved yet
    pub fn load_pipeline(&self) -> Result<PipelineConfig, ConfigError> {
        let config: PipelineConfig = read_json(&self.pipeline_path())?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    pub fn save_pipeline(&self, config: &PipelineConfig) -> Result<(), ConfigError> {
        config.validate()?;
        write_json_atomic(&self.pipeline_path(), config)
    }

    /// Every device with a boot record under `state_dir`, sorted by index
    pub fn provisioned(state_dir: &Path) -> Result<Vec<PersistedBootConfig>, ConfigError> {
        let devices_dir = state_dir.join("devices");
        let entries = match std::fs::read_dir(&devices_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ConfigError::Io {
                    path: devices_dir,
                    message: e.to_string(),
                });
            }
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(index) = name
                .to_str()
                .and_then(|n| n.strip_prefix("video"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            if let Some(boot) = DeviceStore::new(state_dir, index).load_boot()? {
                records.push(boot);
            }
        }
        records.sort_by_key(|boot| boot.device.device_index);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VirtualDeviceConfig;

    #[test]
    fn test_boot_record_roundtrip_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::new(dir.path(), 10);
        assert_eq!(store.load_boot().unwrap(), None);

        let boot = PersistedBootConfig {
            device: VirtualDeviceConfig::new(10, "Cam", 4),
            enabled: true,
        };
        store.save_boot(&boot).unwrap();
        assert_eq!(store.load_boot().unwrap(), Some(boot));

        store.remove_boot().unwrap();
        store.remove_boot().unwrap();
        assert_eq!(store.load_boot().unwrap(), None);
    }

    #[test]
    fn test_missing_pipeline_record_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::new(dir.path(), 3);
        assert_eq!(store.load_pipeline().unwrap(), PipelineConfig::default());
    }

    #[test]
    fn test_corrupt_record_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::new(dir.path(), 3);
        store.ensure_dir().unwrap();
        std::fs::write(store.pipeline_path(), b"{ not json").unwrap();
        assert!(matches!(
            store.load_pipeline(),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_provisioned_lists_sorted_records() {
        let dir = tempfile::tempdir().unwrap();
        for index in [12, 10] {
            DeviceStore::new(dir.path(), index)
                .save_boot(&PersistedBootConfig {
                    device: VirtualDeviceConfig::new(index, "Cam", 4),
                    enabled: false,
                })
                .unwrap();
        }
        // Directory without a record is skipped
        DeviceStore::new(dir.path(), 11).ensure_dir().unwrap();

        let indices: Vec<u32> = DeviceStore::provisioned(dir.path())
            .unwrap()
            .iter()
            .map(|boot| boot.device.device_index)
            .collect();
        assert_eq!(indices, vec![10, 12]);
    }
}
