// SPDX-License-Identifier: GPL-3.0-only

//! Creates and destroys loopback devices and their durable records
//!
//! Every mutation is existence-check-then-mutate: provisioning an index that
//! already carries the requested configuration changes nothing.

use crate::backends::LoopbackBackend;
use crate::config::{PersistedBootConfig, VirtualDeviceConfig};
use crate::errors::ProvisioningError;
use crate::lock;
use crate::storage::DeviceStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct DeviceProvisioner {
    backend: Arc<dyn LoopbackBackend>,
    state_dir: PathBuf,
}

impl DeviceProvisioner {
    pub fn new(backend: Arc<dyn LoopbackBackend>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            state_dir: state_dir.into(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn LoopbackBackend> {
        &self.backend
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Create the device for `config`, persist it and register it for boot
    pub fn provision(&self, config: &VirtualDeviceConfig) -> Result<(), ProvisioningError> {
        config.validate()?;
        let index = config.device_index;
        let store = DeviceStore::new(&self.state_dir, index);
        let record = store.load_boot()?;

        if let Some(record) = &record
            && record.device != *config
        {
            return Err(conflict(index, record.device.describe(), config));
        }

        self.backend.ensure_available()?;

        match self.backend.query(index)? {
            Some(existing) if existing.matches(config) => {
                if record.is_some() {
                    debug!(index, "Device already provisioned with this configuration");
                    return Ok(());
                }
                // Created outside of us; adopt it
                info!(index, "Adopting existing loopback device");
            }
            Some(existing) => return Err(conflict(index, existing.describe(), config)),
            None => self.backend.create(config)?,
        }

        store.save_boot(&PersistedBootConfig {
            device: config.clone(),
            enabled: record.map(|r| r.enabled).unwrap_or(false),
        })?;
        self.register_boot()?;

        info!(index, label = %config.label, "Provisioned virtual device");
        Ok(())
    }

    /// Remove the device and its boot record
    ///
    /// Fails with `Busy` while a pipeline holds the attachment lock.
    pub fn deprovision(&self, index: u32) -> Result<(), ProvisioningError> {
        let store = DeviceStore::new(&self.state_dir, index);

        // Held for the whole removal so no pipeline can attach meanwhile
        let _attach = lock::try_lock_exclusive(&store.attach_lock_path())?
            .ok_or(ProvisioningError::Busy { index })?;

        let record = store.load_boot()?;
        match self.backend.query(index)? {
            Some(existing) if !existing.is_loopback => {
                return Err(ProvisioningError::Conflict {
                    index,
                    existing: existing.describe(),
                    requested: "removal".into(),
                });
            }
            Some(_) => self.backend.remove(index)?,
            None => debug!(index, "No device registered at index"),
        }

        if record.is_some() {
            store.remove_boot()?;
            self.register_boot()?;
        }

        info!(index, "Deprovisioned virtual device");
        Ok(())
    }

    /// Rewrite boot registration from every persisted record
    fn register_boot(&self) -> Result<(), ProvisioningError> {
        let devices: Vec<VirtualDeviceConfig> = DeviceStore::provisioned(&self.state_dir)?
            .into_iter()
            .map(|record| record.device)
            .collect();
        self.backend.register_boot(&devices)
    }
}

fn conflict(index: u32, existing: String, requested: &VirtualDeviceConfig) -> ProvisioningError {
    ProvisioningError::Conflict {
        index,
        existing,
        requested: requested.describe(),
    }
}
