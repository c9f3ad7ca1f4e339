//! Device registry synchronization for one skill.
//!
//! Wraps [`Storage`] with the skill's identity and declared device types,
//! keeps a local view of the skill's devices, and publishes a catalog change
//! notice after every mutation so other participants reload theirs.

use crate::bus::BusClient;
use crate::storage::{Registration, Storage, StorageError};
use parking_lot::RwLock;
use skill_core::{Device, DeviceType, DeviceUpdate, Id, NewDevice, Room};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("skill '{skill}' did not declare device type '{device_type}'")]
    UndeclaredDeviceType { skill: String, device_type: String },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug)]
pub struct DeviceRegistry {
    storage: Arc<Storage>,
    bus: BusClient,
    skill_name: String,
    help_text: Option<String>,
    declared_types: Vec<String>,
    skill_id: RwLock<Option<Id>>,
    types: RwLock<HashMap<String, DeviceType>>,
    devices: RwLock<Vec<Device>>,
}

impl DeviceRegistry {
    pub fn new(
        storage: Arc<Storage>,
        bus: BusClient,
        skill_name: impl Into<String>,
        help_text: Option<String>,
        declared_types: Vec<String>,
    ) -> Self {
        Self {
            storage,
            bus,
            skill_name: skill_name.into(),
            help_text,
            declared_types,
            skill_id: RwLock::new(None),
            types: RwLock::new(HashMap::new()),
            devices: RwLock::new(Vec::new()),
        }
    }

    pub fn skill_name(&self) -> &str {
        &self.skill_name
    }

    /// Startup sync: skill row, declared types, then the local device view.
    ///
    /// Every step is an upsert, so repeating it after a partial run is safe.
    pub async fn sync_startup(&self) -> Result<()> {
        self.ensure_skill_registered().await?;
        let types = self.ensure_device_types_registered().await?;
        let devices = self.refresh().await?;
        info!(
            skill = %self.skill_name,
            device_types = types.len(),
            devices,
            "device registry synchronized"
        );
        Ok(())
    }

    /// Upsert the skill row by name and cache its id.
    pub async fn ensure_skill_registered(&self) -> Result<Id> {
        let record = self
            .storage
            .upsert_skill(&self.skill_name, self.help_text.as_deref())
            .await?;
        debug!(skill = %record.name, skill_id = %record.id, "skill registered");
        *self.skill_id.write() = Some(record.id.clone());
        Ok(record.id)
    }

    async fn skill_id(&self) -> Result<Id> {
        let cached = self.skill_id.read().clone();
        match cached {
            Some(id) => Ok(id),
            None => self.ensure_skill_registered().await,
        }
    }

    pub async fn ensure_device_types_registered(&self) -> Result<Vec<DeviceType>> {
        let skill_id = self.skill_id().await?;
        let mut registered = Vec::with_capacity(self.declared_types.len());
        for name in &self.declared_types {
            let device_type = self.storage.upsert_device_type(&skill_id, name).await?;
            self.types.write().insert(name.clone(), device_type.clone());
            registered.push(device_type);
        }
        Ok(registered)
    }

    async fn device_type(&self, name: &str) -> Result<DeviceType> {
        if !self.declared_types.iter().any(|t| t == name) {
            return Err(RegistryError::UndeclaredDeviceType {
                skill: self.skill_name.clone(),
                device_type: name.to_string(),
            });
        }
        let cached = self.types.read().get(name).cloned();
        if let Some(device_type) = cached {
            return Ok(device_type);
        }
        let skill_id = self.skill_id().await?;
        let device_type = self.storage.upsert_device_type(&skill_id, name).await?;
        self.types.write().insert(name.to_string(), device_type.clone());
        Ok(device_type)
    }

    /// Register (or merge into) a device of a declared type.
    ///
    /// An unknown room name is logged and the device is stored without a room.
    pub async fn register_device(&self, new: &NewDevice) -> Result<Registration> {
        let skill_id = self.skill_id().await?;
        let device_type = self.device_type(&new.device_type).await?;

        let room_id = match &new.room {
            Some(name) => match self.storage.find_room(name).await? {
                Some(room) => Some(room.id),
                None => {
                    warn!(
                        device = %new.name,
                        room = %name,
                        "unknown room, registering device without one"
                    );
                    None
                }
            },
            None => None,
        };

        let registration = self
            .storage
            .register_device(&skill_id, &device_type, new, room_id.as_ref())
            .await?;
        info!(
            device = %registration.device.name,
            device_type = %device_type.name,
            created = registration.created,
            patterns_added = registration.patterns_added,
            "device registered"
        );
        self.catalog_changed().await;
        Ok(registration)
    }

    pub async fn update_device(&self, id: &Id, update: &DeviceUpdate) -> Result<Device> {
        let skill_id = self.skill_id().await?;
        let device = self.storage.update_device(&skill_id, id, update).await?;
        info!(device = %device.name, device_id = %id, "device updated");
        self.catalog_changed().await;
        Ok(device)
    }

    pub async fn delete_device(&self, id: &Id) -> Result<()> {
        let skill_id = self.skill_id().await?;
        self.storage.delete_device(&skill_id, id).await?;
        info!(device_id = %id, "device deleted");
        self.catalog_changed().await;
        Ok(())
    }

    pub async fn ensure_room(&self, name: &str) -> Result<Room> {
        Ok(self.storage.ensure_room(name).await?)
    }

    /// Reload the local view from storage. Returns the device count.
    pub async fn refresh(&self) -> Result<usize> {
        let skill_id = self.skill_id().await?;
        let devices = self.storage.list_devices(&skill_id).await?;
        let count = devices.len();
        *self.devices.write() = devices;
        debug!(skill = %self.skill_name, devices = count, "device cache refreshed");
        Ok(count)
    }

    /// Devices owned by this skill, as of the last refresh.
    pub fn devices(&self) -> Vec<Device> {
        self.devices.read().clone()
    }

    /// First local device whose name or patterns match `text`.
    pub fn find_device(&self, text: &str) -> Option<Device> {
        self.devices.read().iter().find(|d| d.is_named_by(text)).cloned()
    }

    /// Announce a committed mutation and reload the local view. Failures here
    /// do not undo the write, so they are only logged.
    async fn catalog_changed(&self) {
        if !self.bus.notify_device_update().await {
            warn!(skill = %self.skill_name, "device update notice was not delivered");
        }
        if let Err(e) = self.refresh().await {
            warn!(
                skill = %self.skill_name,
                error = %e,
                "device cache refresh failed after mutation"
            );
        }
    }
}
