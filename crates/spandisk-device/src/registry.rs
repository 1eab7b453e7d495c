//! Device registry
//!
//! Owns the mapping from unit numbers to logical devices and the
//! per-unit configuration lock. Configure and teardown mutate a unit
//! only while holding its lock; waiters queue on the async mutex and
//! wake in no particular order.

use crate::device::{DeviceHandle, LogicalDevice};
use crate::error::{DeviceError, DeviceResult};
use crate::remap::RemapPool;
use parking_lot::RwLock;
use spandisk_common::{DeviceSpec, TransferMode, UnitId};
use spandisk_storage::{ComponentDevice, FileComponent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One unit's slot: the configuration lock plus the device, if any
#[derive(Debug, Default)]
struct Slot {
    /// Exclusive, interruptible configuration lock (waiting on it is a
    /// cancellable future)
    lock: Mutex<()>,
    device: RwLock<Option<Arc<LogicalDevice>>>,
}

/// Registry of logical devices, keyed by unit number
#[derive(Debug)]
pub struct DeviceRegistry {
    slots: RwLock<HashMap<u32, Arc<Slot>>>,
    /// Remap pool shared by every device in the registry
    pool: Arc<RemapPool>,
}

impl DeviceRegistry {
    /// Create a registry with the default remap pool
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            pool: RemapPool::with_default_capacity(),
        }
    }

    /// Create a registry with a custom remap pool budget
    #[must_use]
    pub fn with_pool_capacity(bytes: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            pool: RemapPool::new(bytes),
        }
    }

    fn slot(&self, unit: UnitId) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().get(&unit.index()) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(slots.entry(unit.index()).or_default())
    }

    /// Configure a unit from a declarative spec, opening each component
    /// exclusively
    ///
    /// Any failure unwinds every open taken so far and leaves the unit
    /// unconfigured.
    pub async fn configure(&self, spec: &DeviceSpec) -> DeviceResult<Arc<LogicalDevice>> {
        let unit = UnitId::new(spec.unit);
        let slot = self.slot(unit);
        let _guard = slot.lock.lock().await;

        if slot.device.read().is_some() {
            return Err(DeviceError::AlreadyConfigured);
        }

        // Open the components; a drop on the error path closes them.
        let mut devices: Vec<Arc<dyn ComponentDevice>> = Vec::with_capacity(spec.components.len());
        for path in &spec.components {
            let component =
                FileComponent::open(path, spec.direct_io).map_err(|source| match source {
                    spandisk_common::Error::Busy(path) => DeviceError::Busy(path),
                    source => DeviceError::ComponentOpen {
                        path: path.display().to_string(),
                        source,
                    },
                })?;
            devices.push(Arc::new(component));
        }

        let device = Arc::new(LogicalDevice::assemble(
            unit,
            devices,
            spec.interleave,
            spec.flags(),
            spec.transfer_mode,
            Arc::clone(&self.pool),
        )?);

        // Pick up an existing label; most devices carry none.
        device.load_label().await;

        *slot.device.write() = Some(Arc::clone(&device));
        Ok(device)
    }

    /// Configure a unit from already opened components (in-memory
    /// devices, tests, the verify smoke check)
    pub async fn configure_assembled(
        &self,
        unit: UnitId,
        devices: Vec<Arc<dyn ComponentDevice>>,
        interleave: u64,
        flags: spandisk_common::DeviceFlags,
        mode: TransferMode,
    ) -> DeviceResult<Arc<LogicalDevice>> {
        let slot = self.slot(unit);
        let _guard = slot.lock.lock().await;

        if slot.device.read().is_some() {
            return Err(DeviceError::AlreadyConfigured);
        }

        let device = Arc::new(LogicalDevice::assemble(
            unit,
            devices,
            interleave,
            flags,
            mode,
            Arc::clone(&self.pool),
        )?);
        *slot.device.write() = Some(Arc::clone(&device));
        Ok(device)
    }

    /// Tear a unit down, closing its components
    ///
    /// Refuses while any open handle is live.
    pub async fn teardown(&self, unit: UnitId) -> DeviceResult<()> {
        let slot = self.slot(unit);
        let _guard = slot.lock.lock().await;

        let device = slot
            .device
            .read()
            .clone()
            .ok_or(DeviceError::NotConfigured)?;
        let opens = device.open_count();
        if opens > 0 {
            debug!(%unit, opens, "teardown refused");
            return Err(DeviceError::Busy(format!(
                "{unit} has {opens} open handles"
            )));
        }

        *slot.device.write() = None;
        info!(%unit, "device torn down");
        // Components close when the last reference to the device goes.
        Ok(())
    }

    /// Look up a configured device
    pub fn device(&self, unit: UnitId) -> DeviceResult<Arc<LogicalDevice>> {
        self.slot(unit)
            .device
            .read()
            .clone()
            .ok_or(DeviceError::NotConfigured)
    }

    /// Take an open handle on a configured device
    pub fn open(&self, unit: UnitId) -> DeviceResult<DeviceHandle> {
        Ok(self.device(unit)?.open())
    }

    /// Size in blocks, or None while unconfigured
    #[must_use]
    pub fn size_blocks(&self, unit: UnitId) -> Option<u64> {
        self.slot(unit)
            .device
            .read()
            .as_ref()
            .map(|d| d.size_blocks())
    }

    /// Units currently configured, in order
    #[must_use]
    pub fn units(&self) -> Vec<UnitId> {
        let mut units: Vec<UnitId> = self
            .slots
            .read()
            .iter()
            .filter(|(_, slot)| slot.device.read().is_some())
            .map(|(&unit, _)| UnitId::new(unit))
            .collect();
        units.sort_unstable();
        units
    }

    /// Persist a unit's label under the configuration lock
    pub async fn write_label(&self, unit: UnitId) -> DeviceResult<()> {
        let slot = self.slot(unit);
        let _guard = slot.lock.lock().await;
        let device = slot
            .device
            .read()
            .clone()
            .ok_or(DeviceError::NotConfigured)?;
        device.write_label().await
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
