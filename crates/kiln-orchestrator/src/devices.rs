//! Device pool.
//!
//! Tracks which job, if any, is bound to each device. Every device has
//! capacity 1. The manager is owned by the scheduler state and mutated only
//! inside its critical section, so it needs no locking of its own.

use crate::error::DeviceError;
use kiln_training::{Device, DeviceId, DevicePolicy, JobId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A device and its current binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device: Device,
    pub bound_job: Option<JobId>,
}

impl DeviceStatus {
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.bound_job.is_none()
    }
}

/// Fixed set of devices with at most one job per device.
#[derive(Debug, Clone)]
pub struct DeviceManager {
    slots: Vec<DeviceStatus>,
}

impl DeviceManager {
    /// Creates a pool from `devices`, in the order they are tried.
    #[must_use]
    pub fn new(devices: Vec<Device>) -> Self {
        Self { slots: devices.into_iter().map(|device| DeviceStatus { device, bound_job: None }).collect() }
    }

    /// Tries to bind a free device to `job_id` without waiting.
    ///
    /// Selection is first-free of the preferred kind. `DevicePolicy::Prefer`
    /// falls back to the first free device of any kind.
    ///
    /// # Returns
    /// `Ok(None)` if nothing suitable is free.
    ///
    /// # Errors
    /// `DeviceError::AlreadyBound` if `job_id` already holds a device.
    pub fn try_acquire(
        &mut self,
        job_id: &JobId,
        policy: DevicePolicy,
    ) -> Result<Option<Device>, DeviceError> {
        if let Some(held) = self.bound_to(job_id) {
            warn!(job_id = %job_id, device = %held.id, "Job already holds a device");
            return Err(DeviceError::AlreadyBound { job_id: job_id.clone(), device_id: held.id.clone() });
        }

        let preferred = policy.preferred();
        let index = self
            .slots
            .iter()
            .position(|s| s.is_free() && s.device.kind == preferred)
            .or_else(|| {
                self.slots.iter().position(|s| s.is_free() && policy.accepts(s.device.kind))
            });

        let Some(index) = index else {
            return Ok(None);
        };
        let slot = &mut self.slots[index];
        slot.bound_job = Some(job_id.clone());
        debug!(job_id = %job_id, device = %slot.device.id, kind = %slot.device.kind, "Device acquired");
        Ok(Some(slot.device.clone()))
    }

    /// Unbinds a device.
    ///
    /// # Returns
    /// The job that held it.
    pub fn release(&mut self, device_id: &DeviceId) -> Result<JobId, DeviceError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| &s.device.id == device_id)
            .ok_or_else(|| DeviceError::UnknownDevice(device_id.clone()))?;
        let job_id = slot.bound_job.take().ok_or_else(|| DeviceError::NotBound(device_id.clone()))?;
        debug!(job_id = %job_id, device = %device_id, "Device released");
        Ok(job_id)
    }

    /// Every device with its binding.
    #[must_use]
    pub fn list_devices(&self) -> Vec<DeviceStatus> {
        self.slots.clone()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_free()).count()
    }

    /// The device bound to `job_id`, if any.
    #[must_use]
    pub fn bound_to(&self, job_id: &JobId) -> Option<&Device> {
        self.slots.iter().find(|s| s.bound_job.as_ref() == Some(job_id)).map(|s| &s.device)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
