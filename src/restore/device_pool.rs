//! Hands out kernel NBD device nodes (`/dev/nbd0`, ...) to restore mounts,
//! mirroring `crate::nbd::NbdPortAllocator`'s single-lock, held-briefly
//! bookkeeping pattern but over a fixed list of device paths instead of
//! a port range.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DevicePoolError {
    #[error("no free NBD device nodes available")]
    NoDevicesAvailable,
}

struct Inner {
    devices: Vec<String>,
    allocated: HashMap<String, String>, // device -> mount_id
}

pub struct NbdDevicePool {
    inner: RwLock<Inner>,
}

impl NbdDevicePool {
    pub fn new(devices: Vec<String>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                devices,
                allocated: HashMap::new(),
            }),
        }
    }

    pub fn allocate(&self, mount_id: &str) -> Result<String, DevicePoolError> {
        let mut inner = self.inner.write();
        let device = inner
            .devices
            .iter()
            .find(|d| !inner.allocated.contains_key(*d))
            .cloned()
            .ok_or(DevicePoolError::NoDevicesAvailable)?;
        inner.allocated.insert(device.clone(), mount_id.to_string());
        Ok(device)
    }

    pub fn release(&self, device: &str) {
        self.inner.write().allocated.remove(device);
    }

    pub fn release_by_mount_id(&self, mount_id: &str) {
        let mut inner = self.inner.write();
        let devices: Vec<String> = inner
            .allocated
            .iter()
            .filter(|(_, m)| m.as_str() == mount_id)
            .map(|(d, _)| d.clone())
            .collect();
        for device in devices {
            inner.allocated.remove(&device);
        }
    }

    pub fn free_count(&self) -> usize {
        let inner = self.inner.read();
        inner.devices.len() - inner.allocated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> NbdDevicePool {
        NbdDevicePool::new(vec!["/dev/nbd0".to_string(), "/dev/nbd1".to_string()])
    }

    #[test]
    fn allocates_devices_in_order_and_exhausts() {
        let pool = pool();
        assert_eq!(pool.allocate("m1").unwrap(), "/dev/nbd0");
        assert_eq!(pool.allocate("m2").unwrap(), "/dev/nbd1");
        assert!(pool.allocate("m3").is_err());
    }

    #[test]
    fn release_by_mount_id_frees_its_device() {
        let pool = pool();
        pool.allocate("m1").unwrap();
        pool.release_by_mount_id("m1");
        assert_eq!(pool.free_count(), 2);
    }
}
