//! File-level restore: mounting a backup disk as a read-only filesystem
//! over a network block device, and browsing/streaming its contents
//! path-safely.

pub mod blockdev;
pub mod browse;
pub mod device_pool;
pub mod mount;

pub use device_pool::{DevicePoolError, NbdDevicePool};
pub use mount::{MountError, MountManager};
