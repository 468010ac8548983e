pub mod allocator;
pub mod supervisor;

pub use allocator::{NbdPortAllocator, PortAllocError};
pub use supervisor::{ExporterStatus, QemuNbdError, QemuNbdSupervisor};
