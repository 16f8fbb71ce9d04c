pub mod mock;
#[cfg(feature = "sysfs-gpio")]
pub mod sysfs;

pub use mock::MockGpioBackend;
#[cfg(feature = "sysfs-gpio")]
pub use sysfs::SysfsGpioBackend;
