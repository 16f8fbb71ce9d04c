pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod gpio;
pub mod routes;

pub use config::{AppConfig, ChannelConfig, EdgeDetect, HttpConfig};
pub use error::{AppError, EventError};
pub use events::{Callback, EventRegistry, EventStatus, WaitOutcome};
pub use gpio::{Channel, ChannelDescriptor, EdgeEvent, GpioBackend, GpioManager};
pub use routes::AppState;

pub use backend::MockGpioBackend;
#[cfg(feature = "sysfs-gpio")]
pub use backend::SysfsGpioBackend;
