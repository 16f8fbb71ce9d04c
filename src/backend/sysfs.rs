use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use log::debug;

use crate::config::{DEFAULT_SYSFS_ROOT, EdgeDetect};
use crate::error::{AppError, EventError};
use crate::gpio::{Channel, GpioBackend};

/// Drives lines through the legacy `/sys/class/gpio` interface.
pub struct SysfsGpioBackend {
    root: PathBuf,
}

impl Default for SysfsGpioBackend {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl SysfsGpioBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn line_dir(&self, channel: &Channel) -> PathBuf {
        self.root.join(&channel.gpio_name)
    }

    fn value_path(&self, channel: &Channel) -> PathBuf {
        self.line_dir(channel).join("value")
    }

    fn edge_path(&self, channel: &Channel) -> PathBuf {
        self.line_dir(channel).join("edge")
    }

    fn write_attr(path: &Path, text: &str) -> Result<(), AppError> {
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| AppError::Gpio(format!("open {}: {e}", path.display())))?;
        file.write_all(text.as_bytes())
            .map_err(|e| AppError::Gpio(format!("write {}: {e}", path.display())))
    }
}

impl GpioBackend for SysfsGpioBackend {
    fn export_input(&self, channel: &Channel) -> Result<(), AppError> {
        if !self.line_dir(channel).exists() {
            Self::write_attr(&self.root.join("export"), &channel.line.to_string())?;
            debug!("exported line {} as {}", channel.line, channel.gpio_name);
        }
        Self::write_attr(&self.line_dir(channel).join("direction"), "in")
    }

    fn unexport(&self, channel: &Channel) -> Result<(), AppError> {
        if !self.line_dir(channel).exists() {
            return Ok(());
        }
        Self::write_attr(&self.root.join("unexport"), &channel.line.to_string())
    }

    fn read_value(&self, channel: &Channel) -> Result<u8, AppError> {
        let path = self.value_path(channel);
        let text = fs::read_to_string(&path)
            .map_err(|e| AppError::Gpio(format!("read {}: {e}", path.display())))?;
        text.trim()
            .parse::<u8>()
            .map_err(|_| AppError::Gpio(format!("unexpected value {:?} in {}", text.trim(), path.display())))
    }

    fn open_value(&self, channel: &Channel) -> Result<OwnedFd, EventError> {
        let path = self.value_path(channel);
        let file = File::open(&path).map_err(|source| EventError::ValueOpen {
            path: path.display().to_string(),
            source,
        })?;
        set_nonblocking(&file).map_err(|source| EventError::ValueNonBlocking {
            path: path.display().to_string(),
            source,
        })?;
        Ok(OwnedFd::from(file))
    }

    fn write_edge(&self, channel: &Channel, edge: EdgeDetect) -> Result<(), EventError> {
        let path = self.edge_path(channel);
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| EventError::EdgeOpen {
                path: path.display().to_string(),
                source,
            })?;
        file.write_all(edge.as_str().as_bytes())
            .map_err(|source| EventError::EdgeWrite {
                path: path.display().to_string(),
                source,
            })
    }
}

fn set_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: `fd` stays open for the duration of both calls
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
