use crate::QemuError;
use std::path::PathBuf;

pub struct VmwaitDirs {
    pub state: PathBuf,
    pub config: PathBuf,
}

impl VmwaitDirs {
    /// Locate platform-specific state/config directories for vmwait.
    ///
    /// # Errors
    /// Returns `QemuError::Directory` if standard OS directories cannot be determined.
    pub fn new() -> Result<Self, QemuError> {
        let state = dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .ok_or_else(|| QemuError::Directory("state directory not found".into()))?
            .join("vmwait");

        let config = dirs::config_dir()
            .ok_or_else(|| QemuError::Directory("config directory not found".into()))?
            .join("vmwait");

        Ok(Self { state, config })
    }

    #[must_use]
    pub fn servers_dir(&self) -> PathBuf {
        self.state.join("servers")
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.state.join("logs")
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.config.join("settings.hcl")
    }
}
