use thiserror::Error;
use vmwait_core::CoreError;

#[derive(Error, Debug)]
pub enum QemuError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("QMP error: {0}")]
    Qmp(String),

    #[error("Guest agent error: {0}")]
    GuestAgent(String),

    #[error("QEMU not running: {0}")]
    NotRunning(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Inventory error: {0}")]
    Inventory(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("VM not found: {0}")]
    VmNotFound(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Directory error: {0}")]
    Directory(String),
}

impl From<QemuError> for CoreError {
    fn from(err: QemuError) -> Self {
        match err {
            QemuError::ServerNotFound(_) | QemuError::VmNotFound(_) => {
                CoreError::NotFound(err.to_string())
            }
            other => CoreError::ControlPlane(other.to_string()),
        }
    }
}
