use crate::{AuxCondition, VmIdentity};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("VM not found: {0}")]
    NotFound(String),

    #[error("Polling interval must be between 1 and 3600 seconds, got {0}")]
    InvalidInterval(u64),

    #[error("Invalid wait spec: {0}")]
    InvalidSpec(String),

    #[error("Timed out after {waited:?} waiting for {vm} (pending: {pending:?})")]
    Timeout {
        vm: VmIdentity,
        waited: Duration,
        pending: Vec<String>,
    },

    #[error("Probe for {condition} on {vm} failed: {cause}")]
    Probe {
        vm: VmIdentity,
        condition: AuxCondition,
        cause: String,
    },

    #[error("Control plane error: {0}")]
    ControlPlane(String),
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;
