use crate::{CoreError, PowerState, ProbeOutcome, VmIdentity};
use async_trait::async_trait;

/// Looks VMs up on a control-plane server.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// All VMs named `name` on `server`, in the server's native order.
    ///
    /// # Errors
    /// Returns `CoreError::NotFound` if the server is unknown.
    async fn resolve_by_name(&self, name: &str, server: &str)
    -> Result<Vec<VmIdentity>, CoreError>;

    /// Resolve a handle previously produced by `VmIdentity::handle`.
    ///
    /// # Errors
    /// Returns `CoreError::NotFound` if no VM carries that handle.
    async fn resolve_by_handle(&self, handle: &str) -> Result<VmIdentity, CoreError>;
}

#[async_trait]
pub trait PowerControl: Send + Sync {
    /// Ask the guest OS to shut down. Returns once the request is accepted.
    ///
    /// # Errors
    /// Returns `CoreError::ControlPlane` if the request cannot be delivered.
    async fn issue_shutdown(&self, vm: &VmIdentity) -> Result<(), CoreError>;

    /// Power the VM on. Returns once the request is accepted.
    ///
    /// # Errors
    /// Returns `CoreError::ControlPlane` if the request cannot be delivered.
    async fn issue_start(&self, vm: &VmIdentity) -> Result<(), CoreError>;

    /// Current power state, read fresh from the control plane.
    ///
    /// # Errors
    /// Returns `CoreError::ControlPlane` if the state cannot be queried.
    async fn power_state(&self, vm: &VmIdentity) -> Result<PowerState, CoreError>;
}

/// Guest-side readiness probes. Implementations never return errors; a
/// transport or agent failure is reported as `ProbeOutcome::Failed`.
#[async_trait]
pub trait GuestIntrospection: Send + Sync {
    async fn guest_ip(&self, vm: &VmIdentity) -> ProbeOutcome<String>;

    async fn customization_marker(&self, vm: &VmIdentity) -> ProbeOutcome<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl GuestCommand {
    /// Run `script` through `/bin/sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs commands inside the guest.
#[async_trait]
pub trait GuestCommandExecutor: Send + Sync {
    /// # Errors
    /// Returns `CoreError::ControlPlane` if the command cannot be started or
    /// its result cannot be collected.
    async fn execute(
        &self,
        vm: &VmIdentity,
        command: &GuestCommand,
    ) -> Result<CommandOutput, CoreError>;
}
