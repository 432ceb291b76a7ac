use crate::{
    DEFAULT_AGENT_TIMEOUT, DEFAULT_QMP_TIMEOUT, GuestAgentClient, QemuError, QmpClient,
    ServerRegistry, VmRecord, select_guest_ip,
};
use async_trait::async_trait;
use std::time::Duration;
use vmwait_core::{
    CommandOutput, CoreError, CustomizationMarker, GuestCommand, GuestCommandExecutor,
    GuestIntrospection, Inventory, PowerControl, PowerState, ProbeOutcome, VmIdentity,
};

/// Control plane backed by local QEMU processes: VMs come from the server
/// registry, power goes through QMP and guest probes through
/// qemu-guest-agent.
#[derive(Debug, Clone)]
pub struct QemuControlPlane {
    registry: ServerRegistry,
    marker: CustomizationMarker,
    qmp_timeout: Duration,
    agent_timeout: Duration,
}

impl QemuControlPlane {
    pub fn new(registry: ServerRegistry) -> Self {
        Self {
            registry,
            marker: CustomizationMarker::default(),
            qmp_timeout: DEFAULT_QMP_TIMEOUT,
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_marker(mut self, marker: CustomizationMarker) -> Self {
        self.marker = marker;
        self
    }

    #[must_use]
    pub fn with_qmp_timeout(mut self, timeout: Duration) -> Self {
        self.qmp_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    fn qmp(&self, vm: &VmIdentity) -> Result<QmpClient, QemuError> {
        let record = self.registry.record(vm)?;
        Ok(QmpClient::new(record.qmp_socket).with_timeout(self.qmp_timeout))
    }

    fn agent(&self, vm: &VmIdentity) -> Result<GuestAgentClient, QemuError> {
        let VmRecord { qga_socket, .. } = self.registry.record(vm)?;
        let socket = qga_socket
            .ok_or_else(|| QemuError::GuestAgent(format!("{vm} has no guest agent socket")))?;
        Ok(GuestAgentClient::new(socket).with_timeout(self.agent_timeout))
    }
}

#[async_trait]
impl Inventory for QemuControlPlane {
    async fn resolve_by_name(
        &self,
        name: &str,
        server: &str,
    ) -> Result<Vec<VmIdentity>, CoreError> {
        self.registry.resolve_by_name(name, server).await
    }

    async fn resolve_by_handle(&self, handle: &str) -> Result<VmIdentity, CoreError> {
        self.registry.resolve_by_handle(handle).await
    }
}

#[async_trait]
impl PowerControl for QemuControlPlane {
    async fn issue_shutdown(&self, vm: &VmIdentity) -> Result<(), CoreError> {
        self.qmp(vm)?.system_powerdown().await?;
        Ok(())
    }

    async fn issue_start(&self, vm: &VmIdentity) -> Result<(), CoreError> {
        self.qmp(vm)?.power_on().await?;
        Ok(())
    }

    async fn power_state(&self, vm: &VmIdentity) -> Result<PowerState, CoreError> {
        Ok(self.qmp(vm)?.power_state().await?)
    }
}

#[async_trait]
impl GuestCommandExecutor for QemuControlPlane {
    async fn execute(
        &self,
        vm: &VmIdentity,
        command: &GuestCommand,
    ) -> Result<CommandOutput, CoreError> {
        Ok(self.agent(vm)?.exec(command).await?)
    }
}

#[async_trait]
impl GuestIntrospection for QemuControlPlane {
    async fn guest_ip(&self, vm: &VmIdentity) -> ProbeOutcome<String> {
        let agent = match self.agent(vm) {
            Ok(agent) => agent,
            Err(e) => return ProbeOutcome::failed(e),
        };

        let address = agent
            .network_interfaces()
            .await
            .map(|interfaces| select_guest_ip(&interfaces));
        ProbeOutcome::from(address).map(|ip| ip.to_string())
    }

    async fn customization_marker(&self, vm: &VmIdentity) -> ProbeOutcome<String> {
        self.marker.probe(self, vm).await
    }
}
