use crate::QemuError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use vmwait_core::{CoreError, Inventory, VmIdentity};

const INVENTORY_FILE: &str = "inventory.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    pub qmp_socket: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qga_socket: Option<PathBuf>,
}

/// Ordered list of VMs known to one server. File order is the order used
/// when several VMs share a name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryFile {
    #[serde(default)]
    pub vms: Vec<VmRecord>,
}

impl InventoryFile {
    /// Load the inventory stored in `server_dir`.
    ///
    /// # Errors
    /// Returns `QemuError` if the file cannot be read, parsed, or holds
    /// duplicate VM ids.
    pub fn load(server_dir: &Path) -> Result<Self, QemuError> {
        let path = server_dir.join(INVENTORY_FILE);
        let content = std::fs::read_to_string(&path)?;
        let inventory: Self = serde_json::from_str(&content).map_err(|e| {
            QemuError::Inventory(format!("Failed to parse {}: {e}", path.display()))
        })?;
        inventory.validate()?;
        Ok(inventory)
    }

    /// Save the inventory into `server_dir`, creating it if needed.
    ///
    /// # Errors
    /// Returns `QemuError` if the inventory cannot be serialized or written.
    pub fn save(&self, server_dir: &Path) -> Result<(), QemuError> {
        std::fs::create_dir_all(server_dir)?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(server_dir.join(INVENTORY_FILE), content)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), QemuError> {
        let mut seen = HashSet::new();
        for vm in &self.vms {
            if vm.id.is_empty() {
                return Err(QemuError::Inventory(format!(
                    "VM '{}' has an empty id",
                    vm.name
                )));
            }
            if !seen.insert(vm.id.as_str()) {
                return Err(QemuError::Inventory(format!("Duplicate VM id '{}'", vm.id)));
            }
        }
        Ok(())
    }
}

/// Directory of servers, one sub-directory with an `inventory.json` each.
#[derive(Debug, Clone)]
pub struct ServerRegistry {
    servers_dir: PathBuf,
}

impl ServerRegistry {
    pub fn new(servers_dir: impl Into<PathBuf>) -> Self {
        Self {
            servers_dir: servers_dir.into(),
        }
    }

    #[must_use]
    pub fn server_dir(&self, server: &str) -> PathBuf {
        self.servers_dir.join(server)
    }

    /// Names of all servers that have an inventory, sorted.
    ///
    /// # Errors
    /// Returns `QemuError::Io` if the servers directory cannot be listed.
    pub fn server_names(&self) -> Result<Vec<String>, QemuError> {
        if !self.servers_dir.exists() {
            return Ok(Vec::new());
        }

        let mut names: Vec<String> = std::fs::read_dir(&self.servers_dir)?
            .filter_map(Result::ok)
            .filter(|e| e.path().join(INVENTORY_FILE).is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Load the inventory of `server`.
    ///
    /// # Errors
    /// Returns `QemuError::ServerNotFound` if the server has no inventory.
    pub fn load(&self, server: &str) -> Result<InventoryFile, QemuError> {
        if server.is_empty() || server.contains(['/', '\\']) || matches!(server, "." | "..") {
            return Err(QemuError::ServerNotFound(server.to_string()));
        }
        let dir = self.server_dir(server);
        if !dir.join(INVENTORY_FILE).is_file() {
            return Err(QemuError::ServerNotFound(server.to_string()));
        }
        InventoryFile::load(&dir)
    }

    /// Look up the record backing `vm`.
    ///
    /// # Errors
    /// Returns `QemuError::VmNotFound` if the VM is no longer in its server's inventory.
    pub fn record(&self, vm: &VmIdentity) -> Result<VmRecord, QemuError> {
        self.load(&vm.server)?
            .vms
            .into_iter()
            .find(|r| r.id == vm.id)
            .ok_or_else(|| QemuError::VmNotFound(vm.handle()))
    }

    fn split_handle<'h>(&self, handle: &'h str) -> Result<(String, &'h str), QemuError> {
        if let Some((server, id)) = handle.split_once('/') {
            return Ok((server.to_string(), id));
        }

        let mut servers = self.server_names()?;
        match servers.len() {
            1 => Ok((servers.remove(0), handle)),
            0 => Err(QemuError::ServerNotFound(format!(
                "no servers in {}",
                self.servers_dir.display()
            ))),
            _ => Err(QemuError::VmNotFound(format!(
                "handle '{handle}' needs a server prefix (one of: {})",
                servers.join(", ")
            ))),
        }
    }
}

#[async_trait]
impl Inventory for ServerRegistry {
    async fn resolve_by_name(
        &self,
        name: &str,
        server: &str,
    ) -> Result<Vec<VmIdentity>, CoreError> {
        let inventory = self.load(server)?;
        Ok(inventory
            .vms
            .into_iter()
            .filter(|r| r.name == name)
            .map(|r| VmIdentity::new(r.id, r.name, server))
            .collect())
    }

    async fn resolve_by_handle(&self, handle: &str) -> Result<VmIdentity, CoreError> {
        let (server, id) = self.split_handle(handle)?;
        let record = self
            .load(&server)?
            .vms
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| QemuError::VmNotFound(handle.to_string()))?;
        Ok(VmIdentity::new(record.id, record.name, server))
    }
}
