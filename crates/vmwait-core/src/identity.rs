use crate::{CoreError, EventSink, Inventory, VmIdentity, WaitEvent};

/// The ways a caller can name the VM to operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    ByName { name: String, server: String },
    ByHandle(VmIdentity),
    /// A raw handle read from an input stream, one VM per item.
    Piped(String),
}

impl IdentitySource {
    pub fn by_name(name: impl Into<String>, server: impl Into<String>) -> Self {
        Self::ByName {
            name: name.into(),
            server: server.into(),
        }
    }
}

/// Turn `source` into exactly one `VmIdentity`.
///
/// When several VMs share a name the first one in the server's native order
/// is used.
///
/// # Errors
/// Returns `CoreError::NotFound` if nothing matches, or whatever the
/// inventory reports for an unresolvable handle.
pub async fn resolve_identity<I>(
    inventory: &I,
    source: IdentitySource,
    events: &dyn EventSink,
) -> Result<VmIdentity, CoreError>
where
    I: Inventory + ?Sized,
{
    let (vm, candidates) = match source {
        IdentitySource::ByName { name, server } => {
            let matches = inventory.resolve_by_name(&name, &server).await?;
            let candidates = matches.len();
            let vm = matches.into_iter().next().ok_or_else(|| {
                CoreError::NotFound(format!("no VM named '{name}' on server '{server}'"))
            })?;
            (vm, candidates)
        }
        IdentitySource::ByHandle(vm) => (vm, 1),
        IdentitySource::Piped(handle) => {
            let handle = handle.trim();
            if handle.is_empty() {
                return Err(CoreError::NotFound("empty VM handle".into()));
            }
            (inventory.resolve_by_handle(handle).await?, 1)
        }
    };

    events.emit(&WaitEvent::Resolved {
        vm: vm.clone(),
        candidates,
    });
    Ok(vm)
}
