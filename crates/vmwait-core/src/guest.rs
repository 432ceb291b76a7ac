use crate::{GuestCommand, GuestCommandExecutor, ProbeOutcome, VmIdentity};

/// Written by cloud-init once first-boot modules have run.
pub const DEFAULT_CUSTOMIZATION_MARKER: &str = "/var/lib/cloud/instance/boot-finished";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomizationMarker {
    path: String,
}

impl CustomizationMarker {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn command(&self) -> GuestCommand {
        GuestCommand::shell(format!("test -e {} && echo done", shell_quote(&self.path)))
    }

    /// Check the marker through `executor`.
    ///
    /// A zero exit with output is `Ready`; a non-zero exit or empty output is
    /// `NotYet`; an executor error is `Failed`.
    pub async fn probe<E>(&self, executor: &E, vm: &VmIdentity) -> ProbeOutcome<String>
    where
        E: GuestCommandExecutor + ?Sized,
    {
        match executor.execute(vm, &self.command()).await {
            Ok(output) => {
                let stdout = output.stdout.trim();
                if output.exit_code == 0 && !stdout.is_empty() {
                    ProbeOutcome::Ready(stdout.to_string())
                } else {
                    ProbeOutcome::NotYet
                }
            }
            Err(e) => ProbeOutcome::failed(e),
        }
    }
}

impl Default for CustomizationMarker {
    fn default() -> Self {
        Self::new(DEFAULT_CUSTOMIZATION_MARKER)
    }
}

fn shell_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}
