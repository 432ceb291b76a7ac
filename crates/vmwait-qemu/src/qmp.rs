use crate::QemuError;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;
use vmwait_core::PowerState;

pub const DEFAULT_QMP_TIMEOUT: Duration = Duration::from_secs(10);

/// Map a QMP `query-status` status string to a power state.
#[must_use]
pub fn power_state_from_status(status: &str) -> PowerState {
    match status {
        "running" => PowerState::PoweredOn,
        "paused" | "suspended" => PowerState::Suspended,
        "shutdown" | "prelaunch" => PowerState::PoweredOff,
        _ => PowerState::Unknown,
    }
}

/// One-shot QMP client: every command opens its own session on the
/// monitor socket.
#[derive(Debug, Clone)]
pub struct QmpClient {
    socket: PathBuf,
    timeout: Duration,
}

impl QmpClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: DEFAULT_QMP_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a QMP command and return its `return` payload.
    ///
    /// # Errors
    /// Returns `QemuError::NotRunning` if no QEMU process serves the socket,
    /// `QemuError::Qmp` on communication failures or when QEMU answers with
    /// an error, and `QemuError::Timeout` if QEMU is too slow.
    pub async fn command(
        &self,
        command: &str,
        args: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, QemuError> {
        let Some(stream) = self.connect().await? else {
            return Err(self.not_running());
        };
        self.execute(stream, command, args).await
    }

    /// Current power state. A monitor socket that is gone or refuses
    /// connections means QEMU is not running, which reads as `PoweredOff`.
    ///
    /// # Errors
    /// Returns `QemuError` if QEMU is reachable but the query fails.
    pub async fn power_state(&self) -> Result<PowerState, QemuError> {
        let Some(stream) = self.connect().await? else {
            return Ok(PowerState::PoweredOff);
        };

        let status = self.execute(stream, "query-status", None).await?;
        let status = status
            .get("status")
            .and_then(|s| s.as_str())
            .ok_or_else(|| QemuError::Qmp(format!("query-status returned {status}")))?;
        Ok(power_state_from_status(status))
    }

    /// Ask the guest to power down via ACPI. A QEMU process that is already
    /// gone has nothing left to power down, so that is accepted as done.
    ///
    /// # Errors
    /// Returns `QemuError::Qmp` if QEMU is running and the command fails.
    pub async fn system_powerdown(&self) -> Result<(), QemuError> {
        let Some(stream) = self.connect().await? else {
            debug!("{} is not running, nothing to power down", self.socket.display());
            return Ok(());
        };
        self.execute(stream, "system_powerdown", None).await.map(drop)
    }

    /// Power the VM on: reset a guest that shut down, then resume the CPUs.
    /// QMP can only do this while the QEMU process is alive.
    ///
    /// # Errors
    /// Returns `QemuError::NotRunning` if the QEMU process is gone and
    /// `QemuError::Qmp` if any of the commands fail.
    pub async fn power_on(&self) -> Result<(), QemuError> {
        let status = self.command("query-status", None).await?;
        if status.get("status").and_then(|s| s.as_str()) == Some("shutdown") {
            self.command("system_reset", None).await?;
        }
        self.command("cont", None).await.map(drop)
    }

    /// `None` when nothing listens on the socket.
    async fn connect(&self) -> Result<Option<UnixStream>, QemuError> {
        match UnixStream::connect(&self.socket).await {
            Ok(stream) => Ok(Some(stream)),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                debug!("QMP socket {} unavailable: {e}", self.socket.display());
                Ok(None)
            }
            Err(e) => Err(QemuError::Qmp(format!("Failed to connect to QMP: {e}"))),
        }
    }

    fn not_running(&self) -> QemuError {
        QemuError::NotRunning(format!(
            "no QEMU process behind {}; QMP can only power on a running QEMU process",
            self.socket.display()
        ))
    }

    async fn execute(
        &self,
        stream: UnixStream,
        command: &str,
        args: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, QemuError> {
        timeout(self.timeout, Self::session(stream, command, args))
            .await
            .map_err(|_| QemuError::Timeout(format!("QMP command '{command}'")))?
    }

    async fn session(
        stream: UnixStream,
        command: &str,
        args: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, QemuError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        read_greeting(&mut reader).await?;

        let capabilities = r#"{"execute": "qmp_capabilities"}"#;
        write_half
            .write_all(format!("{capabilities}\n").as_bytes())
            .await
            .map_err(|e| QemuError::Qmp(format!("Failed to send capabilities: {e}")))?;
        check_return("qmp_capabilities", next_reply(&mut reader).await?)?;

        let request = match args {
            Some(args) => serde_json::json!({ "execute": command, "arguments": args }),
            None => serde_json::json!({ "execute": command }),
        };

        write_half
            .write_all(format!("{request}\n").as_bytes())
            .await
            .map_err(|e| QemuError::Qmp(format!("Failed to send command: {e}")))?;

        check_return(command, next_reply(&mut reader).await?)
    }
}

fn check_return(
    command: &str,
    response: serde_json::Value,
) -> Result<serde_json::Value, QemuError> {
    if let Some(err) = response.get("error") {
        return Err(QemuError::Qmp(format!("{command} failed: {err}")));
    }
    Ok(response
        .get("return")
        .cloned()
        .unwrap_or(serde_json::Value::Null))
}

/// Next message that is not an asynchronous event.
async fn next_reply<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<serde_json::Value, QemuError> {
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader
            .read_line(&mut line)
            .await
            .map_err(|e| QemuError::Qmp(format!("Failed to read from monitor: {e}")))?;
        if bytes == 0 {
            return Err(QemuError::Qmp("Monitor closed the connection".into()));
        }

        let message: serde_json::Value = serde_json::from_str(&line)
            .map_err(|e| QemuError::Qmp(format!("Invalid QMP JSON: {e}")))?;
        match message.get("event") {
            Some(event) => debug!("Skipping QMP event {event}"),
            None => return Ok(message),
        }
    }
}

async fn read_greeting<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<(), QemuError> {
    let greeting = next_reply(reader).await?;
    if greeting.get("QMP").is_none() {
        return Err(QemuError::Qmp(format!("Expected QMP greeting, got {greeting}")));
    }
    Ok(())
}
