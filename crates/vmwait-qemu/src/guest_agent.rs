use crate::QemuError;
use base64::Engine as _;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use vmwait_core::{CommandOutput, GuestCommand};

pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30);
const EXEC_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GuestInterface {
    pub name: String,
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<GuestIpAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GuestIpAddress {
    #[serde(rename = "ip-address")]
    pub ip_address: String,
    #[serde(rename = "ip-address-type")]
    pub ip_address_type: String,
    #[serde(default)]
    pub prefix: u8,
}

#[derive(Debug, Deserialize)]
struct ExecStarted {
    pid: i64,
}

#[derive(Debug, Deserialize)]
struct ExecStatus {
    exited: bool,
    #[serde(default)]
    exitcode: Option<i32>,
    #[serde(default)]
    signal: Option<i32>,
    #[serde(rename = "out-data", default)]
    out_data: Option<String>,
    #[serde(rename = "err-data", default)]
    err_data: Option<String>,
}

/// First routable address reported by the guest, IPv4 preferred.
#[must_use]
pub fn select_guest_ip(interfaces: &[GuestInterface]) -> Option<IpAddr> {
    let candidates: Vec<IpAddr> = interfaces
        .iter()
        .flat_map(|iface| &iface.ip_addresses)
        .filter_map(|addr| addr.ip_address.parse::<IpAddr>().ok())
        .filter(|ip| match ip {
            IpAddr::V4(v4) => !(v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()),
            IpAddr::V6(v6) => {
                !(v6.is_loopback() || v6.is_unicast_link_local() || v6.is_unspecified())
            }
        })
        .collect();

    candidates
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
}

/// Client for qemu-guest-agent on its host-side chardev socket.
#[derive(Debug, Clone)]
pub struct GuestAgentClient {
    socket: PathBuf,
    timeout: Duration,
}

impl GuestAgentClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Network interfaces as seen by the guest.
    ///
    /// # Errors
    /// Returns `QemuError::GuestAgent` if the agent is unreachable or answers
    /// with an error.
    pub async fn network_interfaces(&self) -> Result<Vec<GuestInterface>, QemuError> {
        let mut session = self.open().await?;
        let value = session.execute("guest-network-get-interfaces", None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Run a command in the guest and wait for it to exit.
    ///
    /// # Errors
    /// Returns `QemuError::GuestAgent` if the command cannot be started or
    /// its status cannot be read, and `QemuError::Timeout` if it does not
    /// finish within the client timeout.
    pub async fn exec(&self, command: &GuestCommand) -> Result<CommandOutput, QemuError> {
        let mut session = self.open().await?;
        let started: ExecStarted = serde_json::from_value(
            session
                .execute(
                    "guest-exec",
                    Some(serde_json::json!({
                        "path": command.program,
                        "arg": command.args,
                        "capture-output": true,
                    })),
                )
                .await?,
        )?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let status: ExecStatus = serde_json::from_value(
                session
                    .execute(
                        "guest-exec-status",
                        Some(serde_json::json!({ "pid": started.pid })),
                    )
                    .await?,
            )?;

            if status.exited {
                return Ok(CommandOutput {
                    exit_code: status
                        .exitcode
                        .or(status.signal.map(|s| 128 + s))
                        .unwrap_or(-1),
                    stdout: decode_output(status.out_data.as_deref())?,
                    stderr: decode_output(status.err_data.as_deref())?,
                });
            }

            if Instant::now() >= deadline {
                return Err(QemuError::Timeout(format!(
                    "guest command '{}' (pid {})",
                    command.program, started.pid
                )));
            }

            tokio::time::sleep(EXEC_STATUS_POLL_INTERVAL).await;
        }
    }

    async fn open(&self) -> Result<AgentSession, QemuError> {
        let stream = timeout(self.timeout, UnixStream::connect(&self.socket))
            .await
            .map_err(|_| QemuError::Timeout("guest agent connect".into()))?
            .map_err(|e| QemuError::GuestAgent(format!("Failed to connect to socket: {e}")))?;

        let (read_half, write_half) = stream.into_split();
        let mut session = AgentSession {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout: self.timeout,
        };
        session.sync().await?;
        Ok(session)
    }
}

fn decode_output(data: Option<&str>) -> Result<String, QemuError> {
    let Some(data) = data else {
        return Ok(String::new());
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| QemuError::GuestAgent(format!("Invalid base64 output: {e}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

struct AgentSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl AgentSession {
    /// Discard anything a previous client left unread.
    async fn sync(&mut self) -> Result<(), QemuError> {
        let id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64 & 0x7fff_ffff)
            .unwrap_or(1);
        self.send("guest-sync", Some(serde_json::json!({ "id": id })))
            .await?;

        loop {
            let response = self.read_response().await?;
            if response.get("return").and_then(serde_json::Value::as_u64) == Some(id) {
                return Ok(());
            }
        }
    }

    async fn execute(
        &mut self,
        command: &str,
        args: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, QemuError> {
        self.send(command, args).await?;
        let response = self.read_response().await?;
        if let Some(err) = response.get("error") {
            return Err(QemuError::GuestAgent(format!("{command} failed: {err}")));
        }
        Ok(response
            .get("return")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn send(
        &mut self,
        command: &str,
        args: Option<serde_json::Value>,
    ) -> Result<(), QemuError> {
        let request = match args {
            Some(args) => serde_json::json!({ "execute": command, "arguments": args }),
            None => serde_json::json!({ "execute": command }),
        };

        self.writer
            .write_all(format!("{request}\n").as_bytes())
            .await
            .map_err(|e| QemuError::GuestAgent(format!("Failed to send request: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| QemuError::GuestAgent(format!("Failed to flush: {e}")))
    }

    async fn read_response(&mut self) -> Result<serde_json::Value, QemuError> {
        loop {
            let mut line = String::new();
            let bytes = timeout(self.timeout, self.reader.read_line(&mut line))
                .await
                .map_err(|_| QemuError::Timeout("Guest agent response timeout".into()))?
                .map_err(|e| QemuError::GuestAgent(format!("Failed to read response: {e}")))?;

            if bytes == 0 {
                return Err(QemuError::GuestAgent(
                    "Unexpected EOF reading agent response".into(),
                ));
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return Ok(serde_json::from_str(line)?);
        }
    }
}
