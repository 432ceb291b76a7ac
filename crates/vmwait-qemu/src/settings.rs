use crate::QemuError;
use std::path::{Path, PathBuf};
use vmwait_core::ProbePolicy;

/// User defaults read from `settings.hcl`. Every field is optional; command
/// line flags take precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub poll_interval: Option<u64>,
    pub timeout: Option<u64>,
    pub customization_marker: Option<String>,
    pub probe_policy: Option<ProbePolicy>,
    pub default_server: Option<String>,
    pub servers_dir: Option<PathBuf>,
    /// Seconds to wait for one QMP command.
    pub qmp_timeout: Option<u64>,
    /// Seconds to wait for one guest agent request.
    pub agent_timeout: Option<u64>,
}

impl Settings {
    /// Load settings from `path`; a missing file yields the defaults.
    ///
    /// # Errors
    /// Returns `QemuError` if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, QemuError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse settings from HCL source.
    ///
    /// # Errors
    /// Returns `QemuError::Settings` for malformed HCL, unknown attributes,
    /// or values of the wrong type.
    pub fn parse(content: &str) -> Result<Self, QemuError> {
        let body: hcl::Body =
            hcl::from_str(content).map_err(|e| QemuError::Settings(e.to_string()))?;

        if let Some(block) = body.blocks().next() {
            return Err(QemuError::Settings(format!(
                "unexpected block '{}'",
                block.identifier
            )));
        }

        let mut settings = Self::default();
        for attr in body.attributes() {
            match attr.key.as_str() {
                "poll_interval" => settings.poll_interval = Some(extract_u64(&attr.expr)?),
                "timeout" => settings.timeout = Some(extract_u64(&attr.expr)?),
                "customization_marker" => {
                    settings.customization_marker = Some(extract_string(&attr.expr)?);
                }
                "probe_policy" => {
                    settings.probe_policy = Some(parse_probe_policy(&extract_string(&attr.expr)?)?);
                }
                "default_server" => settings.default_server = Some(extract_string(&attr.expr)?),
                "servers_dir" => {
                    settings.servers_dir = Some(PathBuf::from(extract_string(&attr.expr)?));
                }
                "qmp_timeout" => settings.qmp_timeout = Some(extract_u64(&attr.expr)?),
                "agent_timeout" => settings.agent_timeout = Some(extract_u64(&attr.expr)?),
                other => {
                    return Err(QemuError::Settings(format!("unknown setting '{other}'")));
                }
            }
        }

        Ok(settings)
    }
}

fn parse_probe_policy(value: &str) -> Result<ProbePolicy, QemuError> {
    match value {
        "retry" => Ok(ProbePolicy::Retry),
        "escalate" => Ok(ProbePolicy::Escalate),
        other => Err(QemuError::Settings(format!(
            "probe_policy must be \"retry\" or \"escalate\", got \"{other}\""
        ))),
    }
}

fn extract_string(expr: &hcl::Expression) -> Result<String, QemuError> {
    match expr {
        hcl::Expression::String(s) => Ok(s.clone()),
        hcl::Expression::TemplateExpr(t) => Ok(t.to_string().trim_matches('"').to_string()),
        _ => Err(QemuError::Settings(format!("Expected string, got {expr:?}"))),
    }
}

fn extract_u64(expr: &hcl::Expression) -> Result<u64, QemuError> {
    match expr {
        hcl::Expression::Number(n) => n
            .as_u64()
            .ok_or_else(|| QemuError::Settings(format!("Invalid number {n}"))),
        _ => Err(QemuError::Settings(format!("Expected number, got {expr:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_settings() {
        let hcl = r#"
poll_interval        = 10
timeout              = 900
customization_marker = "/etc/firstboot.done"
probe_policy         = "escalate"
default_server       = "vc1"
servers_dir          = "/srv/vmwait/servers"
qmp_timeout          = 3
agent_timeout        = 45
"#;

        let settings = Settings::parse(hcl).unwrap();
        assert_eq!(settings.poll_interval, Some(10));
        assert_eq!(settings.timeout, Some(900));
        assert_eq!(
            settings.customization_marker.as_deref(),
            Some("/etc/firstboot.done")
        );
        assert_eq!(settings.probe_policy, Some(ProbePolicy::Escalate));
        assert_eq!(settings.default_server.as_deref(), Some("vc1"));
        assert_eq!(
            settings.servers_dir,
            Some(PathBuf::from("/srv/vmwait/servers"))
        );
        assert_eq!(settings.qmp_timeout, Some(3));
        assert_eq!(settings.agent_timeout, Some(45));
    }

    #[test]
    fn test_rejects_unknown_and_mistyped_settings() {
        assert!(matches!(
            Settings::parse("poll = 5"),
            Err(QemuError::Settings(msg)) if msg.contains("poll")
        ));
        assert!(Settings::parse("poll_interval = \"five\"").is_err());
        assert!(Settings::parse("probe_policy = \"ignore\"").is_err());
        assert!(Settings::parse("server \"vc1\" {}").is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("settings.hcl")).unwrap();
        assert_eq!(settings, Settings::default());

        let path = dir.path().join("settings.hcl");
        std::fs::write(&path, "poll_interval = 2\n").unwrap();
        assert_eq!(Settings::load(&path).unwrap().poll_interval, Some(2));
    }
}
