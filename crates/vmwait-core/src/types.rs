use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

pub const MIN_POLL_INTERVAL_SECS: u64 = 1;
pub const MAX_POLL_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
    Unknown,
}

impl PowerState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            PowerState::PoweredOn => "PoweredOn",
            PowerState::PoweredOff => "PoweredOff",
            PowerState::Suspended => "Suspended",
            PowerState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Reference to one VM on one control-plane server.
///
/// Two identities are equal when their remote ids match; names are only
/// labels and may repeat across VMs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmIdentity {
    pub id: String,
    pub name: String,
    pub server: String,
}

impl VmIdentity {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            server: server.into(),
        }
    }

    /// Handle string accepted by `Inventory::resolve_by_handle`.
    #[must_use]
    pub fn handle(&self) -> String {
        format!("{}/{}", self.server, self.id)
    }
}

impl PartialEq for VmIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for VmIdentity {}

impl Hash for VmIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.name, self.server, self.id)
    }
}

/// Extra conditions checked once the target power state holds.
///
/// Variant order is the evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxCondition {
    GuestIpAssigned,
    GuestCustomizationComplete,
}

impl AuxCondition {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            AuxCondition::GuestIpAssigned => "guest IP assigned",
            AuxCondition::GuestCustomizationComplete => "guest customization complete",
        }
    }
}

impl fmt::Display for AuxCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollInterval(Duration);

impl PollInterval {
    /// Build an interval of `secs` seconds.
    ///
    /// # Errors
    /// Returns `CoreError::InvalidInterval` unless `secs` is within 1..=3600.
    pub fn from_secs(secs: u64) -> Result<Self, CoreError> {
        if (MIN_POLL_INTERVAL_SECS..=MAX_POLL_INTERVAL_SECS).contains(&secs) {
            Ok(Self(Duration::from_secs(secs)))
        } else {
            Err(CoreError::InvalidInterval(secs))
        }
    }

    #[must_use]
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for PollInterval {
    fn default() -> Self {
        Self(Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS))
    }
}

/// Upper bound on how long a wait may keep polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitLimit {
    #[default]
    Unbounded,
    Duration(Duration),
    Polls(u32),
}

/// What to do when a guest probe reports a hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbePolicy {
    /// Treat the failure as "not yet" and poll again after one interval.
    #[default]
    Retry,
    /// Abort the wait with `CoreError::Probe`.
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitSpec {
    target: PowerState,
    interval: PollInterval,
    conditions: BTreeSet<AuxCondition>,
    limit: WaitLimit,
    probe_policy: ProbePolicy,
}

impl WaitSpec {
    #[must_use]
    pub fn new(target: PowerState, interval: PollInterval) -> Self {
        Self {
            target,
            interval,
            conditions: BTreeSet::new(),
            limit: WaitLimit::Unbounded,
            probe_policy: ProbePolicy::Retry,
        }
    }

    #[must_use]
    pub fn with_condition(mut self, condition: AuxCondition) -> Self {
        self.conditions.insert(condition);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: WaitLimit) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn with_probe_policy(mut self, policy: ProbePolicy) -> Self {
        self.probe_policy = policy;
        self
    }

    /// Check that the requested conditions make sense for the target state.
    ///
    /// # Errors
    /// Returns `CoreError::InvalidSpec` when guest conditions are requested
    /// for a target other than `PoweredOn`, or when the target is `Unknown`.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.target == PowerState::Unknown {
            return Err(CoreError::InvalidSpec(
                "Unknown is not a valid target state".into(),
            ));
        }
        if !self.conditions.is_empty() && self.target != PowerState::PoweredOn {
            return Err(CoreError::InvalidSpec(format!(
                "guest conditions require target PoweredOn, got {}",
                self.target
            )));
        }
        if self.limit == WaitLimit::Polls(0) {
            return Err(CoreError::InvalidSpec("poll limit must be positive".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn target(&self) -> PowerState {
        self.target
    }

    #[must_use]
    pub fn interval(&self) -> PollInterval {
        self.interval
    }

    #[must_use]
    pub fn conditions(&self) -> &BTreeSet<AuxCondition> {
        &self.conditions
    }

    #[must_use]
    pub fn limit(&self) -> WaitLimit {
        self.limit
    }

    #[must_use]
    pub fn probe_policy(&self) -> ProbePolicy {
        self.probe_policy
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitOutcome {
    pub final_state: PowerState,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    pub polls: u32,
    pub satisfied: BTreeSet<AuxCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_ip: Option<String>,
    pub vm: VmIdentity,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
