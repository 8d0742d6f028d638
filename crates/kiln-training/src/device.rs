use serde::{Deserialize, Serialize};

/// Identifier of a compute device (e.g. `gpu0`, `cpu0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Accelerator,
    Cpu,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accelerator => f.write_str("accelerator"),
            Self::Cpu => f.write_str("cpu"),
        }
    }
}

/// A device a job can be bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub kind: DeviceKind,
}

impl Device {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: DeviceKind) -> Self {
        Self { id: DeviceId(id.into()), kind }
    }
}

/// Which devices a workload accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "kind", rename_all = "snake_case")]
pub enum DevicePolicy {
    /// Only devices of this kind.
    Require(DeviceKind),
    /// This kind first, any free device otherwise.
    Prefer(DeviceKind),
}

impl DevicePolicy {
    #[must_use]
    pub fn accepts(self, kind: DeviceKind) -> bool {
        match self {
            Self::Require(k) => k == kind,
            Self::Prefer(_) => true,
        }
    }

    #[must_use]
    pub fn preferred(self) -> DeviceKind {
        match self {
            Self::Require(k) | Self::Prefer(k) => k,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_accepts() {
        let require = DevicePolicy::Require(DeviceKind::Accelerator);
        assert!(require.accepts(DeviceKind::Accelerator));
        assert!(!require.accepts(DeviceKind::Cpu));

        let prefer = DevicePolicy::Prefer(DeviceKind::Accelerator);
        assert!(prefer.accepts(DeviceKind::Cpu));
        assert_eq!(prefer.preferred(), DeviceKind::Accelerator);
    }
}
