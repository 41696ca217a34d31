use serde::Serialize;

/// The result of a health check, possibly with results of its parts.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<HealthCheckResult>,
}

impl HealthCheckResult {
    pub fn new(name: impl Into<String>, healthy: bool) -> Self {
        HealthCheckResult {
            name: name.into(),
            healthy,
            children: vec![],
        }
    }

    /// A result that is healthy when all children are.
    pub fn with_children(name: impl Into<String>, children: Vec<HealthCheckResult>) -> Self {
        HealthCheckResult {
            name: name.into(),
            healthy: children.iter().all(|c| c.healthy),
            children,
        }
    }
}
