use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const ROLE_ENV: &str = "AGENT_ROLE";
pub const NAME_ENV: &str = "AGENT_ID";

const FALLBACK_NAME: &str = "drone-unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Queen,
    #[default]
    Worker,
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queen" => Ok(Self::Queen),
            "worker" | "drone" => Ok(Self::Worker),
            other => Err(format!("unknown agent role: {}", other)),
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queen => write!(f, "queen"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Who this process is inside the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub role: AgentRole,
    pub name: String,
}

impl AgentIdentity {
    pub fn new(role: AgentRole, name: impl Into<String>) -> Self {
        Self {
            role,
            name: name.into(),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Role defaults to worker (an unknown value is logged and treated the
    /// same); name defaults to the host name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let role = match lookup(ROLE_ENV) {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!("{}; defaulting to worker", e);
                AgentRole::Worker
            }),
            None => AgentRole::Worker,
        };

        let name = lookup(NAME_ENV)
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .or_else(host_name)
            .unwrap_or_else(|| FALLBACK_NAME.to_string());

        Self { role, name }
    }

    pub fn is_queen(&self) -> bool {
        self.role == AgentRole::Queen
    }
}

fn host_name() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_explicit_identity() {
        let identity =
            AgentIdentity::from_lookup(lookup_from(&[("AGENT_ROLE", "queen"), ("AGENT_ID", "queen")]));
        assert_eq!(identity, AgentIdentity::new(AgentRole::Queen, "queen"));
        assert!(identity.is_queen());
    }

    #[test]
    fn test_defaults_to_worker_with_host_name() {
        let identity = AgentIdentity::from_lookup(lookup_from(&[]));
        assert_eq!(identity.role, AgentRole::Worker);
        assert!(!identity.name.is_empty());
    }

    #[test]
    fn test_unknown_role_falls_back_to_worker() {
        let identity = AgentIdentity::from_lookup(lookup_from(&[
            ("AGENT_ROLE", "overlord"),
            ("AGENT_ID", "drone-3"),
        ]));
        assert_eq!(identity.role, AgentRole::Worker);
        assert_eq!(identity.name, "drone-3");
    }
}
