//! Session manager configuration.

use serde::{Deserialize, Serialize};

/// Tunables for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Label attached to the manager's log lines.
    #[serde(default = "default_label")]
    pub label: String,

    /// Capacity the session map is created with, and re-created with
    /// whenever it drains to empty.
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            label: default_label(),
            initial_capacity: default_initial_capacity(),
        }
    }
}

fn default_label() -> String {
    "mux".to_string()
}

fn default_initial_capacity() -> usize {
    16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.label, "mux");
        assert_eq!(cfg.initial_capacity, 16);
    }

    #[test]
    fn parse_partial_toml() {
        let cfg: ManagerConfig = toml::from_str("initial_capacity = 64").unwrap();
        assert_eq!(cfg.initial_capacity, 64);
        assert_eq!(cfg.label, "mux"); // default
    }
}
