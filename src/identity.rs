//! Who is doing the work. Recorded in audit trails only; never used for
//! correctness decisions.

use serde::{Deserialize, Serialize};

/// User and machine names stamped on lock markers, ledger entries and sync metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Operator name.
    pub user: String,
    /// Host name.
    pub machine: String,
}

impl Identity {
    /// Build an identity from explicit names.
    pub fn new(user: impl Into<String>, machine: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            machine: machine.into(),
        }
    }

    /// Detect the current user and machine from the process environment.
    #[must_use]
    pub fn detect() -> Self {
        Self {
            user: first_env(&["USER", "USERNAME", "LOGNAME"]),
            machine: first_env(&["HOSTNAME", "COMPUTERNAME"]),
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::detect()
    }
}

fn first_env(keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .map_or_else(|| "unknown".to_string(), |value| value)
}
