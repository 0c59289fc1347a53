//! Deployment environments.
//!
//! The environment keys the credential cache: every environment gets its own
//! record so that a `dev` and a `prod` cluster never share unseal keys.

use std::fmt;
use std::str::FromStr;

/// A deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    /// All known environments, in promotion order.
    pub const ALL: [Self; 3] = [Self::Development, Self::Staging, Self::Production];

    /// Short name used on the command line and in cache paths.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "dev",
            Self::Staging => "stage",
            Self::Production => "prod",
        }
    }

    #[must_use]
    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown environment name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid environment '{0}' (expected one of: dev, stage, prod)")]
pub struct ParseEnvironmentError(String);

impl FromStr for Environment {
    type Err = ParseEnvironmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Development),
            "stage" | "staging" => Ok(Self::Staging),
            "prod" | "production" => Ok(Self::Production),
            _ => Err(ParseEnvironmentError(s.to_owned())),
        }
    }
}
