//! Logging bootstrap shared by the binaries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Deployment environment; selects the log format and default level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Prod,
    Dev,
}

impl Environment {
    pub fn default_level(&self) -> &'static str {
        match self {
            Environment::Prod => "info",
            Environment::Dev => "debug",
        }
    }
}

impl FromStr for Environment {
    type Err = UnsupportedEnvironment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prod" => Ok(Environment::Prod),
            "dev" => Ok(Environment::Dev),
            other => Err(UnsupportedEnvironment(other.to_string())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Prod => f.write_str("prod"),
            Environment::Dev => f.write_str("dev"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported application environment \"{0}\"")]
pub struct UnsupportedEnvironment(pub String);

/// Install the global subscriber: JSON lines in prod, human-readable in dev.
/// `RUST_LOG` overrides the environment's default level.
pub fn init(environment: Environment) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(environment.default_level()));

    match environment {
        Environment::Prod => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        Environment::Dev => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init(),
    }
}
