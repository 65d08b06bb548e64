//! Configuration for the xDS agent client.

use std::fmt;
use std::str::FromStr;

use crate::client::retry::RetryPolicy;
use crate::error::{Error, Result};

/// Discovery server address used when `XDS_ADDRESS` is unset.
pub const DEFAULT_SERVER_ADDRESS: &str = "istiod.istio-system.svc:15012";

/// Environment variable holding the discovery server address.
pub const ENV_SERVER_ADDRESS: &str = "XDS_ADDRESS";

/// Environment variable holding the discovery mode.
pub const ENV_MODE: &str = "XDS_MODE";

/// The discovery protocol variant spoken by a client.
///
/// The two variants are mutually exclusive: a client instance only ever
/// builds streams for the mode it was configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// A single aggregated stream multiplexing every resource type.
    Aggregated,
    /// The workload-scoped stream carrying workload and identity resources.
    Workload,
}

impl Mode {
    /// Returns the canonical lowercase name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aggregated => "ads",
            Self::Workload => "workload",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ads" | "aggregated" => Ok(Self::Aggregated),
            "workload" => Ok(Self::Workload),
            other => Err(Error::Config(format!(
                "unknown mode `{other}`, expected `ads` or `workload`"
            ))),
        }
    }
}

/// Configuration for the xDS agent client.
///
/// Read once when the client is built; the mode and server address cannot
/// change for the lifetime of the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address of the discovery server, handed verbatim to the connector.
    pub server_address: String,

    /// Which discovery stream to run.
    pub mode: Mode,

    /// Retry policy for connection attempts.
    pub retry_policy: RetryPolicy,
}

impl ClientConfig {
    /// Create a new configuration with the default retry policy.
    ///
    /// # Example
    ///
    /// ```
    /// use xds_agent::{ClientConfig, Mode};
    ///
    /// let config = ClientConfig::new("http://istiod.istio-system.svc:15010", Mode::Workload);
    /// assert_eq!(config.mode, Mode::Workload);
    /// ```
    pub fn new(server_address: impl Into<String>, mode: Mode) -> Self {
        Self {
            server_address: server_address.into(),
            mode,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Build a configuration from `XDS_ADDRESS` and `XDS_MODE`.
    ///
    /// Missing variables fall back to [`DEFAULT_SERVER_ADDRESS`] and
    /// [`Mode::Workload`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_address = lookup(ENV_SERVER_ADDRESS)
            .filter(|address| !address.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_ADDRESS.to_string());
        let mode = match lookup(ENV_MODE) {
            Some(mode) => mode.parse()?,
            None => Mode::Workload,
        };

        let config = Self::new(server_address, mode);
        config.validate()?;
        Ok(config)
    }

    /// Set the retry policy.
    ///
    /// # Example
    ///
    /// ```
    /// use xds_agent::{ClientConfig, Mode, RetryPolicy};
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default()
    ///     .with_initial_backoff(Duration::from_millis(500)).unwrap()
    ///     .with_max_backoff(Duration::from_secs(60)).unwrap();
    ///
    /// let config = ClientConfig::new("localhost:15010", Mode::Aggregated)
    ///     .with_retry_policy(policy);
    /// ```
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Check that the configuration can be used to build a client.
    pub fn validate(&self) -> Result<()> {
        if self.server_address.trim().is_empty() {
            return Err(Error::Config("server address must not be empty".into()));
        }
        Ok(())
    }
}
