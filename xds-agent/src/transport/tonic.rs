//! `tonic` based connector implementation.

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

#[cfg(any(feature = "tonic-tls-ring", feature = "tonic-tls-aws-lc"))]
use tonic::transport::ClientTlsConfig;

use crate::error::{Error, Result};
use crate::transport::Connector;

/// Default bound on a single connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connector producing tonic [`Channel`]s.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use xds_agent::TonicConnector;
///
/// let connector = TonicConnector::new().with_connect_timeout(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct TonicConnector {
    connect_timeout: Duration,
    #[cfg(any(feature = "tonic-tls-ring", feature = "tonic-tls-aws-lc"))]
    tls: Option<ClientTlsConfig>,
}

impl Default for TonicConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            #[cfg(any(feature = "tonic-tls-ring", feature = "tonic-tls-aws-lc"))]
            tls: None,
        }
    }
}

impl TonicConnector {
    /// Create a connector with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout applied to each connection attempt.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Use TLS for every connection.
    ///
    /// Addresses given without a scheme are then dialled as `https://`.
    #[cfg(any(feature = "tonic-tls-ring", feature = "tonic-tls-aws-lc"))]
    pub fn with_tls_config(mut self, tls: ClientTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    fn uses_tls(&self) -> bool {
        #[cfg(any(feature = "tonic-tls-ring", feature = "tonic-tls-aws-lc"))]
        {
            self.tls.is_some()
        }
        #[cfg(not(any(feature = "tonic-tls-ring", feature = "tonic-tls-aws-lc")))]
        {
            false
        }
    }

    /// Turns a configured address into a full URI.
    ///
    /// Mesh agents are usually configured with a bare `host:port`.
    fn uri_for(&self, address: &str) -> String {
        let address = address.trim();
        if address.contains("://") {
            address.to_string()
        } else if self.uses_tls() {
            format!("https://{address}")
        } else {
            format!("http://{address}")
        }
    }

    fn endpoint(&self, address: &str) -> Result<Endpoint> {
        let endpoint = Endpoint::from_shared(self.uri_for(address))
            .map_err(|e| Error::Connect(e.to_string()))?
            .connect_timeout(self.connect_timeout);

        if endpoint.uri().host().is_none() {
            return Err(Error::Connect(format!("no host in address `{address}`")));
        }

        #[cfg(any(feature = "tonic-tls-ring", feature = "tonic-tls-aws-lc"))]
        let endpoint = match &self.tls {
            Some(tls) => endpoint
                .tls_config(tls.clone())
                .map_err(|e| Error::Connect(e.to_string()))?,
            None => endpoint,
        };

        Ok(endpoint)
    }
}

impl Connector for TonicConnector {
    type Connection = Channel;

    async fn connect(&self, address: &str) -> Result<Channel> {
        self.endpoint(address)?
            .connect()
            .await
            .map_err(|e| Error::Connect(format!("{address}: {e}")))
    }
}
