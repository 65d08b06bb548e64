//! Provides abstraction for transport connections.

use crate::error::Result;
use std::future::Future;

#[cfg(feature = "transport-tonic")]
pub mod tonic;

/// Factory for transport connections to the discovery server.
///
/// This abstraction allows for different transport implementations:
/// - Tonic-based gRPC channels
/// - Mock connectors for testing
/// - Other custom transports, e.g. with agent-specific credentials
///
/// Implementations hold no per-client state. Every call dials afresh and
/// hands back a connection the caller owns exclusively; dropping it closes
/// the connection.
pub trait Connector: Send + Sync + 'static {
    /// The connection type produced by this connector.
    type Connection: Send + Sync + 'static;

    /// Connects to the discovery server at `address`.
    ///
    /// Called again for every reconnection attempt. Implementations may
    /// bound each attempt with their own timeout.
    fn connect(&self, address: &str) -> impl Future<Output = Result<Self::Connection>> + Send;
}
