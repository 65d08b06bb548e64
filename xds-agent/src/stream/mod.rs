//! Discovery stream handlers and the factory that builds them.
//!
//! A [`StreamHandler`] runs one discovery cycle at a time on a stream opened
//! over a connection. Which kind of stream is opened is decided from the
//! client's [`Mode`](crate::Mode): a [`StreamFactory`] provides one
//! constructor per mode and [`ActiveHandler`] carries whichever was built.

use std::future::Future;

use bytes::Bytes;

use crate::error::Result;

#[cfg(feature = "transport-tonic")]
pub mod tonic;

/// One live discovery stream.
///
/// Each call to [`run_once`](StreamHandler::run_once) blocks until a single
/// server push has been received and processed. Any error means the stream
/// can no longer be used; the caller drops it together with its connection
/// and builds new ones.
pub trait StreamHandler: Send + 'static {
    /// Receive and process one discovery response.
    fn run_once(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Builds stream handlers bound to a connection.
///
/// Opening a stream performs the RPC handshake and fails with
/// [`Error::StreamSetup`](crate::Error::StreamSetup) if the server rejects
/// it. Implementations never retry.
pub trait StreamFactory: Send + Sync + 'static {
    /// The connection type streams are opened over.
    type Connection: Send + Sync + 'static;

    /// Handler for the aggregated discovery stream.
    type Aggregated: StreamHandler;

    /// Handler for the workload discovery stream.
    type Workload: StreamHandler;

    /// Open the aggregated stream, multiplexing all resource types.
    fn aggregated(
        &self,
        connection: &Self::Connection,
    ) -> impl Future<Output = Result<Self::Aggregated>> + Send;

    /// Open the workload-scoped stream.
    fn workload(
        &self,
        connection: &Self::Connection,
    ) -> impl Future<Output = Result<Self::Workload>> + Send;
}

/// The handler built for the client's mode.
#[derive(Debug)]
pub enum ActiveHandler<A, W> {
    /// Handler of an aggregated stream.
    Aggregated(A),
    /// Handler of a workload stream.
    Workload(W),
}

impl<A, W> StreamHandler for ActiveHandler<A, W>
where
    A: StreamHandler,
    W: StreamHandler,
{
    async fn run_once(&mut self) -> Result<()> {
        match self {
            Self::Aggregated(handler) => handler.run_once().await,
            Self::Workload(handler) => handler.run_once().await,
        }
    }
}

/// Decodes server pushes and applies them to local state.
///
/// This is the boundary to the wire encoding of discovery messages: the
/// stream hands over raw response bytes and sends back whatever
/// acknowledgement the processor encodes.
pub trait DiscoveryProcessor: Send + Sync + 'static {
    /// Serialized requests sent as soon as the stream opens.
    ///
    /// Servers commonly hold back response headers until the first request,
    /// so this should subscribe to at least one resource type.
    fn initial_requests(&self) -> Vec<Bytes>;

    /// Process one serialized response.
    ///
    /// Returns the serialized acknowledgement to send, if any. An error is
    /// treated as a protocol violation and tears the stream down.
    fn process(&self, response: Bytes) -> Result<Option<Bytes>>;
}
