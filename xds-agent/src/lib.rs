//! The discovery-protocol client of a service-mesh data-plane agent.
//!
//! This crate keeps a long-lived xDS stream to the control plane alive for
//! the lifetime of the agent. It handles:
//! - Connecting to the discovery server with unbounded, backed-off retries
//! - Opening the stream for the configured [`Mode`] (aggregated or workload)
//! - Running the receive/process loop and rebuilding connection and stream
//!   after any failure
//! - Prompt, cooperative shutdown
//!
//! It does NOT contain:
//! - The wire encoding of discovery messages
//! - Resource semantics such as version/nonce bookkeeping
//! - Applying pushed configuration to the data plane
//!
//! Those live behind [`DiscoveryProcessor`] (or a custom [`StreamFactory`]).
//!
//! # Example
//!
//! ```ignore
//! use xds_agent::{ClientConfig, TokioRuntime, TonicConnector, TonicStreamFactory, XdsClient};
//!
//! let config = ClientConfig::from_env()?;
//! let streams = TonicStreamFactory::new(ads_processor, workload_processor);
//! let mut client = XdsClient::builder(config, TonicConnector::new(), streams, TokioRuntime)
//!     .with_cancellation_token(shutdown.clone())
//!     .build()?;
//!
//! // Fails only if the first stream cannot be opened.
//! client.start().await?;
//!
//! shutdown.cancelled().await;
//! client.stop().await;
//! ```
//!
//! # Feature Flags
//!
//! - `transport-tonic`: Enables the `tonic` connector and streams. This enables the `rt-tokio` feature. Enabled by default.
//! - `rt-tokio`: Enables the use of the `tokio` runtime.
//! - `tonic-tls-ring` / `tonic-tls-aws-lc`: Enables TLS for the `tonic` connector.

pub mod client;
pub mod error;
pub mod runtime;
pub mod stream;
pub mod transport;

pub use client::config::{ClientConfig, Mode};
pub use client::retry::{Backoff, RetryPolicy};
pub use client::{ConnectionState, XdsClient, XdsClientBuilder};
pub use error::{Error, Result};
pub use runtime::Runtime;
pub use stream::{ActiveHandler, DiscoveryProcessor, StreamFactory, StreamHandler};
pub use transport::Connector;

// Tokio runtime
#[cfg(feature = "rt-tokio")]
pub use runtime::tokio::TokioRuntime;

// Tonic transport
#[cfg(feature = "transport-tonic")]
pub use stream::tonic::{GrpcStream, TonicStreamFactory};
#[cfg(feature = "transport-tonic")]
pub use transport::tonic::TonicConnector;
