//! Example running the xDS agent client against a discovery server.
//!
//! The processors here only log what they receive and ACK it; a real agent
//! would decode the resources and program its data plane.
//!
//! # Configuration (environment variables)
//!
//! - `XDS_ADDRESS` — discovery server address (default: `istiod.istio-system.svc:15012`)
//! - `XDS_MODE` — `ads` or `workload` (default: `workload`)
//! - `XDS_NODE_ID` — node identifier sent to the server (default: `example-agent`)
//! - `RUST_LOG` — log filter (default: `info`)
//!
//! # Usage
//!
//! ```sh
//! XDS_ADDRESS=localhost:15010 XDS_MODE=ads cargo run -p xds-agent --example agent
//! ```

use bytes::Bytes;
use envoy_types::pb::envoy::config::core::v3::Node;
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use prost::Message;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use xds_agent::{
    ClientConfig, DiscoveryProcessor, Error, Result as XdsResult, TokioRuntime, TonicConnector,
    TonicStreamFactory, XdsClient,
};

const CLUSTER_TYPE: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
const LISTENER_TYPE: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
const ADDRESS_TYPE: &str = "type.googleapis.com/istio.workload.Address";

fn node(id: &str) -> Node {
    Node {
        id: id.to_string(),
        user_agent_name: "xds-agent-example".to_string(),
        ..Default::default()
    }
}

/// Wildcard-subscribes to clusters and listeners and ACKs every response.
struct LoggingAdsProcessor {
    node_id: String,
}

impl DiscoveryProcessor for LoggingAdsProcessor {
    fn initial_requests(&self) -> Vec<Bytes> {
        [CLUSTER_TYPE, LISTENER_TYPE]
            .into_iter()
            .map(|type_url| {
                DiscoveryRequest {
                    node: Some(node(&self.node_id)),
                    type_url: type_url.to_string(),
                    ..Default::default()
                }
                .encode_to_vec()
                .into()
            })
            .collect()
    }

    fn process(&self, response: Bytes) -> XdsResult<Option<Bytes>> {
        let response =
            DiscoveryResponse::decode(response).map_err(|e| Error::Process(e.to_string()))?;
        tracing::info!(
            type_url = %response.type_url,
            version = %response.version_info,
            resources = response.resources.len(),
            "received aggregated response"
        );

        let ack = DiscoveryRequest {
            version_info: response.version_info,
            type_url: response.type_url,
            response_nonce: response.nonce,
            ..Default::default()
        };
        Ok(Some(ack.encode_to_vec().into()))
    }
}

/// Subscribes to workload addresses over the delta protocol.
struct LoggingWorkloadProcessor {
    node_id: String,
}

impl DiscoveryProcessor for LoggingWorkloadProcessor {
    fn initial_requests(&self) -> Vec<Bytes> {
        let request = DeltaDiscoveryRequest {
            node: Some(node(&self.node_id)),
            type_url: ADDRESS_TYPE.to_string(),
            ..Default::default()
        };
        vec![request.encode_to_vec().into()]
    }

    fn process(&self, response: Bytes) -> XdsResult<Option<Bytes>> {
        let response =
            DeltaDiscoveryResponse::decode(response).map_err(|e| Error::Process(e.to_string()))?;
        tracing::info!(
            type_url = %response.type_url,
            added = response.resources.len(),
            removed = response.removed_resources.len(),
            "received workload response"
        );

        let ack = DeltaDiscoveryRequest {
            type_url: response.type_url,
            response_nonce: response.nonce,
            ..Default::default()
        };
        Ok(Some(ack.encode_to_vec().into()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ClientConfig::from_env()?;
    let node_id = std::env::var("XDS_NODE_ID").unwrap_or_else(|_| "example-agent".to_string());
    tracing::info!(address = %config.server_address, mode = %config.mode, "starting agent");

    let streams = TonicStreamFactory::new(
        LoggingAdsProcessor {
            node_id: node_id.clone(),
        },
        LoggingWorkloadProcessor { node_id },
    );

    let shutdown = CancellationToken::new();
    let mut client = XdsClient::builder(config, TonicConnector::new(), streams, TokioRuntime)
        .with_cancellation_token(shutdown.clone())
        .build()?;

    tokio::select! {
        result = client.start() => result?,
        _ = tokio::signal::ctrl_c() => {
            shutdown.cancel();
            return Ok(());
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    client.stop().await;

    Ok(())
}
