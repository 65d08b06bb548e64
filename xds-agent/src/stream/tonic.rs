//! `tonic` based discovery streams.
//!
//! Streams use tonic's low-level `Grpc` client with a `BytesCodec` to send
//! and receive raw bytes, leaving the encoding of discovery messages to the
//! [`DiscoveryProcessor`].

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::Channel;
use tonic::{Status, Streaming};

use crate::error::{Error, Result};
use crate::stream::{DiscoveryProcessor, StreamFactory, StreamHandler};

/// The gRPC path for the ADS StreamAggregatedResources RPC.
pub const ADS_PATH: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";

/// The gRPC path of the delta RPC carrying workload resources.
pub const WORKLOAD_PATH: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/DeltaAggregatedResources";

const REQUEST_CHANNEL_BUFFER_SIZE: usize = 16;

/// A codec that passes bytes through without serialization.
#[derive(Debug, Clone, Copy)]
struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesEncoder;
    type Decoder = BytesDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        BytesEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesDecoder
    }
}

#[derive(Debug)]
struct BytesEncoder;

impl Encoder for BytesEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> std::result::Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

#[derive(Debug)]
struct BytesDecoder;

impl Decoder for BytesDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

/// Opens discovery streams over a tonic [`Channel`].
///
/// Holds one processor per mode; only the one matching the client's mode
/// is ever used.
///
/// # Example
///
/// ```ignore
/// let streams = TonicStreamFactory::new(AdsProcessor::new(), WorkloadProcessor::new());
/// let client = XdsClient::builder(config, TonicConnector::new(), streams, TokioRuntime).build()?;
/// ```
#[derive(Debug)]
pub struct TonicStreamFactory<A, W> {
    aggregated: Arc<A>,
    workload: Arc<W>,
}

impl<A, W> TonicStreamFactory<A, W>
where
    A: DiscoveryProcessor,
    W: DiscoveryProcessor,
{
    /// Create a factory from the processors of both modes.
    pub fn new(aggregated: A, workload: W) -> Self {
        Self {
            aggregated: Arc::new(aggregated),
            workload: Arc::new(workload),
        }
    }
}

impl<A, W> StreamFactory for TonicStreamFactory<A, W>
where
    A: DiscoveryProcessor,
    W: DiscoveryProcessor,
{
    type Connection = Channel;
    type Aggregated = GrpcStream<A>;
    type Workload = GrpcStream<W>;

    async fn aggregated(&self, connection: &Channel) -> Result<GrpcStream<A>> {
        GrpcStream::open(connection, ADS_PATH, Arc::clone(&self.aggregated)).await
    }

    async fn workload(&self, connection: &Channel) -> Result<GrpcStream<W>> {
        GrpcStream::open(connection, WORKLOAD_PATH, Arc::clone(&self.workload)).await
    }
}

/// A bidirectional discovery stream backed by tonic.
#[derive(Debug)]
pub struct GrpcStream<P> {
    sender: mpsc::Sender<Bytes>,
    receiver: Streaming<Bytes>,
    processor: Arc<P>,
}

impl<P: DiscoveryProcessor> GrpcStream<P> {
    /// Open a streaming RPC at `path` over `channel`.
    pub async fn open(channel: &Channel, path: &'static str, processor: Arc<P>) -> Result<Self> {
        let mut grpc = Grpc::new(channel.clone());

        grpc.ready()
            .await
            .map_err(|e| Error::StreamSetup(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Bytes>(REQUEST_CHANNEL_BUFFER_SIZE);

        // Initial requests go first so data is available as soon as the
        // request stream is polled: some servers withhold response headers
        // until they see the first message.
        let initial_stream = tokio_stream::iter(processor.initial_requests());
        let channel_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let request_stream = initial_stream.chain(channel_stream);

        let response = grpc
            .streaming(
                tonic::Request::new(request_stream),
                PathAndQuery::from_static(path),
                BytesCodec,
            )
            .await
            .map_err(|status| Error::StreamSetup(status.to_string()))?;

        Ok(Self {
            sender: tx,
            receiver: response.into_inner(),
            processor,
        })
    }
}

impl<P: DiscoveryProcessor> StreamHandler for GrpcStream<P> {
    async fn run_once(&mut self) -> Result<()> {
        let response = match self.receiver.message().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Err(Error::StreamClosed),
            Err(status) => return Err(Error::Stream(status.to_string())),
        };

        if let Some(ack) = self.processor.process(response)? {
            self.sender
                .send(ack)
                .await
                .map_err(|_| Error::StreamClosed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::service::discovery::v3::{
        aggregated_discovery_service_server::{
            AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
        },
        DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    };
    use prost::Message;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;
    use tokio_stream::Stream;
    use tonic::{Request, Response};

    const LISTENER_TYPE: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
    const ADDRESS_TYPE: &str = "type.googleapis.com/istio.workload.Address";

    /// Mock server answering every request on either RPC with one response.
    ///
    /// The SotW stream ends after `sotw_limit` responses.
    struct MockDiscoveryServer {
        sotw_limit: usize,
    }

    #[tonic::async_trait]
    impl AggregatedDiscoveryService for MockDiscoveryServer {
        type StreamAggregatedResourcesStream =
            Pin<Box<dyn Stream<Item = std::result::Result<DiscoveryResponse, Status>> + Send>>;

        async fn stream_aggregated_resources(
            &self,
            request: Request<tonic::Streaming<DiscoveryRequest>>,
        ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
            let mut inbound = request.into_inner();
            let limit = self.sotw_limit;

            let outbound = async_stream::try_stream! {
                let mut sent = 0;
                while let Some(req) = inbound.next().await {
                    let req = req?;
                    if sent == limit {
                        break;
                    }
                    sent += 1;
                    yield DiscoveryResponse {
                        version_info: req.version_info.clone() + "1",
                        type_url: req.type_url.clone(),
                        nonce: format!("nonce-{sent}"),
                        ..Default::default()
                    };
                }
            };

            Ok(Response::new(Box::pin(outbound)))
        }

        type DeltaAggregatedResourcesStream =
            Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

        async fn delta_aggregated_resources(
            &self,
            request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
        ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
            let mut inbound = request.into_inner();

            let outbound = async_stream::try_stream! {
                while let Some(req) = inbound.next().await {
                    let req = req?;
                    yield DeltaDiscoveryResponse {
                        type_url: req.type_url.clone(),
                        nonce: "delta-nonce".to_string(),
                        ..Default::default()
                    };
                }
            };

            Ok(Response::new(Box::pin(outbound)))
        }
    }

    async fn start_mock_server(sotw_limit: usize) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(AggregatedDiscoveryServiceServer::new(MockDiscoveryServer {
                    sotw_limit,
                }))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        addr
    }

    async fn connect(addr: SocketAddr) -> Channel {
        Channel::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
            .unwrap()
    }

    /// Subscribes to listeners and ACKs every response it sees.
    #[derive(Default)]
    struct AckingProcessor {
        nonces: Mutex<Vec<String>>,
    }

    impl DiscoveryProcessor for AckingProcessor {
        fn initial_requests(&self) -> Vec<Bytes> {
            let request = DiscoveryRequest {
                type_url: LISTENER_TYPE.to_string(),
                ..Default::default()
            };
            vec![request.encode_to_vec().into()]
        }

        fn process(&self, response: Bytes) -> Result<Option<Bytes>> {
            let response =
                DiscoveryResponse::decode(response).map_err(|e| Error::Process(e.to_string()))?;
            self.nonces.lock().unwrap().push(response.nonce.clone());

            let ack = DiscoveryRequest {
                version_info: response.version_info,
                type_url: response.type_url,
                response_nonce: response.nonce,
                ..Default::default()
            };
            Ok(Some(ack.encode_to_vec().into()))
        }
    }

    /// Subscribes to workload addresses and never ACKs.
    #[derive(Default)]
    struct DeltaProcessor {
        seen: Mutex<Vec<String>>,
    }

    impl DiscoveryProcessor for DeltaProcessor {
        fn initial_requests(&self) -> Vec<Bytes> {
            let request = DeltaDiscoveryRequest {
                type_url: ADDRESS_TYPE.to_string(),
                ..Default::default()
            };
            vec![request.encode_to_vec().into()]
        }

        fn process(&self, response: Bytes) -> Result<Option<Bytes>> {
            let response = DeltaDiscoveryResponse::decode(response)
                .map_err(|e| Error::Process(e.to_string()))?;
            self.seen.lock().unwrap().push(response.type_url);
            Ok(None)
        }
    }

    /// Rejects everything the server pushes.
    struct RejectingProcessor;

    impl DiscoveryProcessor for RejectingProcessor {
        fn initial_requests(&self) -> Vec<Bytes> {
            AckingProcessor::default().initial_requests()
        }

        fn process(&self, _response: Bytes) -> Result<Option<Bytes>> {
            Err(Error::Process("unexpected resource".into()))
        }
    }

    #[tokio::test]
    async fn test_aggregated_stream_processes_and_acks() {
        let addr = start_mock_server(usize::MAX).await;
        let channel = connect(addr).await;
        let factory = TonicStreamFactory::new(AckingProcessor::default(), DeltaProcessor::default());

        let mut stream = factory.aggregated(&channel).await.unwrap();

        // The first response answers the initial request, the second one
        // answers the ACK sent after processing the first.
        stream.run_once().await.unwrap();
        stream.run_once().await.unwrap();

        let nonces = factory.aggregated.nonces.lock().unwrap().clone();
        assert_eq!(nonces, vec!["nonce-1".to_string(), "nonce-2".to_string()]);
        assert!(factory.workload.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_workload_stream_uses_delta_rpc() {
        let addr = start_mock_server(usize::MAX).await;
        let channel = connect(addr).await;
        let factory = TonicStreamFactory::new(AckingProcessor::default(), DeltaProcessor::default());

        let mut stream = factory.workload(&channel).await.unwrap();
        stream.run_once().await.unwrap();

        let seen = factory.workload.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![ADDRESS_TYPE.to_string()]);
        assert!(factory.aggregated.nonces.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_closing_stream_is_an_error() {
        let addr = start_mock_server(1).await;
        let channel = connect(addr).await;
        let factory = TonicStreamFactory::new(AckingProcessor::default(), DeltaProcessor::default());

        let mut stream = factory.aggregated(&channel).await.unwrap();
        stream.run_once().await.unwrap();

        // The ACK makes the server end the stream.
        let result = stream.run_once().await;
        assert!(matches!(result, Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn test_processor_error_fails_the_cycle() {
        let addr = start_mock_server(usize::MAX).await;
        let channel = connect(addr).await;
        let factory = TonicStreamFactory::new(RejectingProcessor, DeltaProcessor::default());

        let mut stream = factory.aggregated(&channel).await.unwrap();
        let result = stream.run_once().await;
        assert!(matches!(result, Err(Error::Process(_))));
    }

    #[tokio::test]
    async fn test_unknown_service_fails_stream_setup() {
        let addr = start_mock_server(usize::MAX).await;
        let channel = connect(addr).await;
        let processor = Arc::new(AckingProcessor::default());

        let result = GrpcStream::open(&channel, "/unknown.Service/Stream", processor).await;
        assert!(matches!(result, Err(Error::StreamSetup(_))));
    }
}
