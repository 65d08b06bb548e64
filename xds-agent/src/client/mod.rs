//! Client lifecycle: building, starting and stopping the upstream loop.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::config::{ClientConfig, Mode};
use crate::client::upstream::Upstream;
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::stream::StreamFactory;
use crate::transport::Connector;

pub mod config;
pub mod retry;
pub(crate) mod upstream;

/// Health of the connection to the discovery server.
///
/// Published by the task owning the connection; readers only ever see a
/// possibly stale snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The client has been built but not started.
    Idle,
    /// No stream is installed; the client is dialling or opening a stream.
    Connecting,
    /// A stream is installed and discovery cycles are running.
    Streaming,
    /// The upstream loop has exited.
    Stopped,
}

/// Builder for [`XdsClient`].
#[derive(Debug)]
pub struct XdsClientBuilder<C, F, R> {
    config: ClientConfig,
    connector: C,
    streams: F,
    runtime: R,
    parent_token: Option<CancellationToken>,
}

impl<C, F, R> XdsClientBuilder<C, F, R>
where
    C: Connector,
    F: StreamFactory<Connection = C::Connection>,
    R: Runtime,
{
    /// Create a new builder with the given configuration, connector, stream
    /// factory, and runtime.
    pub fn new(config: ClientConfig, connector: C, streams: F, runtime: R) -> Self {
        Self {
            config,
            connector,
            streams,
            runtime,
            parent_token: None,
        }
    }

    /// Tie the client to a process-wide shutdown token.
    ///
    /// Cancelling `token` stops the client as [`XdsClient::stop`] would.
    /// Stopping the client does not cancel `token`.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.parent_token = Some(token);
        self
    }

    /// Build the client.
    ///
    /// No connection is made until [`XdsClient::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn build(self) -> Result<XdsClient<C, F, R>> {
        self.config.validate()?;

        let token = match &self.parent_token {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let mode = self.config.mode;

        let upstream = Upstream::new(
            self.config,
            self.connector,
            self.streams,
            self.runtime.clone(),
            token.clone(),
            state_tx,
        );

        Ok(XdsClient {
            mode,
            runtime: self.runtime,
            token,
            state: state_rx,
            upstream: Some(upstream),
        })
    }
}

/// The xDS agent client.
///
/// Owns the connection to the discovery server and the stream running on
/// it. After [`start`](Self::start) both live on a background task that
/// reconnects on every failure until [`stop`](Self::stop) is called or the
/// client is dropped.
///
/// # Example
///
/// ```ignore
/// use xds_agent::{ClientConfig, Mode, TokioRuntime, TonicConnector, TonicStreamFactory, XdsClient};
///
/// let config = ClientConfig::from_env()?;
/// let streams = TonicStreamFactory::new(ads_processor, workload_processor);
/// let mut client = XdsClient::builder(config, TonicConnector::new(), streams, TokioRuntime).build()?;
///
/// client.start().await?;
/// // ...
/// client.stop().await;
/// ```
pub struct XdsClient<C, F, R>
where
    C: Connector,
    F: StreamFactory<Connection = C::Connection>,
{
    mode: Mode,
    runtime: R,
    token: CancellationToken,
    state: watch::Receiver<ConnectionState>,
    /// Present until the upstream loop has been handed to its task.
    upstream: Option<Upstream<C, F, R>>,
}

impl<C, F, R> std::fmt::Debug for XdsClient<C, F, R>
where
    C: Connector,
    F: StreamFactory<Connection = C::Connection>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XdsClient")
            .field("mode", &self.mode)
            .field("state", &*self.state.borrow())
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<C, F, R> XdsClient<C, F, R>
where
    C: Connector,
    F: StreamFactory<Connection = C::Connection>,
    R: Runtime,
{
    /// Create a new builder with the given configuration, connector, stream
    /// factory, and runtime.
    pub fn builder(
        config: ClientConfig,
        connector: C,
        streams: F,
        runtime: R,
    ) -> XdsClientBuilder<C, F, R> {
        XdsClientBuilder::new(config, connector, streams, runtime)
    }

    /// The discovery mode this client was built for.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Connect, open the discovery stream, and hand both to the upstream loop.
    ///
    /// Connecting retries with backoff until it succeeds, so this only
    /// returns once the server is reachable. If opening the first stream
    /// fails, the error is returned and the client stays unstarted; `start`
    /// may then be called again. The same holds if the returned future is
    /// dropped before it completes.
    ///
    /// # Errors
    ///
    /// - [`Error::StreamSetup`] if the first stream cannot be opened.
    /// - [`Error::Cancelled`] if the client is stopped while connecting.
    /// - [`Error::AlreadyStarted`] if the loop is already running.
    pub async fn start(&mut self) -> Result<()> {
        // The upstream stays in place until the first stream is installed,
        // so dropping this future leaves the client startable.
        let (recoverer, guard) = {
            let upstream = self.upstream.as_ref().ok_or(Error::AlreadyStarted)?;
            (upstream.recoverer(), upstream.begin_start())
        };
        let connection = recoverer.recover_connection().await?;
        let handler = recoverer.create_stream_client(&connection).await?;
        guard.disarm();

        let Some(mut upstream) = self.upstream.take() else {
            return Err(Error::AlreadyStarted);
        };
        upstream.install(connection, handler);
        info!(mode = %self.mode, "xDS client started");

        self.runtime.spawn(async move {
            upstream.handle_upstream().await;
        });
        Ok(())
    }

    /// Cancel the client and wait for the upstream loop to exit.
    ///
    /// Returns immediately if the client was never started or has already
    /// stopped. Safe to call any number of times.
    pub async fn stop(&self) {
        self.token.cancel();

        if self.upstream.is_some() {
            return;
        }

        let mut state = self.state.clone();
        // An error means the loop is gone, which is just as final.
        let _ = state.wait_for(|s| *s == ConnectionState::Stopped).await;
    }
}

impl<C, F, R> Drop for XdsClient<C, F, R>
where
    C: Connector,
    F: StreamFactory<Connection = C::Connection>,
{
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::upstream::tests::{
        Cycle, MockConnector, MockStreams, Script, test_config,
    };
    use crate::runtime::tokio::TokioRuntime;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    type MockClient = XdsClient<MockConnector, MockStreams, TokioRuntime>;

    fn client(mode: Mode, connector: MockConnector, streams: MockStreams) -> MockClient {
        XdsClient::builder(test_config(mode), connector, streams, TokioRuntime)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_rejects_empty_address() {
        let token = CancellationToken::new();
        let streams = MockStreams::new(Script::new(&[], token));
        let config = ClientConfig::new("", Mode::Aggregated);
        let result =
            XdsClient::builder(config, MockConnector::default(), streams, TokioRuntime).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_connects_and_runs_loop() {
        let token = CancellationToken::new();
        let script = Script::new(&[Cycle::Succeed], token.clone());
        let connector = MockConnector::failing(2);
        let streams = MockStreams::new(script.clone());
        let mut client = client(Mode::Aggregated, connector.clone(), streams.clone());
        assert_eq!(client.state(), ConnectionState::Idle);

        client.start().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Streaming);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(script.runs.load(Ordering::SeqCst) >= 1);

        client.stop().await;
        assert_eq!(client.state(), ConnectionState::Stopped);
        assert_eq!(streams.setups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_surfaces_stream_setup_error() {
        let token = CancellationToken::new();
        let script = Script::new(&[Cycle::Succeed], token);
        let connector = MockConnector::default();
        let streams = MockStreams::new(script).failing(1);
        let mut client = client(Mode::Workload, connector.clone(), streams.clone());

        let result = client.start().await;
        assert!(matches!(result, Err(Error::StreamSetup(_))));
        assert_eq!(client.state(), ConnectionState::Idle);

        // The client is left unstarted and can be started again.
        client.start().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Streaming);
        assert_eq!(streams.workload_built.load(Ordering::SeqCst), 1);
        assert_eq!(streams.aggregated_built.load(Ordering::SeqCst), 0);

        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_start_can_be_retried() {
        let token = CancellationToken::new();
        let connector = MockConnector::failing(3);
        let streams = MockStreams::new(Script::new(&[], token));
        let mut client = client(Mode::Aggregated, connector.clone(), streams.clone());

        // The first dial fails and the timeout fires during its backoff.
        let abandoned = tokio::time::timeout(Duration::from_millis(500), client.start()).await;
        assert!(abandoned.is_err());
        assert_eq!(client.state(), ConnectionState::Idle);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

        client.start().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Streaming);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(streams.setups.load(Ordering::SeqCst), 1);

        client.stop().await;
        assert_eq!(client.state(), ConnectionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_rejected() {
        let token = CancellationToken::new();
        let streams = MockStreams::new(Script::new(&[], token));
        let mut client = client(Mode::Aggregated, MockConnector::default(), streams);

        client.start().await.unwrap();
        assert!(matches!(client.start().await, Err(Error::AlreadyStarted)));
        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_failures_reconnect_in_background() {
        let token = CancellationToken::new();
        let script = Script::new(&[Cycle::Fail, Cycle::Fail], token);
        let connector = MockConnector::default();
        let streams = MockStreams::new(script.clone());
        let mut client = client(Mode::Workload, connector.clone(), streams.clone());

        client.start().await.unwrap();
        let mut state = client.watch_state();
        while streams.setups.load(Ordering::SeqCst) < 3 {
            state.changed().await.unwrap();
        }
        state
            .wait_for(|s| *s == ConnectionState::Streaming)
            .await
            .unwrap();

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(streams.workload_built.load(Ordering::SeqCst), 3);
        assert_eq!(streams.aggregated_built.load(Ordering::SeqCst), 0);
        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let token = CancellationToken::new();
        let streams = MockStreams::new(Script::new(&[], token));
        let mut client = client(Mode::Aggregated, MockConnector::default(), streams);

        client.start().await.unwrap();
        client.stop().await;
        client.stop().await;
        assert_eq!(client.state(), ConnectionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_loop_exited() {
        let token = CancellationToken::new();
        let script = Script::new(&[Cycle::Cancel], token.clone());
        let streams = MockStreams::new(script);
        let mut client = XdsClient::builder(
            test_config(Mode::Workload),
            MockConnector::default(),
            streams,
            TokioRuntime,
        )
        .with_cancellation_token(token.clone())
        .build()
        .unwrap();

        client.start().await.unwrap();
        client
            .watch_state()
            .wait_for(|s| *s == ConnectionState::Stopped)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), client.stop())
            .await
            .expect("stop after exit must not block");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start_returns() {
        let token = CancellationToken::new();
        let streams = MockStreams::new(Script::new(&[], token));
        let mut client = client(Mode::Aggregated, MockConnector::default(), streams);

        client.stop().await;
        assert!(matches!(client.start().await, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_stalled_cycle() {
        let token = CancellationToken::new();
        let script = Script::new(&[Cycle::Fail], token);
        let connector = MockConnector::default();
        let streams = MockStreams::new(script);
        let mut client = client(Mode::Aggregated, connector, streams);

        client.start().await.unwrap();
        client
            .watch_state()
            .wait_for(|s| *s == ConnectionState::Streaming)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), client.stop())
            .await
            .expect("stop must not wait out a stalled cycle");
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_token_stops_client() {
        let parent = CancellationToken::new();
        let streams = MockStreams::new(Script::new(&[], parent.clone()));
        let mut client = XdsClient::builder(
            test_config(Mode::Aggregated),
            MockConnector::default(),
            streams,
            TokioRuntime,
        )
        .with_cancellation_token(parent.clone())
        .build()
        .unwrap();

        client.start().await.unwrap();
        parent.cancel();
        client
            .watch_state()
            .wait_for(|s| *s == ConnectionState::Stopped)
            .await
            .unwrap();
    }
}
