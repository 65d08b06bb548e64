//! The upstream loop that keeps a discovery stream alive.
//!
//! The loop runs as a single background task and owns the current
//! connection and stream handler:
//! - Streaming: run the handler cycle after cycle
//! - Recovering: dial with backoff, open a new stream, install both
//!
//! It exits only once the cancellation token fires.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::ConnectionState;
use crate::client::config::{ClientConfig, Mode};
use crate::client::retry::{Backoff, RetryPolicy};
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::stream::{ActiveHandler, StreamFactory, StreamHandler};
use crate::transport::Connector;

/// Handler type built by a factory `F`.
pub(crate) type HandlerOf<F> =
    ActiveHandler<<F as StreamFactory>::Aggregated, <F as StreamFactory>::Workload>;

/// A connection together with the handler built from it.
///
/// Replaced wholesale on every reconnect, so a handler never outlives its
/// connection.
#[derive(Debug)]
pub(crate) struct Session<C, H> {
    // Declared first so the stream is dropped before its connection.
    handler: H,
    _connection: C,
}

/// Dials the discovery server and opens streams on the connections it gets.
///
/// Holds only configuration and stateless collaborators, so it can be
/// borrowed across every suspension point of the upstream loop.
pub(crate) struct Recoverer<C, F, R> {
    connector: C,
    streams: F,
    runtime: R,
    server_address: String,
    mode: Mode,
    retry_policy: RetryPolicy,
    token: CancellationToken,
}

impl<C, F, R> std::fmt::Debug for Recoverer<C, F, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recoverer")
            .field("server_address", &self.server_address)
            .field("mode", &self.mode)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl<C, F, R> Recoverer<C, F, R>
where
    C: Connector,
    F: StreamFactory<Connection = C::Connection>,
    R: Runtime,
{
    /// Dial the discovery server until a connection is obtained.
    ///
    /// Retries forever with backoff. Returns [`Error::Cancelled`] as soon as
    /// cancellation is observed, without dialling again.
    pub(crate) async fn recover_connection(&self) -> Result<C::Connection> {
        let mut backoff = Backoff::new(self.retry_policy.clone());

        loop {
            if self.token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(Error::Cancelled),
                result = self.connector.connect(&self.server_address) => result,
            };

            match result {
                Ok(connection) => {
                    info!(
                        address = %self.server_address,
                        attempts = backoff.attempt() + 1,
                        "connected to discovery server"
                    );
                    return Ok(connection);
                }
                Err(error) => {
                    let attempt = backoff.attempt() + 1;
                    let delay = backoff.next_backoff();
                    warn!(
                        %error,
                        address = %self.server_address,
                        attempt,
                        backoff = ?delay,
                        "failed to connect to discovery server"
                    );
                    self.wait(delay).await?;
                }
            }
        }
    }

    /// Open the stream matching the configured mode over `connection`.
    ///
    /// This is the only place the mode is dispatched on.
    pub(crate) async fn create_stream_client(
        &self,
        connection: &C::Connection,
    ) -> Result<HandlerOf<F>> {
        let handler = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(Error::Cancelled),
            handler = async {
                match self.mode {
                    Mode::Aggregated => self
                        .streams
                        .aggregated(connection)
                        .await
                        .map(ActiveHandler::Aggregated),
                    Mode::Workload => self
                        .streams
                        .workload(connection)
                        .await
                        .map(ActiveHandler::Workload),
                }
            } => handler?,
        };

        info!(mode = %self.mode, "discovery stream established");
        Ok(handler)
    }

    /// Sleep for `delay` unless cancelled first.
    async fn wait(&self, delay: Duration) -> Result<()> {
        debug!(backoff = ?delay, "waiting before next attempt");
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            _ = self.runtime.sleep(delay) => Ok(()),
        }
    }
}

/// Reverts the published state to `Idle` if the initial connect is abandoned.
#[derive(Debug)]
pub(crate) struct StartGuard<'a> {
    state: &'a watch::Sender<ConnectionState>,
    armed: bool,
}

impl StartGuard<'_> {
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.send_replace(ConnectionState::Idle);
        }
    }
}

/// State owned by the task running the upstream loop.
pub(crate) struct Upstream<C, F, R>
where
    C: Connector,
    F: StreamFactory<Connection = C::Connection>,
{
    recoverer: Recoverer<C, F, R>,
    state: watch::Sender<ConnectionState>,
    session: Option<Session<C::Connection, HandlerOf<F>>>,
}

impl<C, F, R> std::fmt::Debug for Upstream<C, F, R>
where
    C: Connector,
    F: StreamFactory<Connection = C::Connection>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("recoverer", &self.recoverer)
            .field("state", &*self.state.borrow())
            .field("connected", &self.session.is_some())
            .finish()
    }
}

impl<C, F, R> Upstream<C, F, R>
where
    C: Connector,
    F: StreamFactory<Connection = C::Connection>,
    R: Runtime,
{
    pub(crate) fn new(
        config: ClientConfig,
        connector: C,
        streams: F,
        runtime: R,
        token: CancellationToken,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            recoverer: Recoverer {
                connector,
                streams,
                runtime,
                server_address: config.server_address,
                mode: config.mode,
                retry_policy: config.retry_policy,
                token,
            },
            state,
            session: None,
        }
    }

    pub(crate) fn recoverer(&self) -> &Recoverer<C, F, R> {
        &self.recoverer
    }

    /// Publish `Connecting` for the initial connect.
    ///
    /// The returned guard reverts the state to `Idle` when dropped, unless
    /// it is disarmed once the first stream is installed.
    pub(crate) fn begin_start(&self) -> StartGuard<'_> {
        self.state.send_replace(ConnectionState::Connecting);
        StartGuard {
            state: &self.state,
            armed: true,
        }
    }

    /// Install a freshly built connection and handler.
    pub(crate) fn install(&mut self, connection: C::Connection, handler: HandlerOf<F>) {
        self.session = Some(Session {
            handler,
            _connection: connection,
        });
        self.state.send_replace(ConnectionState::Streaming);
    }

    /// Replace the current session with a new one.
    ///
    /// The old session is dropped before dialling. A stream that fails to
    /// open restarts recovery from a fresh dial, after a backoff that grows
    /// until a stream is installed.
    async fn recover(&mut self) -> Result<()> {
        self.session = None;
        self.state.send_replace(ConnectionState::Connecting);
        let recoverer = &self.recoverer;
        let mut setup_backoff = Backoff::new(recoverer.retry_policy.clone());

        let (connection, handler) = loop {
            let connection = recoverer.recover_connection().await?;

            if recoverer.token.is_cancelled() {
                debug!("discarding connection obtained after cancellation");
                return Err(Error::Cancelled);
            }

            match recoverer.create_stream_client(&connection).await {
                Ok(handler) => break (connection, handler),
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    drop(connection);
                    let delay = setup_backoff.next_backoff();
                    warn!(%error, "failed to establish discovery stream");
                    recoverer.wait(delay).await?;
                }
            }
        };

        if self.recoverer.token.is_cancelled() {
            debug!("discarding stream opened after cancellation");
            return Err(Error::Cancelled);
        }
        self.install(connection, handler);
        Ok(())
    }

    /// Run the active handler until cancelled, recovering from every failure.
    pub(crate) async fn handle_upstream(&mut self) {
        let mode = self.recoverer.mode;

        loop {
            if self.recoverer.token.is_cancelled() {
                break;
            }

            let Some(session) = self.session.as_mut() else {
                match self.recover().await {
                    Ok(()) => continue,
                    Err(_) => break,
                }
            };

            let result = tokio::select! {
                biased;
                _ = self.recoverer.token.cancelled() => break,
                result = session.handler.run_once() => result,
            };

            match result {
                Ok(()) => trace!("discovery cycle completed"),
                Err(error) => {
                    warn!(%error, %mode, "discovery stream failed, reconnecting");
                    self.session = None;
                }
            }
        }

        self.session = None;
        self.state.send_replace(ConnectionState::Stopped);
        info!("xDS upstream loop stopped");
    }
}
