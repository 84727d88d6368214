//! Layer-4 passthrough front-end.
//!
//! # Responsibilities
//! - Accept client connections through the bounded [`Listener`]
//! - Dispatch each connection to a backend (the "request" is the connect)
//! - Relay bytes both ways until either side closes
//! - Keep the backend counted in flight for the whole session

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::dispatch::{Dispatcher, Upstream, UpstreamError};
use crate::load_balancer::backend::BackendView;
use crate::load_balancer::context::RequestContext;
use crate::net::connection::SessionTracker;
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};

/// Opens a TCP connection to the chosen backend.
#[derive(Debug, Clone, Default)]
pub struct TcpUpstream;

impl Upstream for TcpUpstream {
    type Request = ();
    type Response = TcpStream;

    async fn call(&self, target: &BackendView, _request: &()) -> Result<TcpStream, UpstreamError> {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

/// Pause before accepting again after `failures` consecutive accept errors,
/// so a persistent error such as fd exhaustion does not spin the loop.
fn accept_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(7);
    Duration::from_millis(10 << exponent).min(Duration::from_secs(1))
}

pub struct TcpProxy {
    dispatcher: Arc<Dispatcher<TcpUpstream>>,
    sessions: SessionTracker,
    drain_timeout: Duration,
}

impl TcpProxy {
    pub fn new(dispatcher: Dispatcher<TcpUpstream>) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            sessions: SessionTracker::new(),
            drain_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    /// Accept until shutdown, then wait (bounded) for open sessions to end.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        let addr = listener.local_addr().map_err(ListenerError::Bind)?;
        tracing::info!(address = %addr, "TCP passthrough starting");

        let mut accept_failures: u32 = 0;
        loop {
            if accept_failures > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(accept_backoff(accept_failures)) => {}
                    _ = shutdown.recv() => {
                        tracing::info!("TCP passthrough received shutdown signal, exiting loop");
                        break;
                    }
                }
            }
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((client, peer, permit)) => {
                            accept_failures = 0;
                            self.spawn_session(client, peer, permit);
                        }
                        Err(ListenerError::Closed) => break,
                        Err(e) => {
                            accept_failures = accept_failures.saturating_add(1);
                            tracing::error!(error = %e, failures = accept_failures, "Accept failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("TCP passthrough received shutdown signal, exiting loop");
                    break;
                }
            }
        }

        if !self.sessions.wait_idle(self.drain_timeout).await {
            tracing::warn!(open = self.sessions.active(), "Sessions still open after drain timeout");
        }
        tracing::info!("TCP passthrough stopped");
        Ok(())
    }

    fn spawn_session(&self, mut client: TcpStream, peer: SocketAddr, permit: ConnectionPermit) {
        let dispatcher = self.dispatcher.clone();
        let session = self.sessions.track();

        tokio::spawn(async move {
            let _permit = permit;
            let ctx = RequestContext::new().with_client_key(peer.ip().to_string());
            let routed = match dispatcher.handle(&(), ctx).await {
                Ok(routed) => routed,
                Err(e) => {
                    tracing::warn!(session = %session.id(), peer = %peer, error = %e, "No backend for session");
                    return;
                }
            };
            let backend = routed.backend.id.clone();
            tracing::debug!(session = %session.id(), peer = %peer, backend = %backend, "Session established");

            let (mut upstream, lease) = routed.into_parts();
            match copy_bidirectional(&mut client, &mut upstream).await {
                Ok((sent, received)) => tracing::debug!(
                    session = %session.id(),
                    backend = %backend,
                    bytes_sent = sent,
                    bytes_received = received,
                    "Session finished"
                ),
                Err(e) => tracing::debug!(session = %session.id(), backend = %backend, error = %e, "Session aborted"),
            }
            drop(lease);
        });
    }
}
