//! Relay Engine
//!
//! Owns the peer cache, the statistics registry and both codec profiles, and
//! runs the two directional pumps:
//!
//! - downstream: tunnel interface -> the connection bound to the packet's
//!   destination address
//! - upstream: one task per accepted connection, client frames -> tunnel
//!   interface, or straight to another client (hairpin) when isolation is off

mod downstream;
mod upstream;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::cache::PeerCache;
use crate::codec::{CodecPipeline, CodecSettings, Profile};
use crate::config::WolfTunnelConfig;
use crate::device::TunnelInterface;
use crate::error::{Error, Result};
use crate::stats::Statistics;
use crate::transport::{self, BoxedStream, PeerConn, Transport};

/// State shared by every pump
pub(crate) struct RelayContext {
    pub(crate) tun: Arc<dyn TunnelInterface>,
    pub(crate) cache: Arc<PeerCache<PeerConn>>,
    pub(crate) stats: Arc<Statistics>,
    basic: CodecPipeline,
    extended: CodecPipeline,
    pub(crate) isolate_clients: bool,
}

impl RelayContext {
    pub(crate) fn codec(&self, profile: Profile) -> &CodecPipeline {
        match profile {
            Profile::Basic => &self.basic,
            Profile::Extended => &self.extended,
        }
    }
}

/// Tunnel relay instance
pub struct Relay {
    ctx: Arc<RelayContext>,
    transport: Arc<dyn Transport>,
    tls: Option<TlsAcceptor>,
    tls_timeout: Duration,
    bind_address: String,
    cancel: CancellationToken,
    next_id: AtomicU64,
}

impl Relay {
    /// Build a relay for the configured protocol
    pub fn new(config: &WolfTunnelConfig, tun: Arc<dyn TunnelInterface>) -> Result<Self> {
        config.validate()?;

        let tls = if config.tunnel.protocol.uses_tls() {
            match (&config.tls.cert_path, &config.tls.key_path) {
                (Some(cert), Some(key)) => Some(transport::load_acceptor(cert, key)?),
                _ => {
                    return Err(Error::Config(format!(
                        "protocol {} requires tls.cert_path and tls.key_path",
                        config.tunnel.protocol
                    )))
                }
            }
        } else {
            None
        };

        Ok(Self::with_transport(config, tun, transport::from_config(config), tls))
    }

    /// Build a relay around an explicit transport
    pub fn with_transport(
        config: &WolfTunnelConfig,
        tun: Arc<dyn TunnelInterface>,
        transport: Arc<dyn Transport>,
        tls: Option<TlsAcceptor>,
    ) -> Self {
        let settings = CodecSettings::from_config(&config.tunnel);
        let ctx = RelayContext {
            tun,
            cache: Arc::new(PeerCache::with_config(
                config.cache.ttl(),
                config.cache.sweep_interval(),
            )),
            stats: Arc::new(Statistics::new()),
            basic: CodecPipeline::new(Profile::Basic, &settings),
            extended: CodecPipeline::new(Profile::Extended, &settings),
            isolate_clients: config.tunnel.isolate_clients,
        };
        tracing::debug!(
            "Codec stages: basic {:?}, extended {:?}",
            ctx.basic.stage_names(),
            ctx.extended.stage_names()
        );

        Self {
            ctx: Arc::new(ctx),
            transport,
            tls,
            tls_timeout: config.tunnel.timeout(),
            bind_address: config.tunnel.bind_address.clone(),
            cancel: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn stats(&self) -> Arc<Statistics> {
        Arc::clone(&self.ctx.stats)
    }

    pub fn cache(&self) -> Arc<PeerCache<PeerConn>> {
        Arc::clone(&self.ctx.cache)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the accept loop, every pump and the background tasks
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown or a device failure
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            "Relay listening on {} ({}{})",
            listener.local_addr()?,
            self.transport.name(),
            if self.tls.is_some() { " over TLS" } else { "" }
        );

        let mut downstream = self.spawn_workers();

        let result = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, remote)) => {
                            if let Err(e) = socket.set_nodelay(true) {
                                tracing::debug!("TCP_NODELAY on {}: {}", remote, e);
                            }
                            self.accept_stream(Box::new(socket), remote);
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                finished = &mut downstream => {
                    break match finished {
                        Ok(result) => result,
                        Err(e) => Err(Error::Internal(format!("downstream pump failed: {}", e))),
                    };
                }
                _ = self.cancel.cancelled() => break Ok(()),
            }
        };

        self.cancel.cancel();
        tracing::info!("Relay stopped");
        result
    }

    /// Start the downstream pump, the cache janitor and the chart sampler.
    ///
    /// The returned handle resolves when the downstream pump ends.
    pub fn spawn_workers(&self) -> JoinHandle<Result<()>> {
        tokio::spawn(Arc::clone(&self.ctx.cache).run_janitor(self.cancel.clone()));
        tokio::spawn(Arc::clone(&self.ctx.stats).run_sampler(self.cancel.clone()));
        tokio::spawn(downstream::run(Arc::clone(&self.ctx), self.cancel.clone()))
    }

    /// Run a client session on an accepted stream in its own task
    pub fn accept_stream(&self, stream: BoxedStream, remote: SocketAddr) -> JoinHandle<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::clone(&self.ctx);
        let transport = Arc::clone(&self.transport);
        let tls = self.tls.clone();
        let tls_timeout = self.tls_timeout;
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let stream = match tls {
                Some(acceptor) => match timeout(tls_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls_stream)) => Box::new(tls_stream) as BoxedStream,
                    Ok(Err(e)) => {
                        tracing::debug!("TLS handshake with {} failed: {}", remote, e);
                        return;
                    }
                    Err(_) => {
                        tracing::debug!("TLS handshake with {} timed out", remote);
                        return;
                    }
                },
                None => stream,
            };
            upstream::run(ctx, transport, stream, remote, id, cancel).await;
        })
    }
}
