//! Upstream pump: one client session -> tunnel interface / other clients

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::downstream::deliver;
use super::RelayContext;
use crate::error::Result;
use crate::packet;
use crate::transport::{BoxedStream, PeerConn, Session, Transport};

/// Serve one accepted connection until it closes or the relay shuts down
pub(crate) async fn run(
    ctx: Arc<RelayContext>,
    transport: Arc<dyn Transport>,
    stream: BoxedStream,
    remote: SocketAddr,
    id: u64,
    cancel: CancellationToken,
) {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = transport.open(stream, remote, id, cancel.clone()) => opened,
    };
    let mut session = match opened {
        Ok(session) => session,
        Err(e) => {
            tracing::debug!(
                category = e.category(),
                "Rejected {} connection from {}: {}",
                transport.name(),
                remote,
                e
            );
            return;
        }
    };

    let conn = session.handle();
    ctx.stats.register(remote);
    tracing::debug!("Client {} connected as #{}", remote, id);

    let mut bound = HashSet::new();
    match pump(&ctx, session.as_mut(), &conn, &mut bound, &cancel).await {
        Ok(()) => tracing::debug!("Client {} (#{}) disconnected", remote, id),
        Err(e) if e.is_connection_closed() => {
            tracing::debug!("Client {} (#{}) hung up: {}", remote, id, e)
        }
        Err(e) => {
            tracing::warn!(category = e.category(), "Closing client {} (#{}): {}", remote, id, e)
        }
    }

    for key in &bound {
        ctx.cache.delete_if(key, |c| c.id() == id);
    }
    conn.close().await;
    ctx.stats.unregister(remote);
}

/// Session state machine after the transport is open.
///
/// Any error ends this connection only.
async fn pump(
    ctx: &RelayContext,
    session: &mut dyn Session,
    conn: &PeerConn,
    bound: &mut HashSet<String>,
    cancel: &CancellationToken,
) -> Result<()> {
    let keys = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        keys = session.start() => keys?,
    };
    for key in keys {
        ctx.cache.put(key.clone(), conn.clone());
        bound.insert(key);
    }

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = session.read_next() => frame?,
        };
        let Some(encoded) = frame else {
            return Ok(());
        };

        ctx.stats.add_tx(conn.remote_addr(), encoded.len() as u64);
        if encoded.is_empty() {
            continue;
        }

        let packet = ctx.codec(conn.profile()).decode(&encoded)?;
        if packet.is_empty() {
            continue;
        }

        // Re-bound on every payload; the TTL follows upstream traffic
        if conn.registers_by_source() {
            if let Some(source) = packet::source_key(&packet) {
                ctx.cache.put(source.clone(), conn.clone());
                if bound.insert(source.clone()) {
                    tracing::debug!("Binding {} to {:?}", source, conn);
                }
            }
        }

        let Some(destination) = packet::destination_key(&packet) else {
            tracing::trace!(
                "Dropping {} byte packet from {:?} without a destination",
                packet.len(),
                conn
            );
            continue;
        };

        if !ctx.isolate_clients {
            if let Some(target) = ctx.cache.get(&destination) {
                if target.id() != conn.id() {
                    deliver(ctx, &destination, &target, &packet).await;
                    continue;
                }
            }
        }

        ctx.tun.write_packet(&packet).await?;
    }
}
