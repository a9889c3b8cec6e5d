//! Downstream pump: tunnel interface -> clients

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::RelayContext;
use crate::cache::Lookup;
use crate::error::Result;
use crate::packet;
use crate::transport::PeerConn;

/// Route packets read from the tunnel interface until cancelled.
///
/// Only a tunnel interface failure ends the pump early.
pub(crate) async fn run(ctx: Arc<RelayContext>, cancel: CancellationToken) -> Result<()> {
    tracing::debug!("Downstream pump started on {}", ctx.tun.name());

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = ctx.tun.read_packet() => match packet {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::error!("Tunnel interface read failed: {}", e);
                    return Err(e);
                }
            },
        };

        let Some(key) = packet::destination_key(&packet) else {
            tracing::trace!("Dropping {} byte packet without a destination", packet.len());
            continue;
        };

        match ctx.cache.get(&key) {
            Some(conn) => {
                deliver(&ctx, &key, &conn, &packet).await;
            }
            None => {
                // A binding that lapsed while still in memory points at a
                // session that stopped talking; don't leave it half open
                if let Lookup::Expired(stale) = ctx.cache.get_without_refresh(&key) {
                    tracing::debug!("Closing stale session {:?} bound to {}", stale, key);
                    ctx.cache.delete_if(&key, |conn| conn.id() == stale.id());
                    stale.close().await;
                } else {
                    tracing::trace!("No session for {}", key);
                }
            }
        }
    }

    tracing::debug!("Downstream pump stopped");
    Ok(())
}

/// Encode `packet` for `conn` and send it.
///
/// A failed write unbinds `key` and closes the connection; the caller carries
/// on either way. Returns whether the packet went out.
pub(crate) async fn deliver(ctx: &RelayContext, key: &str, conn: &PeerConn, packet: &[u8]) -> bool {
    let encoded = match ctx.codec(conn.profile()).encode(packet) {
        Ok(encoded) => encoded,
        Err(e) => {
            tracing::warn!(category = e.category(), "Encode for {:?} failed: {}", conn, e);
            return false;
        }
    };

    match conn.write_frame(&encoded).await {
        Ok(n) => {
            ctx.stats.add_rx(conn.remote_addr(), n as u64);
            tracing::trace!("{} -> {:?}: {} bytes", key, conn, n);
            true
        }
        Err(e) => {
            tracing::debug!(category = e.category(), "Write to {:?} failed: {}", conn, e);
            ctx.cache.delete_if(key, |bound| bound.id() == conn.id());
            conn.close().await;
            false
        }
    }
}
