//! Partial-read assembly for fixed-size wire structures

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Fill `buf` completely from `reader`.
///
/// Sockets may hand over a structure in several pieces, so this keeps reading
/// until every byte has arrived. `first_wait` bounds the wait for the first
/// byte; every following read gets a fresh `deadline`, so a peer that stalls
/// in the middle of a structure is dropped quickly while an idle one between
/// structures may wait longer.
///
/// A clean end of stream before the first byte is `ConnectionClosed`; one in
/// the middle of the structure is an `UnexpectedEof` I/O error.
pub async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    first_wait: Duration,
    deadline: Duration,
) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let wait = if filled == 0 { first_wait } else { deadline };
        let n = match timeout(wait, reader.read(&mut buf[filled..])).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::ReadTimeout(wait)),
        };
        if n == 0 {
            if filled == 0 {
                return Err(Error::ConnectionClosed);
            }
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream ended after {} of {} bytes", filled, buf.len()),
            )));
        }
        filled += n;
    }
    Ok(())
}
