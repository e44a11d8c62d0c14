//! HTTP tunnel front-end.
//!
//! The first chunk a client sends is sniffed for its `Host:` header and the
//! chunk itself is consumed. There is no request-line validation: a request
//! without a host line still gets a tunnel attempt with an empty target,
//! which the relay rejects.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Maximum bytes read for the initial sniff.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 8192;

const HOST_PREFIX: &str = "host: ";

/// Read the first chunk from the client and extract its target.
///
/// Returns `Ok(None)` when the client closed before sending anything.
pub async fn sniff<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Option<String>> {
    let mut buffer = vec![0u8; DEFAULT_MAX_SNIFF_BYTES];
    let n = stream.read(&mut buffer).await?;
    if n == 0 {
        return Ok(None);
    }

    let target = parse_target(&buffer[..n]);
    debug!(proxy_target = %target, bytes = n, "HTTP request sniffed");
    Ok(Some(target))
}

/// Extract the authority from the last `Host:` line of a request chunk.
///
/// The prefix match is case-insensitive; the value keeps its case.
pub fn parse_target(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);

    text.split('\n')
        .filter(|line| {
            line.get(..HOST_PREFIX.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(HOST_PREFIX))
        })
        .last()
        .and_then(|line| line.rsplit(": ").next())
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}
