//! Full-duplex byte relay
//!
//! Each direction is a pump that reads one chunk, writes and flushes it to the
//! partner, and only then reads again, so a partner that stops draining stops
//! the reads on the other side. EOF on one side half-closes the partner's
//! write side. Any error ends the relay and drops both streams.

use std::io;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Sees every chunk as it passes through the relay.
pub trait RelayObserver: Send {
    fn on_client_data(&mut self, _data: &[u8]) {}
    fn on_upstream_data(&mut self, _data: &[u8]) {}
    /// The upstream finished sending.
    fn on_upstream_closed(&mut self) {}
}

/// Observer for tunnels that are not inspected.
#[derive(Debug, Default, Clone, Copy)]
pub struct Opaque;

impl RelayObserver for Opaque {}

/// Bytes moved in each direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

#[derive(Debug)]
pub struct DuplexRelay<C, U> {
    client: C,
    upstream: U,
    buffer_size: usize,
}

impl<C, U> DuplexRelay<C, U>
where
    C: AsyncRead + AsyncWrite + Send,
    U: AsyncRead + AsyncWrite + Send,
{
    /// Pair two established streams.
    pub fn matched_pair(client: C, upstream: U) -> Self {
        Self {
            client,
            upstream,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Largest chunk read before it must be written to the partner.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub async fn run(self) -> io::Result<RelayStats> {
        self.run_observed(&mut Opaque).await
    }

    pub async fn run_observed<O: RelayObserver>(self, observer: &mut O) -> io::Result<RelayStats> {
        let (client_read, client_write) = tokio::io::split(self.client);
        let (upstream_read, upstream_write) = tokio::io::split(self.upstream);
        let observer = Mutex::new(observer);
        let lock = || observer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let outbound = pump(
            client_read,
            upstream_write,
            self.buffer_size,
            |data| lock().on_client_data(data),
            || {},
        );
        let inbound = pump(
            upstream_read,
            client_write,
            self.buffer_size,
            |data| lock().on_upstream_data(data),
            || lock().on_upstream_closed(),
        );

        let (client_to_upstream, upstream_to_client) = tokio::try_join!(outbound, inbound)?;
        Ok(RelayStats {
            client_to_upstream,
            upstream_to_client,
        })
    }
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    mut on_data: impl FnMut(&[u8]),
    on_eof: impl FnOnce(),
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            on_eof();
            writer.shutdown().await?;
            return Ok(total);
        }
        on_data(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}
