//! Byte-stream transport used by connections.
//!
//! A [`Connector`] opens a duplex byte stream to `host:port`. The connection
//! driver only needs `AsyncRead + AsyncWrite`, so anything from a TCP socket to
//! an in-memory pipe can stand in for the network.

use std::io;

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tracing::debug;

/// A bidirectional byte stream the connection can own.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens transport streams to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establishes a stream to `host:port`. Returns once the transport is connected.
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream>;
}

/// Plain TCP with Nagle disabled; TLS is layered on top by the connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        debug!("TCP connection to {host}:{port} established");
        Ok(Box::new(stream))
    }
}
