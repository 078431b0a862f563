//! `embedded-io-async` view of an embassy-net TCP socket

use core::fmt;

use embassy_net::tcp::{self, TcpSocket};
use embedded_io::{ErrorKind, ErrorType};
use embedded_io_async::{Read, Write};

/// The peer reset the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketError(pub tcp::Error);

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp: {:?}", self.0)
    }
}

impl core::error::Error for SocketError {}

impl embedded_io::Error for SocketError {
    fn kind(&self) -> ErrorKind {
        match self.0 {
            tcp::Error::ConnectionReset => ErrorKind::ConnectionReset,
            #[allow(unreachable_patterns)]
            _ => ErrorKind::Other,
        }
    }
}

/// Connected socket handed to the store client
pub struct StoreSocket<'a> {
    inner: TcpSocket<'a>,
}

impl<'a> StoreSocket<'a> {
    pub fn new(inner: TcpSocket<'a>) -> Self {
        Self { inner }
    }

    /// Close our side and give the socket back
    pub fn close(mut self) -> TcpSocket<'a> {
        self.inner.close();
        self.inner
    }
}

impl ErrorType for StoreSocket<'_> {
    type Error = SocketError;
}

impl Read for StoreSocket<'_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.inner.read(buf).await.map_err(SocketError)
    }
}

impl Write for StoreSocket<'_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.inner.write(buf).await.map_err(SocketError)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.inner.flush().await.map_err(SocketError)
    }
}
