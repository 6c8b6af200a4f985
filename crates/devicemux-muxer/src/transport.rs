//! Muxer socket endpoints.
//!
//! usbmuxd listens on a Unix socket by default. When the sidecar runs next to
//! a remote muxer it can be pointed at a TCP endpoint instead through
//! `USBMUXD_SOCKET_ADDRESS`.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

/// The default usbmuxd socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/usbmuxd";

/// Environment variable overriding the muxer address.
pub const SOCKET_ADDRESS_ENV: &str = "USBMUXD_SOCKET_ADDRESS";

/// Where the muxer listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxerEndpoint {
    /// A Unix domain socket.
    Unix(PathBuf),
    /// A TCP `host:port` address.
    Tcp(String),
}

impl Default for MuxerEndpoint {
    fn default() -> Self {
        Self::Unix(PathBuf::from(DEFAULT_SOCKET_PATH))
    }
}

impl MuxerEndpoint {
    /// Read the endpoint from `USBMUXD_SOCKET_ADDRESS`, falling back to the
    /// default socket path.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var(SOCKET_ADDRESS_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .map_or_else(Self::default, |v| Self::parse(&v))
    }

    /// Parse an address of the form `unix:/path/to/socket` or `host:port`.
    ///
    /// A bare absolute path is treated as a Unix socket.
    #[must_use]
    pub fn parse(address: &str) -> Self {
        if let Some(path) = address.strip_prefix("unix:") {
            Self::Unix(PathBuf::from(path))
        } else if address.starts_with('/') {
            Self::Unix(PathBuf::from(address))
        } else {
            Self::Tcp(address.to_string())
        }
    }

    /// Open a new connection to the muxer.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be opened.
    pub async fn connect(&self) -> io::Result<MuxerStream> {
        match self {
            Self::Unix(path) => Ok(MuxerStream::Unix(UnixStream::connect(path).await?)),
            Self::Tcp(address) => {
                let stream = TcpStream::connect(address).await?;
                stream.set_nodelay(true)?;
                Ok(MuxerStream::Tcp(stream))
            }
        }
    }
}

impl fmt::Display for MuxerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(address) => f.write_str(address),
        }
    }
}

/// A connected muxer socket.
#[derive(Debug)]
pub enum MuxerStream {
    /// Unix domain socket.
    Unix(UnixStream),
    /// TCP socket.
    Tcp(TcpStream),
}

impl AsyncRead for MuxerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MuxerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
