//! TCP transport for overlay links.
//!
//! Links are plain TCP streams. Authentication and encryption are the job of
//! a TLS layer in front of the session; the session itself runs over any
//! `AsyncRead + AsyncWrite` stream.

use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    debug!(addr = %listener.local_addr()?, "listening");
    Ok(listener)
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
