//! TCP transport: spec.md §4.5's baseline transport, a thin wrapper over
//! tokio's own connect/listen so peer sessions don't need to know which
//! transport they were handed.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::error::transport::Result;

pub async fn connect(addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub async fn listen(addr: SocketAddr) -> Result<TcpListener> {
    Ok(TcpListener::bind(addr).await?)
}
