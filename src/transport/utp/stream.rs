//! A pull-based adapter over a [`UtpSocket`] connection, matching the shape
//! peer sessions already expect from a TCP stream closely enough to sit
//! behind the same `Transport` seam.

use std::{net::SocketAddr, sync::Arc};

use crate::error::transport::Result;
use crate::transport::utp::socket::UtpSocket;

pub struct UtpStream {
    socket: Arc<UtpSocket>,
    conn_id: u16,
}

impl UtpStream {
    pub async fn connect(socket: Arc<UtpSocket>, addr: SocketAddr) -> Result<Self> {
        let conn_id = socket.connect(addr).await?;
        Ok(Self { socket, conn_id })
    }

    pub fn from_parts(socket: Arc<UtpSocket>, conn_id: u16) -> Self {
        Self { socket, conn_id }
    }

    pub async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.socket.send_data(self.conn_id, data).await
    }

    pub async fn has_data(&self) -> bool {
        self.socket.has_data(self.conn_id).await
    }

    pub async fn recv_data(&self) -> Option<Vec<u8>> {
        self.socket.recv_data(self.conn_id).await
    }

    pub async fn bytes_in_flight(&self) -> u32 {
        self.socket.bytes_in_flight(self.conn_id).await
    }

    pub async fn close(&self) -> Result<()> {
        self.socket.close(self.conn_id).await
    }
}
