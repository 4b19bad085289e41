//! The uTP socket: one UDP socket multiplexing many [`Connection`]s by their
//! 16-bit connection id, polled on a 100ms tick per spec.md §4.5.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::BytesMut;
use tokio::{net::UdpSocket, sync::Mutex, time::interval};

use crate::{
    error::transport::{Result, TransportError},
    transport::utp::{
        connection::{ConnState, Connection},
        header::{Header, PacketType, HEADER_LEN},
    },
};

/// Picks a connection id pair for a new outbound connection: even recv / odd
/// send for initiators (the responder on the other end sees it reversed).
/// On an id collision with an already-registered connection, draws a fresh
/// pair rather than reusing the colliding one.
fn alloc_initiator_id(used: &HashMap<u16, Connection>, counter: &AtomicU16) -> u16 {
    loop {
        let id = counter.fetch_add(2, Ordering::Relaxed) & !1;
        if !used.contains_key(&id) {
            return id;
        }
    }
}

pub struct UtpSocket {
    socket: Arc<UdpSocket>,
    connections: Arc<Mutex<HashMap<u16, (SocketAddr, Connection)>>>,
    next_id: AtomicU16,
}

impl UtpSocket {
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await.map_err(TransportError::from)?);
        let this = Arc::new(Self {
            socket,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU16::new(1),
        });
        this.clone().spawn_recv_loop();
        this.clone().spawn_tick_loop();
        Ok(this)
    }

    /// Initiates an outbound connection, sending the SYN packet and
    /// registering the connection for the recv loop to dispatch into.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<u16> {
        let conn_id = {
            let connections = self.connections.lock().await;
            alloc_initiator_id(&connections, &self.next_id)
        };
        let mut conn = Connection::new_initiator(conn_id);
        conn.registered_with_socket = true;
        let header = conn.open();
        self.send_header(addr, &header, &[]).await?;
        self.connections.lock().await.insert(conn_id, (addr, conn));
        Ok(conn_id)
    }

    pub async fn send_data(self: &Arc<Self>, conn_id: u16, payload: Vec<u8>) -> Result<()> {
        let mut connections = self.connections.lock().await;
        let (addr, conn) = connections
            .get_mut(&conn_id)
            .ok_or(TransportError::Reset)?;
        let addr = *addr;
        let header = conn.send(payload.clone());
        drop(connections);
        self.send_header(addr, &header, &payload).await
    }

    pub async fn has_data(self: &Arc<Self>, conn_id: u16) -> bool {
        self.connections
            .lock()
            .await
            .get(&conn_id)
            .map(|(_, conn)| conn.has_data())
            .unwrap_or(false)
    }

    pub async fn recv_data(self: &Arc<Self>, conn_id: u16) -> Option<Vec<u8>> {
        self.connections
            .lock()
            .await
            .get_mut(&conn_id)
            .and_then(|(_, conn)| conn.recv_data())
    }

    pub async fn bytes_in_flight(self: &Arc<Self>, conn_id: u16) -> u32 {
        self.connections
            .lock()
            .await
            .get(&conn_id)
            .map(|(_, conn)| conn.bytes_in_flight())
            .unwrap_or(0)
    }

    pub async fn close(self: &Arc<Self>, conn_id: u16) -> Result<()> {
        let mut connections = self.connections.lock().await;
        let (addr, conn) = match connections.get_mut(&conn_id) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let addr = *addr;
        let header = conn.close();
        drop(connections);
        self.send_header(addr, &header, &[]).await
    }

    async fn send_header(&self, addr: SocketAddr, header: &Header, payload: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        header.encode(&mut buf);
        buf.extend_from_slice(payload);
        self.socket.send_to(&buf, addr).await.map_err(TransportError::from)?;
        Ok(())
    }

    fn spawn_recv_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = [0u8; 65536];
            loop {
                let (len, addr) = match self.socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        log::debug!("uTP recv error: {}", e);
                        continue;
                    }
                };
                let Some((header, consumed)) = Header::decode(&buf[..len]) else {
                    continue;
                };
                let payload = &buf[consumed..len];
                let mut connections = self.connections.lock().await;
                if let Some((stored_addr, conn)) = connections.get_mut(&header.connection_id) {
                    *stored_addr = addr;
                    if let Err(e) = conn.on_packet(&header, payload) {
                        log::debug!("uTP connection {} error: {}", header.connection_id, e);
                    }
                } else if header.ty == PacketType::Syn {
                    let mut conn = Connection::new_responder(header.connection_id);
                    conn.registered_with_socket = true;
                    let _ = conn.on_packet(&header, payload);
                    // index by our own recv id: the initiator's subsequent
                    // packets carry its send id, which equals our recv id.
                    connections.insert(conn.conn_id_recv, (addr, conn));
                }
            }
        });
    }

    fn spawn_tick_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(100));
            loop {
                tick.tick().await;
                let mut to_resend: Vec<(SocketAddr, u16, u16, Vec<u8>)> = Vec::new();
                let mut connections = self.connections.lock().await;
                connections.retain(|_, (_, conn)| !matches!(conn.state, ConnState::Closed));
                for (&id, (addr, conn)) in connections.iter_mut() {
                    match conn.poll_timeouts() {
                        Ok(resend) => {
                            for (seq, payload) in resend {
                                to_resend.push((*addr, id, seq, payload));
                            }
                        }
                        Err(e) => log::debug!("uTP connection {} gave up retrying: {}", id, e),
                    }
                }
                drop(connections);
                for (addr, conn_id, seq_nr, payload) in to_resend {
                    let header = Header {
                        ty: PacketType::Data,
                        extension: 0,
                        connection_id: conn_id,
                        timestamp_us: 0,
                        timestamp_diff_us: 0,
                        wnd_size: 0,
                        seq_nr,
                        ack_nr: 0,
                    };
                    let _ = self.send_header(addr, &header, &payload).await;
                }
            }
        });
    }
}
