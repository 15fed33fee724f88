use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::UdpSocket;

use super::error::{
    is_buffer_full, is_destination_error, is_would_block, ChannelError, StartupError,
};
use super::protocol::{Message, ProtocolError, MAX_DATAGRAM_SIZE};
use super::stats::NetworkStats;

#[derive(Debug)]
pub enum DiscardReason {
    UnknownSource,
    Malformed(ProtocolError),
}

#[derive(Debug)]
pub enum Datagram<T> {
    Received {
        source: T,
        from: SocketAddr,
        message: Message,
    },
    Discarded {
        from: SocketAddr,
        reason: DiscardReason,
    },
    /// Nothing left to read.
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    /// The socket was not writable; the datagram was dropped.
    Skipped,
    /// The OS refused this destination. The channel stays usable.
    Failed,
}

/// A connectionless datagram endpoint. Each receive yields one whole
/// message or nothing; each send is fire-and-forget.
pub struct UnreliableChannel {
    socket: UdpSocket,
    writable: bool,
    stats: Arc<NetworkStats>,
    buf: Vec<u8>,
}

impl UnreliableChannel {
    pub fn bind(addr: SocketAddr, stats: Arc<NetworkStats>) -> Result<Self, StartupError> {
        let socket = UdpSocket::bind(addr).map_err(|source| StartupError::Bind {
            what: "unreliable channel",
            addr,
            source,
        })?;
        Ok(Self::new(socket, stats))
    }

    pub fn new(socket: UdpSocket, stats: Arc<NetworkStats>) -> Self {
        Self {
            socket,
            writable: false,
            stats,
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn socket_mut(&mut self) -> &mut UdpSocket {
        &mut self.socket
    }

    pub fn stats(&self) -> &Arc<NetworkStats> {
        &self.stats
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    /// Receives one datagram. `resolve` maps the source address to a known
    /// peer; datagrams from anyone else are discarded before decoding.
    pub fn recv<T>(
        &mut self,
        resolve: impl FnOnce(SocketAddr) -> Option<T>,
    ) -> Result<Datagram<T>, ChannelError> {
        let (len, from) = loop {
            match self.socket.recv_from(&mut self.buf) {
                Ok(received) => break received,
                Err(e) if is_would_block(&e) => return Ok(Datagram::Drained),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // ICMP echoes of an earlier send; nothing to deliver.
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let Some(source) = resolve(from) else {
            self.stats.record_malformed();
            return Ok(Datagram::Discarded {
                from,
                reason: DiscardReason::UnknownSource,
            });
        };

        self.stats.record_received(len);
        match Message::decode(&self.buf[..len]) {
            Ok(message) => Ok(Datagram::Received {
                source,
                from,
                message,
            }),
            Err(e) => {
                self.stats.record_malformed();
                Ok(Datagram::Discarded {
                    from,
                    reason: DiscardReason::Malformed(e),
                })
            }
        }
    }

    pub fn send_to(&mut self, frame: &[u8], addr: SocketAddr) -> Result<SendStatus, ChannelError> {
        if !self.writable {
            self.stats.record_skipped();
            return Ok(SendStatus::Skipped);
        }

        loop {
            match self.socket.send_to(frame, addr) {
                Ok(_) => {
                    self.stats.record_sent(frame.len());
                    return Ok(SendStatus::Sent);
                }
                Err(e) if is_buffer_full(&e) => {
                    self.writable = false;
                    self.stats.record_skipped();
                    return Ok(SendStatus::Skipped);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_destination_error(&e) => {
                    log::debug!("Send to {} refused: {}", addr, e);
                    self.stats.record_failed();
                    return Ok(SendStatus::Failed);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn send_message(
        &mut self,
        message: &Message,
        addr: SocketAddr,
    ) -> Result<SendStatus, ChannelError> {
        let frame = message.encode()?;
        self.send_to(&frame, addr)
    }
}
