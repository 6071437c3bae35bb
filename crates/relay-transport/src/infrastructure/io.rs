//! Byte-level halves of a physical connection, as seen by the driver.
//!
//! The driver does not care whether it reads a TCP stream, a datagram queue
//! or an in-process pipe; it only needs "give me the next chunk" and "write
//! these bytes".  These traits are `?Send`: both halves live on one worker
//! for the connection's whole life.

use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Source of received chunks.  `Ok(None)` means the peer is gone.
#[async_trait(?Send)]
pub(crate) trait Inbound {
    async fn recv(&mut self) -> io::Result<Option<Bytes>>;
}

/// Sink for outgoing bytes.
#[async_trait(?Send)]
pub(crate) trait Outbound {
    async fn send(&mut self, data: &Bytes) -> io::Result<()>;

    /// Flushes and closes the sending direction.
    async fn shutdown(&mut self) -> io::Result<()>;
}

// ── Streams (TCP, pipe) ───────────────────────────────────────────────────────

pub(crate) struct StreamInbound<R> {
    reader: R,
    buffer: BytesMut,
    chunk: usize,
}

impl<R> StreamInbound<R> {
    pub(crate) fn new(reader: R, chunk: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(chunk),
            chunk: chunk.max(1),
        }
    }
}

#[async_trait(?Send)]
impl<R: AsyncRead + Unpin> Inbound for StreamInbound<R> {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        self.buffer.reserve(self.chunk);
        let n = self.reader.read_buf(&mut self.buffer).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buffer.split().freeze()))
    }
}

pub(crate) struct StreamOutbound<W> {
    writer: W,
}

impl<W> StreamOutbound<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait(?Send)]
impl<W: AsyncWrite + Unpin> Outbound for StreamOutbound<W> {
    async fn send(&mut self, data: &Bytes) -> io::Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

// ── Accepted UDP peers ────────────────────────────────────────────────────────

/// Datagrams routed to one peer by the acceptor's demultiplexer.
pub(crate) struct DatagramInbound {
    rx: mpsc::Receiver<Bytes>,
}

impl DatagramInbound {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }
}

#[async_trait(?Send)]
impl Inbound for DatagramInbound {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

/// Replies to one peer through the shared listening socket.
pub(crate) struct DatagramOutbound {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl DatagramOutbound {
    pub(crate) fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

#[async_trait(?Send)]
impl Outbound for DatagramOutbound {
    async fn send(&mut self, data: &Bytes) -> io::Result<()> {
        self.socket.send_to(data, self.peer).await.map(|_| ())
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Connected UDP ─────────────────────────────────────────────────────────────

/// Both halves of a connected UDP socket share it on one worker.
pub(crate) fn connected_udp(socket: UdpSocket, max_datagram: usize) -> (ConnectedUdpInbound, ConnectedUdpOutbound) {
    let socket = Rc::new(socket);
    (
        ConnectedUdpInbound {
            socket: Rc::clone(&socket),
            buffer: vec![0; max_datagram.max(1)],
        },
        ConnectedUdpOutbound { socket },
    )
}

pub(crate) struct ConnectedUdpInbound {
    socket: Rc<UdpSocket>,
    buffer: Vec<u8>,
}

#[async_trait(?Send)]
impl Inbound for ConnectedUdpInbound {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        let n = self.socket.recv(&mut self.buffer).await?;
        Ok(Some(Bytes::copy_from_slice(&self.buffer[..n])))
    }
}

pub(crate) struct ConnectedUdpOutbound {
    socket: Rc<UdpSocket>,
}

#[async_trait(?Send)]
impl Outbound for ConnectedUdpOutbound {
    async fn send(&mut self, data: &Bytes) -> io::Result<()> {
        self.socket.send(data).await.map(|_| ())
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
