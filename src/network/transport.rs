//! Transport seam shared by real sockets and the in-process virtual network.
//!
//! A `Connection` moves whole frames. Over TCP the frames are length
//! prefixed (see `wire`); the virtual network hands frames across channels.

use crate::error::NetError;
use crate::network::message::Message;
use crate::network::wire;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait FrameReader: Send {
    /// Next frame, or Ok(None) once the remote side closed.
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, NetError>;
}

#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), NetError>;
    async fn close(&mut self);
}

pub struct Connection {
    pub local_addr: String,
    pub remote_addr: String,
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
}

impl Connection {
    pub async fn send(&mut self, message: &Message) -> Result<(), NetError> {
        let frame = wire::encode(message)?;
        self.writer.write_frame(&frame).await
    }

    pub async fn recv(&mut self) -> Result<Option<Message>, NetError> {
        match self.reader.read_frame().await? {
            Some(frame) => Ok(Some(wire::decode(&frame)?)),
            None => Ok(None),
        }
    }

    pub async fn close(mut self) {
        self.writer.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<Connection, NetError>;
    fn local_addr(&self) -> String;
    /// Unblocks pending and future `accept` calls with `NetError::Closed`.
    fn close(&self);
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<Connection, NetError>;
}

struct TcpFrameReader(BufReader<OwnedReadHalf>);

#[async_trait]
impl FrameReader for TcpFrameReader {
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, NetError> {
        wire::read_frame(&mut self.0).await
    }
}

struct TcpFrameWriter(BufWriter<OwnedWriteHalf>);

#[async_trait]
impl FrameWriter for TcpFrameWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), NetError> {
        wire::write_frame(&mut self.0, frame).await
    }

    async fn close(&mut self) {
        let _ = self.0.shutdown().await;
    }
}

fn tcp_connection(stream: TcpStream) -> Result<Connection, NetError> {
    let _ = stream.set_nodelay(true);
    let local_addr = stream.local_addr()?.to_string();
    let remote_addr = stream.peer_addr()?.to_string();
    let (reader, writer) = stream.into_split();
    Ok(Connection {
        local_addr,
        remote_addr,
        reader: Box::new(TcpFrameReader(BufReader::new(reader))),
        writer: Box::new(TcpFrameWriter(BufWriter::new(writer))),
    })
}

pub struct TcpTransportListener {
    listener: TcpListener,
    local_addr: String,
    closed: CancellationToken,
}

impl TcpTransportListener {
    pub async fn bind(addr: &str) -> Result<Self, NetError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?.to_string();
        Ok(Self {
            listener,
            local_addr,
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Listener for TcpTransportListener {
    async fn accept(&self) -> Result<Connection, NetError> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(NetError::Closed),
            accepted = self.listener.accept() => {
                let (stream, _) = accepted?;
                tcp_connection(stream)
            }
        }
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

pub struct TcpDialer {
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<Connection, NetError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetError::DialTimeout(addr.to_string()))??;
        tcp_connection(stream)
    }
}
