use std::fmt;

use bytes::Bytes;
use error_stack::ResultExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    net::{TcpStream, UnixStream},
    sync::Mutex,
};

use crate::{
    error::Result,
    wire::{self, Header},
};

/// Unifies `TcpStream` and `UnixStream` behind one boxed, splittable stream so the rest of the
/// crate doesn't need to care which transport a [`Connection`] rides on.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub(crate) type BoxedStream = Box<dyn Stream>;

pub(crate) enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl From<TcpStream> for Socket {
    fn from(stream: TcpStream) -> Self {
        Self::Tcp(stream)
    }
}

impl From<UnixStream> for Socket {
    fn from(stream: UnixStream) -> Self {
        Self::Unix(stream)
    }
}

impl Socket {
    fn boxed(self) -> BoxedStream {
        match self {
            Self::Tcp(s) => Box::new(s),
            Self::Unix(s) => Box::new(s),
        }
    }
}

/// A single canonical connection to a peer: a write half guarded by a mutex (so concurrent
/// requests may interleave safely) and the peer's remote address for diagnostics.
pub struct Connection {
    writer: Mutex<WriteHalf<BoxedStream>>,
    peer_addr: String,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(socket: impl Into<Socket>, peer_addr: String) -> (Self, ReadHalf<BoxedStream>) {
        let (read, write) = tokio::io::split(socket.into().boxed());
        (
            Self {
                writer: Mutex::new(write),
                peer_addr,
            },
            read,
        )
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub async fn send(&self, header: &Header, attachments: &[Bytes]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        wire::write_message(&mut *writer, header, attachments).await
    }

    pub async fn close(&self) {
        use tokio::io::AsyncWriteExt;
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

pub(crate) async fn read_header(
    reader: &mut ReadHalf<BoxedStream>,
) -> Result<(Header, Vec<Bytes>)> {
    wire::read_message(reader)
        .await
        .attach_printable("while reading from connection")
}

#[allow(dead_code)]
fn _assert_send(_: &Connection) {
    fn is_send<T: Send>() {}
    is_send::<Connection>();
}
