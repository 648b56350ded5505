use crate::{Frame, FrameCodec, FrameHeader, Message, MessageType, ProtocolError, HEADER_LEN};
use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Any reliable byte stream a [`Connection`] can run over
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

#[derive(Error, Debug)]
pub enum ConnectionError {
    /// End of stream before the first byte of a new transfer
    #[error("Connection closed by peer")]
    Closed,

    /// End of stream in the middle of a transfer
    #[error("Connection closed after {received} of {expected} bytes")]
    Truncated { received: usize, expected: usize },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ConnectionError {
    /// Clean peer disconnect, as opposed to a failure
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionError::Closed)
    }

    /// A well-formed message of the wrong type for the current exchange
    pub fn unexpected(expected: MessageType, actual: &Message) -> Self {
        ConnectionError::Protocol(ProtocolError::UnexpectedMessage {
            expected,
            actual: actual.message_type(),
        })
    }
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

/// One socket and the framed message exchange built on it.
///
/// Any error leaves the connection unusable; reconnecting is the caller's
/// job. The most recent failure is kept as text for diagnostics only.
pub struct Connection<S = TcpStream> {
    stream: S,
    codec: FrameCodec,
    peer: String,
    io_timeout: Option<Duration>,
    last_error: Option<String>,
}

impl Connection<TcpStream> {
    /// Open a TCP connection to `address`
    pub async fn connect(address: &str, io_timeout: Duration) -> Result<Self> {
        let stream = with_timeout(Some(io_timeout), TcpStream::connect(address)).await??;
        stream.set_nodelay(true)?;

        Ok(Connection::new(stream, address, Some(io_timeout)))
    }

    /// Wrap an accepted socket
    pub fn from_accepted(stream: TcpStream, io_timeout: Duration) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Connection::new(stream, peer, Some(io_timeout))
    }
}

impl<S: Transport> Connection<S> {
    pub fn new(stream: S, peer: impl Into<String>, io_timeout: Option<Duration>) -> Self {
        Connection {
            stream,
            codec: FrameCodec,
            peer: peer.into(),
            io_timeout,
            last_error: None,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Description of the most recent failure
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Write every byte of `data`, retrying short writes
    pub async fn send_all(&mut self, data: &[u8]) -> Result<()> {
        let result = self.write_fully(data).await;
        self.track(result)
    }

    /// Fill `buf` completely from the stream
    pub async fn recv_all(&mut self, buf: &mut [u8]) -> Result<()> {
        let result = self.read_fully(buf).await;
        self.track(result)
    }

    pub async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.payload.len());
        let encoded = self.codec.encode(frame, &mut buf).map_err(ConnectionError::from);
        self.track(encoded)?;
        self.send_all(&buf).await
    }

    pub async fn receive_frame(&mut self) -> Result<Frame> {
        let result = self.read_frame().await;
        self.track(result)
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        self.send_frame(message.to_frame()).await
    }

    /// Receive the next frame and interpret it.
    ///
    /// An unknown message tag is reported as a recoverable
    /// [`ProtocolError::InvalidMessageType`]; the stream stays aligned.
    pub async fn receive_message(&mut self) -> Result<Message> {
        let frame = self.receive_frame().await?;
        let message = Message::from_frame(&frame).map_err(ConnectionError::from);
        self.track(message)
    }

    /// Shut down the write half; errors are ignored
    pub async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown of connection to {} failed: {}", self.peer, e);
        }
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        let mut header = [0u8; HEADER_LEN];
        self.read_fully(&mut header).await?;
        let parsed = FrameHeader::parse(&header)?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + parsed.length);
        buf.extend_from_slice(&header);
        buf.resize(HEADER_LEN + parsed.length, 0);

        self.read_fully(&mut buf[HEADER_LEN..])
            .await
            .map_err(|e| match e {
                ConnectionError::Closed => ConnectionError::Truncated {
                    received: HEADER_LEN,
                    expected: HEADER_LEN + parsed.length,
                },
                ConnectionError::Truncated { received, expected } => ConnectionError::Truncated {
                    received: HEADER_LEN + received,
                    expected: HEADER_LEN + expected,
                },
                other => other,
            })?;

        self.codec.decode(&mut buf)?.ok_or(ConnectionError::Truncated {
            received: buf.len(),
            expected: HEADER_LEN + parsed.length,
        })
    }

    async fn write_fully(&mut self, data: &[u8]) -> Result<()> {
        let limit = self.io_timeout;
        let mut sent = 0;

        while sent < data.len() {
            match with_timeout(limit, self.stream.write(&data[sent..])).await? {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("transport accepted 0 bytes after {} of {}", sent, data.len()),
                    )
                    .into())
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        with_timeout(limit, self.stream.flush()).await??;
        Ok(())
    }

    async fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        let limit = self.io_timeout;
        let expected = buf.len();
        let mut received = 0;

        while received < expected {
            match with_timeout(limit, self.stream.read(&mut buf[received..])).await? {
                Ok(0) if received == 0 => return Err(ConnectionError::Closed),
                Ok(0) => return Err(ConnectionError::Truncated { received, expected }),
                Ok(n) => received += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error = Some(e.to_string());
        }
        result
    }
}

async fn with_timeout<F: Future>(limit: Option<Duration>, fut: F) -> Result<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ConnectionError::Timeout(limit)),
        None => Ok(fut.await),
    }
}
