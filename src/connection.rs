//! One physical socket to a CoralDB server.
//!
//! A [`Connection`] performs the TCP connect (with a driver-enforced
//! timeout), the optional TLS upgrade, the magic preamble and the
//! authentication round trip, then hands its framed read/write halves to the
//! pipeline dispatcher.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;

use crate::error::{Error, Result};
use crate::protocol::{codec, Command, ServerMessage, CLIENT_MAGIC, MAX_MESSAGE_SIZE};
use crate::session::config::{SslMode, TlsOptions};

/// The underlying byte stream, plain or TLS-wrapped.
pub(crate) enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Format a dialable address, bracketing IPv6 literals.
fn format_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// One established, authenticated-capable connection.
pub(crate) struct Connection {
    stream: Stream,
    peer: String,
}

impl Connection {
    /// Open a socket to `host:port`, upgrade to TLS when requested and send
    /// the magic preamble.
    ///
    /// The connect timeout is enforced here, independent of any OS default;
    /// a zero timeout means wait indefinitely.
    pub async fn open(
        host: &str,
        port: u16,
        tls: &TlsOptions,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let addr = format_addr(host, port);
        let connect = TcpStream::connect(&addr);
        let tcp = if connect_timeout.is_zero() {
            connect.await
        } else {
            match tokio::time::timeout(connect_timeout, connect).await {
                Ok(res) => res,
                Err(_) => {
                    return Err(Error::Communications(format!(
                        "connect to {} timed out after {}ms",
                        addr,
                        connect_timeout.as_millis()
                    )))
                }
            }
        }
        .map_err(|e| Error::Communications(format!("failed to connect to {}: {}", addr, e)))?;

        tcp.set_nodelay(true)
            .map_err(|e| Error::Communications(format!("failed to set TCP_NODELAY: {}", e)))?;

        let stream = match tls.mode {
            SslMode::Disabled => Stream::Plain(tcp),
            SslMode::Required | SslMode::VerifyCa => {
                Stream::Tls(Box::new(tls_handshake(host, tcp, tls).await?))
            }
        };

        let mut conn = Self { stream, peer: addr };

        conn.stream
            .write_all(CLIENT_MAGIC)
            .await
            .map_err(|e| Error::Communications(format!("failed to send magic header: {}", e)))?;
        conn.stream
            .flush()
            .await
            .map_err(|e| Error::Communications(format!("failed to flush: {}", e)))?;

        tracing::debug!("connected to {}", conn.peer);
        Ok(conn)
    }

    /// Perform the authentication round trip. Runs before pipelining starts,
    /// so reading the reply inline is safe.
    pub async fn authenticate(
        &mut self,
        schema: &str,
        username: &str,
        password: &str,
    ) -> Result<String> {
        let frame = codec::encode_command(&Command::Auth {
            schema: schema.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })?;
        self.write_frame(&frame).await?;

        match self.read_frame().await? {
            ServerMessage::AuthOk { session_id } => Ok(session_id),
            ServerMessage::Error { code, message } => Err(Error::Server { code, message }),
            other => Err(Error::Communications(format!(
                "unexpected message during authentication: {:?}",
                other
            ))),
        }
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        write_frame(&mut self.stream, frame).await
    }

    pub async fn read_frame(&mut self) -> Result<ServerMessage> {
        read_frame(&mut self.stream).await
    }

    /// Split into framed halves for the dispatcher's reader and writer
    /// tasks.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let peer = self.peer;
        let (read, write) = tokio::io::split(self.stream);
        (
            FrameReader {
                inner: read,
                peer: peer.clone(),
            },
            FrameWriter { inner: write, peer },
        )
    }
}

async fn tls_handshake(
    host: &str,
    tcp: TcpStream,
    tls: &TlsOptions,
) -> Result<TlsStream<TcpStream>> {
    let mut builder = native_tls::TlsConnector::builder();
    match tls.mode {
        SslMode::Required => {
            // Encrypted but unauthenticated: any certificate is accepted.
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        SslMode::VerifyCa => {
            let path = tls.ca_path.as_ref().ok_or_else(|| {
                Error::Usage("ssl-mode verify-ca requires a trust store path".to_string())
            })?;
            let pem = std::fs::read(path).map_err(|e| {
                Error::Communications(format!(
                    "failed to read trust store {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let cert = native_tls::Certificate::from_pem(&pem).map_err(|e| {
                Error::Communications(format!("invalid trust store certificate: {}", e))
            })?;
            builder.add_root_certificate(cert);
        }
        SslMode::Disabled => unreachable!("tls_handshake called with ssl disabled"),
    }
    let connector = builder
        .build()
        .map_err(|e| Error::Communications(format!("TLS setup failed: {}", e)))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    connector
        .connect(host, tcp)
        .await
        .map_err(|e| Error::Communications(format!("TLS handshake with {} failed: {}", host, e)))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer
        .write_all(frame)
        .await
        .map_err(|e| Error::Communications(format!("write failed: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Communications(format!("flush failed: {}", e)))?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ServerMessage> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Communications("connection closed by server".to_string())
        } else {
            Error::Communications(format!("read failed: {}", e))
        }
    })?;

    let msg_len = u32::from_be_bytes(len_buf) as usize;
    if msg_len > MAX_MESSAGE_SIZE {
        return Err(Error::MalformedFrame(format!(
            "frame length {} exceeds maximum",
            msg_len
        )));
    }

    let mut payload = vec![0u8; msg_len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::Communications(format!("read payload failed: {}", e)))?;

    codec::decode_message(&payload)
}

/// The read half of a connection, owned exclusively by the dispatcher's
/// reader task.
pub(crate) struct FrameReader {
    inner: ReadHalf<Stream>,
    peer: String,
}

impl FrameReader {
    pub async fn read_frame(&mut self) -> Result<ServerMessage> {
        read_frame(&mut self.inner).await
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// The write half of a connection, owned exclusively by the dispatcher's
/// writer task.
pub(crate) struct FrameWriter {
    inner: WriteHalf<Stream>,
    peer: String,
}

impl FrameWriter {
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        write_frame(&mut self.inner, frame).await
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}
