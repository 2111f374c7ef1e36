//! Framed connections over plain or TLS-wrapped sockets

use crate::error::{Error, Result};
use crate::protocol::{Frame, FrameParser, Packet};
use crate::tls;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Any byte stream a connection can run over
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Stream for T {}

/// Type-erased stream, plain TCP or already secured
pub type BoxedStream = Box<dyn Stream>;

/// Protocol state of a worker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// May ask for work
    Awake,
    /// Sent PRE_SLEEP, waiting for NOOP
    Sleep,
    /// Socket is gone
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Awake => "AWAKE",
            ConnectionState::Sleep => "SLEEP",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Read side of a connection
pub struct FrameReader {
    reader: ReadHalf<BoxedStream>,
    parser: FrameParser,
    buffer: Vec<u8>,
}

impl FrameReader {
    /// Read the next frame, suspending until one is complete
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if the peer closes the socket, or a
    /// protocol error for malformed input.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.parser.parse()? {
                return Ok(frame);
            }

            let n = self.reader.read(&mut self.buffer).await?;
            if n == 0 {
                if self.parser.buffered() > 0 {
                    debug!("Peer closed mid-frame");
                }
                return Err(Error::ConnectionClosed);
            }
            self.parser.feed(&self.buffer[..n]);
        }
    }

    /// Read the next binary packet; admin text is not valid here
    ///
    /// # Errors
    ///
    /// As [`FrameReader::read_frame`], plus a protocol error on text input.
    pub async fn read_packet(&mut self) -> Result<Packet> {
        match self.read_frame().await? {
            Frame::Packet(packet) => Ok(packet),
            Frame::Text(line) => Err(Error::Protocol(format!(
                "Unexpected text line from server: {line}"
            ))),
        }
    }
}

/// Write side of a connection.
///
/// Cloning shares the underlying socket; a write lock keeps frames from
/// interleaving.
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<WriteHalf<BoxedStream>>>,
}

impl FrameWriter {
    /// Send one frame
    ///
    /// # Errors
    ///
    /// Returns an error if the socket write fails.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode();
        let mut writer = self.inner.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send one packet
    ///
    /// # Errors
    ///
    /// Returns an error if the socket write fails.
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        debug!("-> {:?} ({} bytes)", packet.ptype, packet.data.len());
        let bytes = packet.encode();
        let mut writer = self.inner.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send several packets under a single lock acquisition
    ///
    /// # Errors
    ///
    /// Returns an error if the socket write fails.
    pub async fn send_packets(&self, packets: &[Packet]) -> Result<()> {
        let mut writer = self.inner.lock().await;
        for packet in packets {
            debug!("-> {:?} ({} bytes)", packet.ptype, packet.data.len());
            writer.write_all(&packet.encode()).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Lock the writer for a sequence of writes that must stay contiguous
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, WriteHalf<BoxedStream>> {
        self.inner.lock().await
    }

    /// Close the write side
    pub async fn shutdown(&self) {
        let mut writer = self.inner.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Split a stream into framed read and write halves
pub fn split(stream: BoxedStream, max_payload_size: u32) -> (FrameReader, FrameWriter) {
    let (reader, writer) = tokio::io::split(stream);
    (
        FrameReader {
            reader,
            parser: FrameParser::with_max_payload(max_payload_size),
            buffer: vec![0u8; 4096],
        },
        FrameWriter {
            inner: Arc::new(Mutex::new(writer)),
        },
    )
}

/// Write and flush one packet through an already locked writer
///
/// # Errors
///
/// Returns an error if the socket write fails.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    debug!("-> {:?} ({} bytes)", packet.ptype, packet.data.len());
    writer.write_all(&packet.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Dial a server, wrapping the socket in TLS when a connector is given
///
/// # Errors
///
/// Returns an error if the TCP connect or TLS handshake fails.
pub async fn connect(host: &str, port: u16, tls: Option<&TlsConnector>) -> Result<BoxedStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;

    match tls {
        Some(connector) => {
            let name = tls::server_name(host)?;
            let stream = connector.connect(name, stream).await?;
            debug!("TLS handshake with {}:{} complete", host, port);
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(stream)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketType;

    #[tokio::test]
    async fn test_packet_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let (_, writer) = split(Box::new(a), 1024);
        let (mut reader, _) = split(Box::new(b), 1024);

        let packet = Packet::request(PacketType::EchoReq, &[b"ping"]);
        writer.send_packet(&packet).await.unwrap();

        assert_eq!(reader.read_packet().await.unwrap(), packet);
    }

    #[tokio::test]
    async fn test_closed_mid_read() {
        let (a, b) = tokio::io::duplex(1024);
        let (mut reader, _) = split(Box::new(b), 1024);

        {
            let (_, writer) = split(Box::new(a), 1024);
            let mut guard = writer.lock().await;
            guard.write_all(b"\0RES\0\0\0").await.unwrap();
        }

        let result = reader.read_packet().await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_text_rejected_by_read_packet() {
        let (a, b) = tokio::io::duplex(1024);
        let (_, writer) = split(Box::new(a), 1024);
        let (mut reader, _) = split(Box::new(b), 1024);

        writer.send_frame(&Frame::Text("status".to_string())).await.unwrap();
        assert!(matches!(reader.read_packet().await, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Sleep.to_string(), "SLEEP");
    }
}
