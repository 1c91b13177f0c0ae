//! # MCS Transport
//!
//! The byte stream under an MCS connection and the frame codec on top of it.
//!
//! ## Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  McsConnection                                                          │
//! │     │ McsMessage                                                        │
//! │     ▼                                                                   │
//! │  FrameWriter / FrameReader   [version?][tag][varint32 len][payload]     │
//! │     │ bytes                                                             │
//! │     ▼                                                                   │
//! │  BoxedStream ◄── Dialer::dial(host, port)                               │
//! │                    TlsDialer: TCP + TLS (native-tls)                    │
//! │                    tests:     in-memory duplex pipe                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use fmdn_core::wire::{self, RawFrame};
use fmdn_core::{McsMessage, McsTag, VarintDecoder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{PushError, PushResult};

/// A bidirectional byte stream an MCS session can run over.
pub trait McsStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> McsStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased stream handed out by a [`Dialer`].
pub type BoxedStream = Box<dyn McsStream>;

// =============================================================================
// Dialers
// =============================================================================

/// Opens streams to the MCS server.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> PushResult<BoxedStream>;
}

/// TCP + TLS dialer using the platform TLS stack.
#[derive(Debug, Clone, Default)]
pub struct TlsDialer;

impl TlsDialer {
    pub fn new() -> Self {
        TlsDialer
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, host: &str, port: u16) -> PushResult<BoxedStream> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| PushError::ConnectionFailed(format!("tcp connect to {}:{}: {}", host, port, e)))?;
        tcp.set_nodelay(true).ok();

        let connector = native_tls::TlsConnector::new()
            .map_err(|e| PushError::ConnectionFailed(format!("tls setup: {}", e)))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let stream = connector
            .connect(host, tcp)
            .await
            .map_err(|e| PushError::ConnectionFailed(format!("tls handshake: {}", e)))?;

        debug!(host, port, "TLS session established");
        Ok(Box::new(stream))
    }
}

// =============================================================================
// Frame Reader
// =============================================================================

/// Reads frames, expecting the version byte before the first one.
pub struct FrameReader<R> {
    inner: R,
    version_seen: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner,
            version_seen: false,
        }
    }

    /// Reads the next frame.
    ///
    /// End of stream surfaces as [`PushError::ReadFailed`].
    pub async fn read_frame(&mut self) -> PushResult<RawFrame> {
        if !self.version_seen {
            let version = self.inner.read_u8().await?;
            wire::check_version(version)?;
            self.version_seen = true;
        }

        let tag = self.inner.read_u8().await?;

        let mut decoder = VarintDecoder::new();
        let len = loop {
            let byte = self.inner.read_u8().await?;
            if let Some(len) = decoder.push(byte)? {
                break len;
            }
        };
        let len = wire::check_frame_len(len)?;

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        Ok(RawFrame { tag, payload })
    }

    /// Reads and decodes the next message.
    pub async fn read_message(&mut self) -> PushResult<McsMessage> {
        let frame = self.read_frame().await?;
        Ok(McsMessage::decode(&frame)?)
    }
}

// =============================================================================
// Frame Writer
// =============================================================================

/// Writes frames, prefixing the version byte to the first one.
pub struct FrameWriter<W> {
    inner: W,
    version_sent: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        FrameWriter {
            inner,
            version_sent: false,
        }
    }

    /// Encodes and flushes one message.
    pub async fn write_message(&mut self, message: &McsMessage) -> PushResult<()> {
        let (tag, payload) = message
            .encode()
            .ok_or_else(|| PushError::ChannelError(format!("{} cannot be sent", message.kind())))?;
        self.write_frame(tag, &payload).await
    }

    /// Writes and flushes one frame with an already serialized body.
    pub async fn write_frame(&mut self, tag: McsTag, payload: &[u8]) -> PushResult<()> {
        let frame = wire::encode_frame(tag, payload, !self.version_sent);
        self.inner
            .write_all(&frame)
            .await
            .map_err(|e| PushError::ConnectionFailed(format!("write failed: {}", e)))?;
        self.inner
            .flush()
            .await
            .map_err(|e| PushError::ConnectionFailed(format!("flush failed: {}", e)))?;
        self.version_sent = true;
        Ok(())
    }

    /// Shuts down the write side (TLS close_notify for TLS streams).
    pub async fn shutdown(&mut self) -> PushResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fmdn_core::message::heartbeat_ping;
    use fmdn_core::wire::{McsTag, MCS_VERSION};
    use fmdn_core::CoreError;

    #[tokio::test]
    async fn test_version_byte_only_on_first_frame() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        writer.write_message(&heartbeat_ping(1)).await.unwrap();
        writer.write_message(&heartbeat_ping(2)).await.unwrap();
        drop(writer);

        let mut bytes = Vec::new();
        server.read_to_end(&mut bytes).await.unwrap();

        let (tag, first) = heartbeat_ping(1).encode().unwrap();
        let (_, second) = heartbeat_ping(2).encode().unwrap();
        let mut expected = wire::encode_frame(tag, &first, true);
        expected.extend(wire::encode_frame(tag, &second, false));

        assert_eq!(bytes[0], MCS_VERSION);
        assert_eq!(bytes, expected);
    }

    #[tokio::test]
    async fn test_reader_decodes_writer_output() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.write_message(&heartbeat_ping(7)).await.unwrap();
        writer.write_message(&McsMessage::Close).await.unwrap();

        assert_eq!(reader.read_message().await.unwrap(), heartbeat_ping(7));
        assert_eq!(reader.read_message().await.unwrap(), McsMessage::Close);
    }

    #[tokio::test]
    async fn test_reader_rejects_bad_version() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0x07, 0x00, 0x00]).await.unwrap();

        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.read_frame().await,
            Err(PushError::Protocol(CoreError::UnsupportedVersion(0x07)))
        ));
    }

    #[tokio::test]
    async fn test_reader_rejects_oversize_frame() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut bytes = vec![MCS_VERSION, McsTag::DataMessageStanza.as_u8()];
        wire::encode_varint32(wire::MAX_FRAME_SIZE + 1, &mut bytes);
        client.write_all(&bytes).await.unwrap();

        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.read_frame().await,
            Err(PushError::Protocol(CoreError::FrameTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_eof_is_read_error() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server);
        assert!(matches!(reader.read_frame().await, Err(PushError::ReadFailed(_))));
    }
}
