//! Read-shape adapters for session payloads.
//!
//! Each payload chunk on the multiplexed connection is `[u16 BE length][bytes]`.
//! Stream sessions may carry any number of bytes per chunk and are handed out
//! in [`BUFFER_SIZE`] slices; packet sessions carry exactly one datagram that
//! must fit in a single buffer.

use crate::buf::{BufferedReader, MultiBuffer, Reader, BUFFER_SIZE};
use crate::error::{MuxError, MuxResult};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use tokio::io::AsyncRead;

/// How a session's payload is shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    Stream,
    Packet,
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => f.write_str("stream"),
            Self::Packet => f.write_str("packet"),
        }
    }
}

impl FromStr for TransferType {
    type Err = MuxError;

    fn from_str(s: &str) -> MuxResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stream" | "tcp" => Ok(Self::Stream),
            "packet" | "udp" => Ok(Self::Packet),
            other => Err(MuxError::Other(format!(
                "unknown transfer type: {other} (expected stream or packet)"
            ))),
        }
    }
}

/// Reads one length-prefixed chunk as a byte stream.
pub struct StreamReader<'a, R> {
    reader: &'a mut BufferedReader<R>,
    /// Bytes left in the current chunk; `None` before the header is read.
    left_over: Option<usize>,
}

impl<'a, R: AsyncRead + Unpin + Send> StreamReader<'a, R> {
    pub fn new(reader: &'a mut BufferedReader<R>) -> Self {
        Self {
            reader,
            left_over: None,
        }
    }

    async fn next(&mut self) -> MuxResult<MultiBuffer> {
        let left_over = match self.left_over {
            Some(0) => {
                // Chunk exhausted: report EOF once, then start over.
                self.left_over = None;
                return Ok(MultiBuffer::new());
            }
            Some(n) => n,
            None => {
                let size = usize::from(self.reader.read_u16().await?);
                if size == 0 {
                    return Ok(MultiBuffer::new());
                }
                size
            }
        };

        let mb = self.reader.read_at_most(left_over).await?;
        self.left_over = Some(left_over - mb.len());
        Ok(mb)
    }
}

impl<R: AsyncRead + Unpin + Send> Reader for StreamReader<'_, R> {
    fn read_multi_buffer(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = MuxResult<MultiBuffer>> + Send + '_>> {
        Box::pin(self.next())
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = MuxResult<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// Reads exactly one length-prefixed packet.
pub struct PacketReader<'a, R> {
    reader: &'a mut BufferedReader<R>,
    eof: bool,
}

impl<'a, R: AsyncRead + Unpin + Send> PacketReader<'a, R> {
    pub fn new(reader: &'a mut BufferedReader<R>) -> Self {
        Self { reader, eof: false }
    }

    async fn next(&mut self) -> MuxResult<MultiBuffer> {
        if self.eof {
            return Ok(MultiBuffer::new());
        }

        let size = usize::from(self.reader.read_u16().await?);
        if size > BUFFER_SIZE {
            return Err(MuxError::PacketTooLarge(size));
        }

        let chunk = self.reader.read_chunk(size).await?;
        self.eof = true;

        let mut mb = MultiBuffer::new();
        mb.push(chunk);
        Ok(mb)
    }
}

impl<R: AsyncRead + Unpin + Send> Reader for PacketReader<'_, R> {
    fn read_multi_buffer(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = MuxResult<MultiBuffer>> + Send + '_>> {
        Box::pin(self.next())
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = MuxResult<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// Prefix `payload` with its big-endian `u16` length.
///
/// Fails with [`MuxError::ChunkTooLarge`] if the payload is longer than
/// `u16::MAX`.
pub fn encode_chunk(payload: &[u8]) -> MuxResult<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| MuxError::ChunkTooLarge(payload.len()))?;
    let mut chunk = Vec::with_capacity(2 + payload.len());
    chunk.extend_from_slice(&len.to_be_bytes());
    chunk.extend_from_slice(payload);
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_reader_slices_large_chunk() {
        let payload = vec![1u8; 5000];
        let wire = encode_chunk(&payload).unwrap();
        let mut buffered = BufferedReader::new(wire.as_slice());
        let mut reader = StreamReader::new(&mut buffered);

        let sizes = [
            reader.read_multi_buffer().await.unwrap().len(),
            reader.read_multi_buffer().await.unwrap().len(),
            reader.read_multi_buffer().await.unwrap().len(),
        ];
        assert_eq!(sizes, [2048, 2048, 904]);
        assert!(reader.read_multi_buffer().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_reader_continues_with_next_chunk() {
        let mut wire = encode_chunk(b"first").unwrap();
        wire.extend(encode_chunk(b"second").unwrap());
        let mut buffered = BufferedReader::new(wire.as_slice());

        let mut reader = StreamReader::new(&mut buffered);
        assert_eq!(reader.read_multi_buffer().await.unwrap().into_bytes(), b"first");
        assert!(reader.read_multi_buffer().await.unwrap().is_empty());
        assert_eq!(reader.read_multi_buffer().await.unwrap().into_bytes(), b"second");
    }

    #[tokio::test]
    async fn packet_reader_returns_one_packet() {
        let mut wire = encode_chunk(b"datagram").unwrap();
        wire.extend(encode_chunk(b"next").unwrap());
        let mut buffered = BufferedReader::new(wire.as_slice());

        {
            let mut reader = PacketReader::new(&mut buffered);
            let mb = reader.read_multi_buffer().await.unwrap();
            assert_eq!(mb.chunk_count(), 1);
            assert_eq!(mb.into_bytes(), b"datagram");
            assert!(reader.read_multi_buffer().await.unwrap().is_empty());
        }

        // The shared source is positioned at the following chunk.
        let mut reader = PacketReader::new(&mut buffered);
        assert_eq!(reader.read_multi_buffer().await.unwrap().into_bytes(), b"next");
    }

    #[tokio::test]
    async fn packet_reader_rejects_oversized_packet() {
        let wire = encode_chunk(&vec![0u8; BUFFER_SIZE + 1]).unwrap();
        let mut buffered = BufferedReader::new(wire.as_slice());
        let mut reader = PacketReader::new(&mut buffered);
        let err = reader.read_multi_buffer().await.unwrap_err();
        assert!(matches!(err, MuxError::PacketTooLarge(n) if n == BUFFER_SIZE + 1));
    }

    #[tokio::test]
    async fn truncated_payload_is_io_error() {
        let mut wire = encode_chunk(b"abcdef").unwrap();
        wire.truncate(4);
        let mut buffered = BufferedReader::new(wire.as_slice());
        let mut reader = PacketReader::new(&mut buffered);
        assert!(matches!(
            reader.read_multi_buffer().await,
            Err(MuxError::Io(_))
        ));
    }

    #[test]
    fn encode_chunk_rejects_payload_over_u16() {
        let max = vec![0u8; usize::from(u16::MAX)];
        let chunk = encode_chunk(&max).unwrap();
        assert_eq!(&chunk[..2], &[0xff, 0xff]);
        assert_eq!(chunk.len(), 2 + max.len());

        let over = vec![0u8; usize::from(u16::MAX) + 1];
        assert!(matches!(
            encode_chunk(&over),
            Err(MuxError::ChunkTooLarge(n)) if n == over.len()
        ));
    }

    #[test]
    fn transfer_type_parsing() {
        assert_eq!("stream".parse::<TransferType>().unwrap(), TransferType::Stream);
        assert_eq!("Packet".parse::<TransferType>().unwrap(), TransferType::Packet);
        assert!("bogus".parse::<TransferType>().is_err());
        assert_eq!(TransferType::Packet.to_string(), "packet");
    }
}
